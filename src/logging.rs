use std::sync::Once;

use env_logger::{Builder, Env};
use log::LevelFilter;

static LOG_ONCE: Once = Once::new();

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "MYO_LOG";

/// Parse a level name such as `debug`; `None` for anything `log` does not know.
pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// A single level for the whole crate, if one was asked for. `None` leaves
/// filtering to `RUST_LOG`.
fn resolve_level(explicit: Option<LevelFilter>, myo_log: Option<&str>) -> Option<LevelFilter> {
    explicit.or_else(|| myo_log.and_then(parse_level))
}

/// Initialize stderr logging from `MYO_LOG`, then `RUST_LOG` (default `info`).
pub fn init_logging() {
    init_logging_with(None);
}

/// Initialize stderr logging. `level` takes precedence over `MYO_LOG`, which
/// takes precedence over `RUST_LOG`. Only the first call installs a logger.
pub fn init_logging_with(level: Option<LevelFilter>) {
    LOG_ONCE.call_once(|| {
        let myo_log = std::env::var(LOG_ENV).ok();
        let mut builder = match resolve_level(level, myo_log.as_deref()) {
            Some(level) => {
                let mut builder = Builder::new();
                builder.filter_level(level);
                builder
            }
            None => Builder::from_env(Env::default().default_filter_or("info")),
        };
        builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}
