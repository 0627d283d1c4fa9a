use std::io;
use thiserror::Error;

use crate::link::LinkState;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("malformed packet header: declared payload of {declared} bytes exceeds {max}")]
    MalformedHeader { declared: usize, max: usize },
    #[error("unknown message: type={kind:#04x} class={class} command={command}")]
    UnknownMessage { kind: u8, class: u8, command: u8 },
    #[error("malformed {what} payload ({len} bytes)")]
    MalformedPayload { what: &'static str, len: usize },
    #[error("unknown attribute handle {0:#06x}")]
    UnknownAttribute(u16),
    #[error("{command} failed with result {result:#06x}")]
    CommandFailed { command: &'static str, result: u16 },
    #[error("timed out waiting for {what} after {attempts} attempts")]
    ProtocolTimeout { what: &'static str, attempts: u32 },
    #[error("link lost while {state:?} (reason {reason:#06x})")]
    LinkLost { state: LinkState, reason: u16 },
    #[error("service discovery failed: {0}")]
    Discovery(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("sink write failed after {rows_written} durable rows: {source}")]
    SinkWriteFailed {
        rows_written: u64,
        #[source]
        source: io::Error,
    },
}

impl DriverError {
    /// Errors that only cost the message they were raised for; the session keeps running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DriverError::UnknownMessage { .. }
                | DriverError::UnknownAttribute(_)
                | DriverError::MalformedPayload { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_per_message_errors_are_recoverable() {
        assert!(DriverError::UnknownAttribute(0x27).is_recoverable());
        assert!(DriverError::UnknownMessage {
            kind: 0x80,
            class: 0,
            command: 2
        }
        .is_recoverable());
        assert!(!DriverError::MalformedHeader {
            declared: 300,
            max: 256
        }
        .is_recoverable());
        assert!(!DriverError::ProtocolTimeout {
            what: "scan",
            attempts: 4
        }
        .is_recoverable());
    }

    #[test]
    fn sink_failure_mentions_durable_rows() {
        let err = DriverError::SinkWriteFailed {
            rows_written: 12,
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };
        assert_eq!(
            err.to_string(),
            "sink write failed after 12 durable rows: disk full"
        );
    }
}
