use std::path::PathBuf;
use std::process::exit;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use myo_bled112::logging::{init_logging_with, parse_level};
use myo_bled112::{
    BdAddr, CancelToken, CsvSink, DriverConfig, EmgMode, ImuMode, SerialConfig, SerialTransport,
    Session, SessionEnd,
};

#[derive(Parser, Debug)]
#[command(
    name = "myo-logger",
    about = "Record EMG and IMU data from a Myo armband through a BLED112 dongle"
)]
struct Args {
    /// Serial device of the dongle (e.g. /dev/ttyACM0, COM3)
    #[arg(long)]
    tty: String,
    /// Only connect to the armband with this address (e.g. d4:2a:1f:0c:99:e1)
    #[arg(long)]
    mac: Option<BdAddr>,
    #[arg(long, value_enum, default_value_t = EmgMode::Raw)]
    emg_mode: EmgMode,
    #[arg(long, value_enum, default_value_t = ImuMode::Data)]
    imu_mode: ImuMode,
    /// Directory for the CSV files
    #[arg(short, long, default_value = "./")]
    outdir: PathBuf,
    /// Skip the short vibration on connect
    #[arg(long)]
    no_vibrate: bool,
    /// Let the armband go to sleep when it is not moving
    #[arg(long)]
    allow_sleep: bool,
    /// Assume the firmware 1.x handle layout instead of discovering it
    #[arg(long)]
    no_discovery: bool,
    /// Log level (off, error, warn, info, debug, trace); overrides MYO_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_deref() {
        Some(name) => match parse_level(name) {
            Some(level) => Some(level),
            None => bail!("unknown log level {name:?}"),
        },
        None => None,
    };
    init_logging_with(level);

    let config = DriverConfig {
        target_address: args.mac,
        emg_mode: args.emg_mode,
        imu_mode: args.imu_mode,
        never_sleep: !args.allow_sleep,
        vibrate_on_connect: !args.no_vibrate,
        discover_handles: !args.no_discovery,
        ..DriverConfig::default()
    };
    let serial = SerialConfig::new(&args.tty);
    serial.validate()?;

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before 1970")?
        .as_secs();
    let emg_path = args.outdir.join(format!("{stamp}_emg.csv"));
    let imu_path = args.outdir.join(format!("{stamp}_imu.csv"));

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("failed to install the interrupt handler")?;

    let transport = SerialTransport::open(&serial)
        .with_context(|| format!("failed to open dongle at {}", args.tty))?;
    let sink = CsvSink::create(&emg_path, &imu_path)
        .with_context(|| format!("failed to create CSV files in {}", args.outdir.display()))?;
    info!("writing {} and {}", emg_path.display(), imu_path.display());

    println!("Recording from {} (Ctrl-C to stop)...", args.tty);
    let summary = Session::new(transport, sink, &config, cancel)?
        .run()
        .context("recording session failed")?;

    match summary.end {
        SessionEnd::Cancelled => println!("Stopped."),
        SessionEnd::DeviceDisconnected { reason } => {
            println!("Armband disconnected (reason {reason:#06x}).")
        }
    }
    if let Some(peer) = summary.peer {
        print!("Armband {peer}");
        match summary.firmware {
            Some(firmware) => println!(", firmware {firmware}"),
            None => println!(),
        }
    }
    println!("EMG: {} rows -> {}", summary.emg_rows, emg_path.display());
    println!("IMU: {} rows -> {}", summary.imu_rows, imu_path.display());
    Ok(())
}
