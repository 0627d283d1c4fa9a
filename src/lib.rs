//! Myo armband driver for the BLED112 USB Bluetooth dongle.
//!
//! The dongle enumerates as a serial device and speaks BGAPI, a small binary
//! command/event protocol. This crate uses it to find a Myo armband, connect,
//! switch on its EMG and IMU streams, and record the samples to CSV.
//!
//! # Timing
//!
//! Samples carry no device timestamp. Each notification is stamped with the
//! host time it was read, relative to the moment streaming began. An EMG
//! notification holds two 200 Hz frames; the second is stamped half a
//! notification period (5 ms by default) after the first. Notifications read
//! back to back are spread one period apart so EMG time never decreases.
//!
//! # Layers
//!
//! bytes -> [`framer`] -> [`bgapi`] -> [`link`] -> [`decoder`] -> [`recorder`],
//! driven by a [`Session`] over a [`Transport`].

pub mod bgapi;
pub mod config;
pub mod decoder;
pub mod errors;
pub mod framer;
pub mod link;
pub mod logging;
pub mod myo;
pub mod recorder;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bgapi::BdAddr;
pub use config::{DriverConfig, SerialConfig};
pub use decoder::{EmgSample, ImuSample, Sample};
pub use errors::{DriverError, Result};
pub use myo::{EmgMode, FirmwareVersion, ImuMode, LedColors};
pub use recorder::{CsvSink, Sink};
pub use session::{CancelToken, Session, SessionEnd, SessionSummary};
pub use transport::{SerialTransport, Transport};
