//! Driver and serial configuration.
//!
//! Defaults reproduce what a stock Myo and BLED112 expect; embedding
//! applications can load overrides through serde.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bgapi::{BdAddr, DiscoverMode};
use crate::errors::{DriverError, Result};
use crate::myo::{self, EmgMode, ImuMode, LedColors};

// ============================================================================
// Constants
// ============================================================================

/// The dongle is a CDC device and ignores the baud rate, but one must be set.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Upper bound on a single blocking read; also the deadline evaluation period.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Nominal spacing of EMG notifications (two 200 Hz frames each).
pub const DEFAULT_EMG_PERIOD: Duration = Duration::from_millis(10);

// Connection interval limits in 1.25 ms units, supervision timeout in 10 ms units.
const INTERVAL_RANGE: std::ops::RangeInclusive<u16> = 6..=3200;
const SUPERVISION_RANGE: std::ops::RangeInclusive<u16> = 10..=3200;

// ============================================================================
// Serial
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device file or port name, e.g. `/dev/ttyACM0` or `COM3`.
    pub path: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(DriverError::Config("serial path is empty".into()));
        }
        if self.read_timeout.is_zero() {
            return Err(DriverError::Config("read timeout must be positive".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Parameters of `gap_connect_direct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// 1.25 ms units.
    pub interval_min: u16,
    /// 1.25 ms units.
    pub interval_max: u16,
    /// 10 ms units.
    pub supervision_timeout: u16,
    pub latency: u16,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        // 7.5 ms interval, 640 ms supervision timeout.
        Self {
            interval_min: 6,
            interval_max: 6,
            supervision_timeout: 64,
            latency: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Byte string an advertisement must contain to be accepted.
    pub signature: Vec<u8>,
    /// Accept only this device address when set.
    pub target_address: Option<BdAddr>,
    pub discover_mode: DiscoverMode,
    pub connection: ConnectionParameters,
    pub emg_mode: EmgMode,
    pub imu_mode: ImuMode,
    pub never_sleep: bool,
    pub vibrate_on_connect: bool,
    pub leds: Option<LedColors>,
    /// Resolve handles by walking the GATT table instead of assuming firmware 1.x layout.
    pub discover_handles: bool,
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    pub scan_timeout: Duration,
    /// How long teardown waits for the disconnect to be acknowledged.
    pub disconnect_timeout: Duration,
    /// Retries per command or scan before giving up.
    pub max_retries: u32,
    pub emg_period: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            signature: myo::myo_uuid(myo::CONTROL_SERVICE).to_vec(),
            target_address: None,
            discover_mode: DiscoverMode::Generic,
            connection: ConnectionParameters::default(),
            emg_mode: EmgMode::Raw,
            imu_mode: ImuMode::Data,
            never_sleep: true,
            vibrate_on_connect: true,
            leds: None,
            discover_handles: true,
            command_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(1),
            max_retries: 3,
            emg_period: DEFAULT_EMG_PERIOD,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.signature.is_empty() {
            return Err(DriverError::Config("advertisement signature is empty".into()));
        }
        let c = &self.connection;
        if !INTERVAL_RANGE.contains(&c.interval_min)
            || !INTERVAL_RANGE.contains(&c.interval_max)
            || c.interval_min > c.interval_max
        {
            return Err(DriverError::Config(format!(
                "connection interval {}..{} outside {:?}",
                c.interval_min, c.interval_max, INTERVAL_RANGE
            )));
        }
        if !SUPERVISION_RANGE.contains(&c.supervision_timeout) {
            return Err(DriverError::Config(format!(
                "supervision timeout {} outside {:?}",
                c.supervision_timeout, SUPERVISION_RANGE
            )));
        }
        for (name, value) in [
            ("command_timeout", self.command_timeout),
            ("connect_timeout", self.connect_timeout),
            ("scan_timeout", self.scan_timeout),
            ("emg_period", self.emg_period),
        ] {
            if value.is_zero() {
                return Err(DriverError::Config(format!("{name} must be positive")));
            }
        }
        if self.emg_mode == EmgMode::Off && self.imu_mode == ImuMode::Off {
            return Err(DriverError::Config("both EMG and IMU streams are off".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DriverConfig::default().validate().unwrap();
        SerialConfig::new("/dev/ttyACM0").validate().unwrap();
    }

    #[test]
    fn rejects_inverted_interval_and_silent_armband() {
        let mut config = DriverConfig::default();
        config.connection.interval_min = 40;
        config.connection.interval_max = 6;
        assert!(matches!(config.validate(), Err(DriverError::Config(_))));

        let config = DriverConfig {
            emg_mode: EmgMode::Off,
            imu_mode: ImuMode::Off,
            ..DriverConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(SerialConfig::new(" ").validate().is_err());
    }
}
