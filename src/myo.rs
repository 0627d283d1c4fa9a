//! Myo armband GATT layout and command payloads.
//!
//! Myo-specific UUIDs share the base `d506XXXX-a904-deb9-4748-2c7f4a124842`.
//! Everything the host asks of the armband (streaming modes, sleep, LEDs,
//! vibration) is a write to the command characteristic.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::DriverConfig;
use crate::errors::{DriverError, Result};

// ============================================================================
// UUIDs
// ============================================================================

/// Myo base UUID in wire (little-endian) order; bytes 12-13 carry the short id.
const MYO_BASE_UUID: [u8; 16] = [
    0x42, 0x48, 0x12, 0x4a, 0x7f, 0x2c, 0x48, 0x47, 0xb9, 0xde, 0x04, 0xa9, 0x00, 0x00, 0x06, 0xd5,
];

pub const CONTROL_SERVICE: u16 = 0x0001;
pub const FIRMWARE_VERSION: u16 = 0x0201;
pub const COMMAND: u16 = 0x0401;
pub const IMU_DATA: u16 = 0x0402;
pub const EMG_DATA: [u16; 4] = [0x0105, 0x0205, 0x0305, 0x0405];

// Bluetooth SIG assigned numbers.
pub const GATT_PRIMARY_SERVICE: u16 = 0x2800;
pub const GATT_SECONDARY_SERVICE: u16 = 0x2801;
pub const GATT_CHARACTERISTIC: u16 = 0x2803;
pub const GATT_CCCD: u16 = 0x2902;
pub const DEVICE_NAME: u16 = 0x2A00;
pub const BATTERY_LEVEL: u16 = 0x2A19;

/// Written to a CCCD to enable notifications.
pub const ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

/// Full 128-bit Myo UUID for `short`, in wire order.
pub const fn myo_uuid(short: u16) -> [u8; 16] {
    let mut uuid = MYO_BASE_UUID;
    let le = short.to_le_bytes();
    uuid[12] = le[0];
    uuid[13] = le[1];
    uuid
}

/// UUID as found during information discovery: 16-bit SIG ids or 128-bit
/// vendor ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Uuid {
    Short(u16),
    Myo(u16),
    Other,
}

impl Uuid {
    fn parse(bytes: &[u8]) -> Self {
        match bytes.len() {
            2 => Uuid::Short(u16::from_le_bytes([bytes[0], bytes[1]])),
            16 if bytes[..12] == MYO_BASE_UUID[..12] && bytes[14..] == MYO_BASE_UUID[14..] => {
                Uuid::Myo(u16::from_le_bytes([bytes[12], bytes[13]]))
            }
            _ => Uuid::Other,
        }
    }

    /// Attribute types that end the descriptor list of the previous characteristic.
    fn starts_declaration(self) -> bool {
        matches!(
            self,
            Uuid::Short(GATT_PRIMARY_SERVICE | GATT_SECONDARY_SERVICE | GATT_CHARACTERISTIC)
        )
    }
}

// ============================================================================
// Attribute handles
// ============================================================================

/// Value handle of a notifying characteristic and its CCCD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub value: u16,
    pub cccd: u16,
}

/// Attribute handles of everything the logger touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleMap {
    pub firmware: u16,
    pub command: u16,
    pub device_name: Option<u16>,
    pub battery: Option<u16>,
    pub imu: Characteristic,
    pub emg: [Characteristic; 4],
}

impl Default for HandleMap {
    /// Layout published by firmware 1.x armbands.
    fn default() -> Self {
        Self {
            firmware: 0x17,
            command: 0x19,
            device_name: Some(0x03),
            battery: Some(0x11),
            imu: Characteristic {
                value: 0x1c,
                cccd: 0x1d,
            },
            emg: [
                Characteristic {
                    value: 0x2b,
                    cccd: 0x2c,
                },
                Characteristic {
                    value: 0x2e,
                    cccd: 0x2f,
                },
                Characteristic {
                    value: 0x31,
                    cccd: 0x32,
                },
                Characteristic {
                    value: 0x34,
                    cccd: 0x35,
                },
            ],
        }
    }
}

impl HandleMap {
    /// Resolve handles from `(handle, uuid)` pairs reported by information
    /// discovery. The CCCD of a characteristic is the first 0x2902 descriptor
    /// after its value handle and before the next declaration.
    pub fn from_discovery(found: &[(u16, Vec<u8>)]) -> Result<Self> {
        let table: BTreeMap<u16, Uuid> = found
            .iter()
            .map(|(handle, uuid)| (*handle, Uuid::parse(uuid)))
            .collect();

        let find = |wanted: Uuid| {
            table
                .iter()
                .find(|(_, uuid)| **uuid == wanted)
                .map(|(handle, _)| *handle)
        };
        let require = |wanted: Uuid, name: &str| {
            find(wanted).ok_or_else(|| DriverError::Discovery(format!("no {name} characteristic")))
        };
        let notifying = |short: u16, name: &str| -> Result<Characteristic> {
            let value = require(Uuid::Myo(short), name)?;
            let cccd = table
                .range((Excluded(value), Unbounded))
                .take_while(|(_, uuid)| !uuid.starts_declaration())
                .find(|(_, uuid)| **uuid == Uuid::Short(GATT_CCCD))
                .map(|(handle, _)| *handle)
                .ok_or_else(|| DriverError::Discovery(format!("{name} has no CCCD")))?;
            Ok(Characteristic { value, cccd })
        };

        let map = Self {
            firmware: require(Uuid::Myo(FIRMWARE_VERSION), "firmware version")?,
            command: require(Uuid::Myo(COMMAND), "command")?,
            device_name: find(Uuid::Short(DEVICE_NAME)),
            battery: find(Uuid::Short(BATTERY_LEVEL)),
            imu: notifying(IMU_DATA, "IMU data")?,
            emg: [
                notifying(EMG_DATA[0], "EMG data 0")?,
                notifying(EMG_DATA[1], "EMG data 1")?,
                notifying(EMG_DATA[2], "EMG data 2")?,
                notifying(EMG_DATA[3], "EMG data 3")?,
            ],
        };
        debug!("resolved {} attributes into {:?}", found.len(), map);
        Ok(map)
    }

    /// Index (0-3) of the EMG characteristic whose value handle is `handle`.
    pub fn emg_index(&self, handle: u16) -> Option<u8> {
        self.emg
            .iter()
            .position(|c| c.value == handle)
            .map(|i| i as u8)
    }

    pub fn is_imu(&self, handle: u16) -> bool {
        self.imu.value == handle
    }
}

// ============================================================================
// Firmware
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub hardware_rev: u16,
}

impl FirmwareVersion {
    /// Parse the firmware characteristic: four little-endian u16.
    pub fn parse(value: &[u8]) -> Result<Self> {
        if value.len() < 8 {
            return Err(DriverError::MalformedPayload {
                what: "firmware version",
                len: value.len(),
            });
        }
        let word = |i: usize| u16::from_le_bytes([value[2 * i], value[2 * i + 1]]);
        Ok(Self {
            major: word(0),
            minor: word(1),
            patch: word(2),
            hardware_rev: word(3),
        })
    }

    /// Pre-1.0 firmware needs the legacy unlock and sensor parameter writes.
    pub fn is_legacy(&self) -> bool {
        self.major < 1
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} (hw rev {})",
            self.major, self.minor, self.patch, self.hardware_rev
        )
    }
}

// ============================================================================
// Modes and options
// ============================================================================

/// What the four EMG characteristics stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EmgMode {
    Off = 0x00,
    /// Raw samples with the armband's notch filter applied.
    Filtered = 0x02,
    #[default]
    Raw = 0x03,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ImuMode {
    Off = 0x00,
    /// Orientation, accelerometer and gyroscope at 50 Hz.
    #[default]
    Data = 0x01,
    /// Same payload without on-board sensor fusion corrections.
    Raw = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepMode {
    Normal = 0,
    NeverSleep = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vibration {
    None = 0,
    Short = 1,
    Medium = 2,
    Long = 3,
}

/// RGB colours of the logo and bar LEDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedColors {
    pub logo: [u8; 3],
    pub line: [u8; 3],
}

// ============================================================================
// Command characteristic payloads
// ============================================================================

// Command ids; every payload is `id, payload length, payload...`.
const CMD_SET_MODE: u8 = 0x01;
const CMD_VIBRATE: u8 = 0x03;
const CMD_SET_LEDS: u8 = 0x06;
const CMD_SET_SLEEP_MODE: u8 = 0x09;

// Classifier stays off; poses are not recorded.
const CLASSIFIER_OFF: u8 = 0x00;

pub fn set_mode(emg: EmgMode, imu: ImuMode) -> Vec<u8> {
    vec![CMD_SET_MODE, 3, emg as u8, imu as u8, CLASSIFIER_OFF]
}

pub fn vibrate(length: Vibration) -> Vec<u8> {
    vec![CMD_VIBRATE, 1, length as u8]
}

pub fn set_sleep_mode(mode: SleepMode) -> Vec<u8> {
    vec![CMD_SET_SLEEP_MODE, 1, mode as u8]
}

pub fn set_leds(colors: &LedColors) -> Vec<u8> {
    let mut payload = vec![CMD_SET_LEDS, 6];
    payload.extend_from_slice(&colors.logo);
    payload.extend_from_slice(&colors.line);
    payload
}

/// Sent by the vendor's desktop software to pre-1.0 armbands before anything else.
pub fn legacy_unlock() -> Vec<u8> {
    vec![0x01, 0x02, 0x00, 0x00]
}

/// Sensor parameters pre-1.0 armbands need before they stream.
pub fn legacy_sensor_parameters() -> Vec<u8> {
    const SENSOR_HZ: u16 = 1000;
    const EMG_HZ: u16 = 50;
    const EMG_SMOOTHING: u8 = 100;
    const IMU_HZ: u8 = 50;

    let mut payload = vec![0x02, 0x09, 0x02, 0x01];
    payload.extend_from_slice(&SENSOR_HZ.to_le_bytes());
    payload.extend_from_slice(&[
        EMG_SMOOTHING,
        (SENSOR_HZ / EMG_HZ) as u8,
        IMU_HZ,
        0,
        0,
    ]);
    payload
}

/// Attribute writes that take a connected armband to streaming, in order.
pub fn setup_writes(
    handles: &HandleMap,
    firmware: &FirmwareVersion,
    config: &DriverConfig,
) -> Vec<(u16, Vec<u8>)> {
    let emg_on = config.emg_mode != EmgMode::Off;
    let imu_on = config.imu_mode != ImuMode::Off;
    let emg_cccds = handles
        .emg
        .iter()
        .filter(|_| emg_on)
        .map(|c| (c.cccd, ENABLE_NOTIFICATIONS.to_vec()));

    let mut writes = Vec::new();
    if firmware.is_legacy() {
        writes.push((handles.command, legacy_unlock()));
        writes.extend(emg_cccds);
        if imu_on {
            writes.push((handles.imu.cccd, ENABLE_NOTIFICATIONS.to_vec()));
        }
        writes.push((handles.command, legacy_sensor_parameters()));
        return writes;
    }

    if imu_on {
        writes.push((handles.imu.cccd, ENABLE_NOTIFICATIONS.to_vec()));
    }
    writes.extend(emg_cccds);
    writes.push((handles.command, set_mode(config.emg_mode, config.imu_mode)));
    if config.never_sleep {
        writes.push((handles.command, set_sleep_mode(SleepMode::NeverSleep)));
    }
    if let Some(colors) = &config.leds {
        writes.push((handles.command, set_leds(colors)));
    }
    if config.vibrate_on_connect {
        writes.push((handles.command, vibrate(Vibration::Short)));
    }
    writes
}
