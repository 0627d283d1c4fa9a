//! Notification payloads to samples.

use std::time::Duration;

use serde::Serialize;

use crate::errors::{DriverError, Result};
use crate::myo::HandleMap;

const EMG_PAYLOAD_LEN: usize = 16;
const IMU_PAYLOAD_LEN: usize = 20;

pub const ORIENTATION_SCALE: f32 = 16384.0;
/// Raw units per g.
pub const ACCELEROMETER_SCALE: f32 = 2048.0;
/// Raw units per deg/s.
pub const GYROSCOPE_SCALE: f32 = 16.0;

/// One 8-channel EMG frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmgSample {
    /// Time since the stream started.
    pub timestamp: Duration,
    pub channels: [i8; 8],
    /// Which of the four EMG characteristics carried the frame (0-3).
    pub characteristic: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImuSample {
    pub timestamp: Duration,
    /// Unit quaternion `[w, x, y, z]`.
    pub orientation: [f32; 4],
    /// deg/s
    pub gyroscope: [f32; 3],
    /// g
    pub accelerometer: [f32; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Sample {
    Emg(EmgSample),
    Imu(ImuSample),
}

impl Sample {
    pub fn timestamp(&self) -> Duration {
        match self {
            Sample::Emg(s) => s.timestamp,
            Sample::Imu(s) => s.timestamp,
        }
    }
}

/// Maps notification handles to sample kinds and unpacks their values.
#[derive(Debug, Clone)]
pub struct SampleDecoder {
    handles: HandleMap,
    emg_half_period: Duration,
}

impl SampleDecoder {
    pub fn new(handles: HandleMap, emg_period: Duration) -> Self {
        Self {
            handles,
            emg_half_period: emg_period / 2,
        }
    }

    pub fn handles(&self) -> &HandleMap {
        &self.handles
    }

    /// Decode the notification `value` received on `handle` at stream time `t0`.
    ///
    /// An EMG notification holds two consecutive frames; the second is
    /// stamped half a notification period after the first.
    pub fn decode(&self, handle: u16, value: &[u8], t0: Duration) -> Result<Vec<Sample>> {
        if let Some(characteristic) = self.handles.emg_index(handle) {
            if value.len() != EMG_PAYLOAD_LEN {
                return Err(DriverError::MalformedPayload {
                    what: "EMG notification",
                    len: value.len(),
                });
            }
            let frame = |offset: usize| {
                let mut channels = [0i8; 8];
                for (ch, byte) in channels.iter_mut().zip(&value[offset..offset + 8]) {
                    *ch = *byte as i8;
                }
                channels
            };
            return Ok(vec![
                Sample::Emg(EmgSample {
                    timestamp: t0,
                    channels: frame(0),
                    characteristic,
                }),
                Sample::Emg(EmgSample {
                    timestamp: t0 + self.emg_half_period,
                    channels: frame(8),
                    characteristic,
                }),
            ]);
        }

        if self.handles.is_imu(handle) {
            if value.len() != IMU_PAYLOAD_LEN {
                return Err(DriverError::MalformedPayload {
                    what: "IMU notification",
                    len: value.len(),
                });
            }
            let word = |i: usize| i16::from_le_bytes([value[2 * i], value[2 * i + 1]]) as f32;
            return Ok(vec![Sample::Imu(ImuSample {
                timestamp: t0,
                orientation: [
                    word(0) / ORIENTATION_SCALE,
                    word(1) / ORIENTATION_SCALE,
                    word(2) / ORIENTATION_SCALE,
                    word(3) / ORIENTATION_SCALE,
                ],
                accelerometer: [
                    word(4) / ACCELEROMETER_SCALE,
                    word(5) / ACCELEROMETER_SCALE,
                    word(6) / ACCELEROMETER_SCALE,
                ],
                gyroscope: [
                    word(7) / GYROSCOPE_SCALE,
                    word(8) / GYROSCOPE_SCALE,
                    word(9) / GYROSCOPE_SCALE,
                ],
            })]);
        }

        Err(DriverError::UnknownAttribute(handle))
    }
}
