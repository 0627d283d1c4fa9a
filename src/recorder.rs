//! Timestamped sample rows and the CSV files they end up in.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::decoder::Sample;
use crate::errors::{DriverError, Result};

pub const EMG_HEADER: &str = "timestamp,ch0,ch1,ch2,ch3,ch4,ch5,ch6,ch7";
pub const IMU_HEADER: &str = "timestamp,qw,qx,qy,qz,gx,gy,gz,ax,ay,az";

/// Destination of recorded rows. Timestamps are seconds since stream start.
pub trait Sink {
    fn write_emg_row(&mut self, timestamp_s: f64, channels: &[i8; 8]) -> io::Result<()>;

    fn write_imu_row(
        &mut self,
        timestamp_s: f64,
        orientation: &[f32; 4],
        gyroscope: &[f32; 3],
        accelerometer: &[f32; 3],
    ) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn write_emg_row(&mut self, timestamp_s: f64, channels: &[i8; 8]) -> io::Result<()> {
        (**self).write_emg_row(timestamp_s, channels)
    }

    fn write_imu_row(
        &mut self,
        timestamp_s: f64,
        orientation: &[f32; 4],
        gyroscope: &[f32; 3],
        accelerometer: &[f32; 3],
    ) -> io::Result<()> {
        (**self).write_imu_row(timestamp_s, orientation, gyroscope, accelerometer)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

// ============================================================================
// CSV
// ============================================================================

/// One CSV stream per sample kind.
///
/// Each row is formatted in full and handed to the writer in one call, so a
/// failing writer never leaves half a row behind the formatter.
pub struct CsvSink<W: Write> {
    emg: W,
    imu: W,
}

impl CsvSink<BufWriter<File>> {
    /// Create (truncate) both files and write their headers.
    pub fn create(emg_path: impl AsRef<Path>, imu_path: impl AsRef<Path>) -> io::Result<Self> {
        let emg = BufWriter::new(File::create(emg_path.as_ref())?);
        let imu = BufWriter::new(File::create(imu_path.as_ref())?);
        debug!(
            "csv sink: emg={}, imu={}",
            emg_path.as_ref().display(),
            imu_path.as_ref().display()
        );
        Self::from_writers(emg, imu)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writers(mut emg: W, mut imu: W) -> io::Result<Self> {
        emg.write_all(format!("{EMG_HEADER}\n").as_bytes())?;
        imu.write_all(format!("{IMU_HEADER}\n").as_bytes())?;
        Ok(Self { emg, imu })
    }

    /// The (EMG, IMU) writers.
    pub fn get_ref(&self) -> (&W, &W) {
        (&self.emg, &self.imu)
    }
}

fn push_values<T: std::fmt::Display>(row: &mut String, values: &[T]) {
    use std::fmt::Write as _;
    for v in values {
        // Writing into a String cannot fail.
        let _ = write!(row, ",{v}");
    }
}

impl<W: Write> Sink for CsvSink<W> {
    fn write_emg_row(&mut self, timestamp_s: f64, channels: &[i8; 8]) -> io::Result<()> {
        let mut row = format!("{timestamp_s:.6}");
        push_values(&mut row, channels);
        row.push('\n');
        self.emg.write_all(row.as_bytes())
    }

    fn write_imu_row(
        &mut self,
        timestamp_s: f64,
        orientation: &[f32; 4],
        gyroscope: &[f32; 3],
        accelerometer: &[f32; 3],
    ) -> io::Result<()> {
        let mut row = format!("{timestamp_s:.6}");
        push_values(&mut row, orientation);
        push_values(&mut row, gyroscope);
        push_values(&mut row, accelerometer);
        row.push('\n');
        self.imu.write_all(row.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emg.flush()?;
        self.imu.flush()
    }
}

impl<W: Write> Drop for CsvSink<W> {
    fn drop(&mut self) {
        if let Err(e) = Sink::flush(self) {
            warn!("csv sink flush on drop failed: {}", e);
        }
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Stamps samples relative to the stream start and counts what reached the sink.
pub struct Recorder<S: Sink> {
    sink: S,
    start: Option<Instant>,
    emg_rows: u64,
    imu_rows: u64,
}

impl<S: Sink> Recorder<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            start: None,
            emg_rows: 0,
            imu_rows: 0,
        }
    }

    /// Anchor the stream start. Later calls keep the first anchor.
    pub fn begin(&mut self, now: Instant) {
        self.start.get_or_insert(now);
    }

    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }

    /// Stream time of `now`; zero before [`Recorder::begin`].
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    pub fn record(&mut self, sample: &Sample) -> Result<()> {
        let t = sample.timestamp().as_secs_f64();
        let written = match sample {
            Sample::Emg(emg) => self.sink.write_emg_row(t, &emg.channels),
            Sample::Imu(imu) => self.sink.write_imu_row(
                t,
                &imu.orientation,
                &imu.gyroscope,
                &imu.accelerometer,
            ),
        };
        written.map_err(|source| DriverError::SinkWriteFailed {
            rows_written: self.rows(),
            source,
        })?;
        match sample {
            Sample::Emg(_) => self.emg_rows += 1,
            Sample::Imu(_) => self.imu_rows += 1,
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.sink
            .flush()
            .map_err(|source| DriverError::SinkWriteFailed {
                rows_written: self.rows(),
                source,
            })
    }

    pub fn emg_rows(&self) -> u64 {
        self.emg_rows
    }

    pub fn imu_rows(&self) -> u64 {
        self.imu_rows
    }

    pub fn rows(&self) -> u64 {
        self.emg_rows + self.imu_rows
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{EmgSample, ImuSample};
    use crate::testing::FailingSink;

    fn emg(ms: u64, channels: [i8; 8]) -> Sample {
        Sample::Emg(EmgSample {
            timestamp: Duration::from_millis(ms),
            channels,
            characteristic: 0,
        })
    }

    fn imu(ms: u64) -> Sample {
        Sample::Imu(ImuSample {
            timestamp: Duration::from_millis(ms),
            orientation: [1.0, 0.0, -0.5, 0.25],
            gyroscope: [1.0, 0.0, 0.0],
            accelerometer: [0.0, -1.0, 0.0625],
        })
    }

    #[test]
    fn csv_rows_are_exact() {
        let mut recorder = Recorder::new(CsvSink::from_writers(Vec::new(), Vec::new()).unwrap());
        recorder.record(&emg(0, [1, -2, 3, -4, 5, -6, 7, -128])).unwrap();
        recorder.record(&imu(20)).unwrap();
        recorder.record(&emg(5, [0; 8])).unwrap();
        recorder.finish().unwrap();

        let (emg_out, imu_out) = recorder.sink().get_ref();
        assert_eq!(
            String::from_utf8(emg_out.clone()).unwrap(),
            "timestamp,ch0,ch1,ch2,ch3,ch4,ch5,ch6,ch7\n\
             0.000000,1,-2,3,-4,5,-6,7,-128\n\
             0.005000,0,0,0,0,0,0,0,0\n"
        );
        assert_eq!(
            String::from_utf8(imu_out.clone()).unwrap(),
            "timestamp,qw,qx,qy,qz,gx,gy,gz,ax,ay,az\n\
             0.020000,1,0,-0.5,0.25,1,0,0,0,-1,0.0625\n"
        );
        assert_eq!((recorder.emg_rows(), recorder.imu_rows()), (2, 1));
    }

    #[test]
    fn sink_failure_reports_durable_rows() {
        let mut sink = FailingSink::new(2);
        let mut recorder = Recorder::new(&mut sink);
        recorder.record(&emg(0, [0; 8])).unwrap();
        recorder.record(&imu(1)).unwrap();
        let err = recorder.record(&emg(5, [0; 8])).unwrap_err();
        assert!(matches!(err, DriverError::SinkWriteFailed { rows_written: 2, .. }));
        assert_eq!(recorder.rows(), 2);
        drop(recorder);
        assert_eq!(sink.rows.len(), 2);
    }

    #[test]
    fn elapsed_is_relative_to_the_first_begin() {
        let mut recorder = Recorder::new(CsvSink::from_writers(io::sink(), io::sink()).unwrap());
        let t0 = Instant::now();
        assert_eq!(recorder.elapsed(t0 + Duration::from_secs(3)), Duration::ZERO);
        recorder.begin(t0);
        recorder.begin(t0 + Duration::from_secs(1));
        assert!(recorder.is_started());
        assert_eq!(
            recorder.elapsed(t0 + Duration::from_millis(1500)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn files_are_flushed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let emg_path = dir.path().join("1700000000_emg.csv");
        let imu_path = dir.path().join("1700000000_imu.csv");
        {
            let mut sink = CsvSink::create(&emg_path, &imu_path).unwrap();
            sink.write_emg_row(0.5, &[9; 8]).unwrap();
        }
        let emg = std::fs::read_to_string(&emg_path).unwrap();
        assert_eq!(emg.lines().nth(1), Some("0.500000,9,9,9,9,9,9,9,9"));
        let imu = std::fs::read_to_string(&imu_path).unwrap();
        assert_eq!(imu, format!("{IMU_HEADER}\n"));
    }
}
