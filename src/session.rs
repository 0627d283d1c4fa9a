//! The recording loop.
//!
//! One thread owns the transport. Each iteration reads whatever arrived
//! (bounded by the transport's read timeout), runs it through framer, codec
//! and link, carries out the resulting actions and then lets the link check
//! its deadlines.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::bgapi::{self, BdAddr, Command};
use crate::config::DriverConfig;
use crate::decoder::SampleDecoder;
use crate::errors::{DriverError, Result};
use crate::framer::Framer;
use crate::link::{Action, Link};
use crate::myo::FirmwareVersion;
use crate::recorder::{Recorder, Sink};
use crate::transport::Transport;

const READ_CHUNK: usize = 512;

/// Cooperative stop request, shared with signal handlers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the session to disconnect and return. Safe from a signal handler.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionEnd {
    /// The armband or dongle ended the link.
    DeviceDisconnected { reason: u16 },
    /// The [`CancelToken`] was raised.
    Cancelled,
}

/// What a finished session connected to and recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub peer: Option<BdAddr>,
    pub firmware: Option<FirmwareVersion>,
    /// Rows handed to the sink, two per EMG notification.
    pub emg_rows: u64,
    pub imu_rows: u64,
    pub end: SessionEnd,
}

/// One recording run: owns the transport, drives the [`Link`] and feeds the
/// recorder.
pub struct Session<T: Transport, S: Sink> {
    transport: T,
    framer: Framer,
    link: Link,
    recorder: Recorder<S>,
    decoder: Option<SampleDecoder>,
    emg_period: Duration,
    disconnect_timeout: Duration,
    cancel: CancelToken,
    unknown_handles: HashSet<u16>,
    /// Earliest stream time the next EMG notification may be stamped with.
    next_emg: Option<Duration>,
    closed: Option<u16>,
}

impl<T: Transport, S: Sink> Session<T, S> {
    /// Validate `config` and prepare a session. Nothing is written to the
    /// transport until [`Session::run`].
    pub fn new(transport: T, sink: S, config: &DriverConfig, cancel: CancelToken) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            framer: Framer::new(),
            link: Link::new(config),
            recorder: Recorder::new(sink),
            decoder: None,
            emg_period: config.emg_period,
            disconnect_timeout: config.disconnect_timeout,
            cancel,
            unknown_handles: HashSet::new(),
            next_emg: None,
            closed: None,
        })
    }

    /// Connect, stream and record until the link closes, the token is
    /// cancelled or a fatal error occurs. Teardown happens in every case.
    pub fn run(mut self) -> Result<SessionSummary> {
        match self.drive() {
            Ok(end) => self.finish(end),
            Err(e) => {
                self.abort(&e);
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<SessionEnd> {
        let now = Instant::now();
        let actions = self.link.start(now);
        self.apply(actions, now)?;

        let mut buf = [0u8; READ_CHUNK];
        loop {
            if self.cancel.is_cancelled() {
                info!("cancel requested");
                self.farewell()?;
                return Ok(SessionEnd::Cancelled);
            }

            let n = self.transport.read(&mut buf)?;
            let now = Instant::now();
            if n > 0 {
                self.framer.push(&buf[..n]);
                self.pump(now)?;
            }
            let actions = self.link.poll(now)?;
            self.apply(actions, now)?;

            if let Some(reason) = self.closed {
                return Ok(SessionEnd::DeviceDisconnected { reason });
            }
        }
    }

    /// Decode and dispatch every complete packet in the framer.
    fn pump(&mut self, now: Instant) -> Result<()> {
        while let Some(packet) = self.framer.next_packet()? {
            let message = match bgapi::decode(&packet) {
                Ok(message) => message,
                Err(e) if e.is_recoverable() => {
                    debug!("dropping packet: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let actions = self.link.handle(message, now)?;
            self.apply(actions, now)?;
        }
        Ok(())
    }

    fn apply(&mut self, actions: Vec<Action>, now: Instant) -> Result<()> {
        for action in actions {
            match action {
                Action::Send(command) => self.send(&command)?,
                Action::StreamingStarted(handles) => {
                    self.decoder = Some(SampleDecoder::new(handles, self.emg_period));
                    self.recorder.begin(now);
                    info!(
                        "recording: peer={}",
                        self.link
                            .peer()
                            .map_or_else(|| "unknown".to_string(), |p| p.to_string())
                    );
                }
                Action::Notification { handle, value } => self.record(handle, &value, now)?,
                Action::Closed { reason } => self.closed = Some(reason),
            }
        }
        Ok(())
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        debug!("write {}: {:?}", command.name(), command);
        self.transport.write_all(&command.encode())?;
        Ok(())
    }

    fn record(&mut self, handle: u16, value: &[u8], now: Instant) -> Result<()> {
        let Some(decoder) = &self.decoder else {
            return Ok(());
        };
        // Notifications read back to back share one `now`; EMG time must
        // still advance by a full period per notification.
        let is_emg = decoder.handles().emg_index(handle).is_some();
        let mut t0 = self.recorder.elapsed(now);
        if is_emg {
            t0 = self.next_emg.map_or(t0, |next| t0.max(next));
        }
        match decoder.decode(handle, value, t0) {
            Ok(samples) => {
                if is_emg {
                    self.next_emg = Some(t0 + self.emg_period);
                }
                for sample in &samples {
                    self.recorder.record(sample)?;
                }
                Ok(())
            }
            Err(DriverError::UnknownAttribute(handle)) => {
                if self.unknown_handles.insert(handle) {
                    warn!("ignoring notifications on unknown handle {:#06x}", handle);
                }
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                debug!("dropping notification on {:#06x}: {}", handle, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Orderly teardown after cancellation: disconnect and wait briefly for
    /// the dongle to confirm.
    fn farewell(&mut self) -> Result<()> {
        let Some(command) = self.link.shutdown() else {
            return Ok(());
        };
        self.send(&command)?;

        let deadline = Instant::now() + self.disconnect_timeout;
        let mut buf = [0u8; READ_CHUNK];
        while !self.link.state().is_terminal() && Instant::now() < deadline {
            let n = self.transport.read(&mut buf)?;
            if n > 0 {
                self.framer.push(&buf[..n]);
                self.pump(Instant::now())?;
            }
        }
        if !self.link.state().is_terminal() {
            warn!(
                "disconnect not confirmed within {:?}",
                self.disconnect_timeout
            );
        }
        Ok(())
    }

    fn finish(mut self, end: SessionEnd) -> Result<SessionSummary> {
        if let Err(e) = self.transport.close() {
            warn!("closing transport failed: {}", e);
        }
        self.recorder.finish()?;
        let summary = SessionSummary {
            peer: self.link.peer(),
            firmware: self.link.firmware(),
            emg_rows: self.recorder.emg_rows(),
            imu_rows: self.recorder.imu_rows(),
            end,
        };
        info!(
            "session ended: {:?}, emg_rows={}, imu_rows={}",
            summary.end, summary.emg_rows, summary.imu_rows
        );
        Ok(summary)
    }

    /// Best-effort cleanup after a fatal error. Failures here are logged only.
    fn abort(&mut self, cause: &DriverError) {
        error!("session failed: {}", cause);
        if let Some(command) = self.link.fail() {
            if let Err(e) = self.transport.write_all(&command.encode()) {
                warn!("best-effort {} failed: {}", command.name(), e);
            }
        }
        if let Err(e) = self.transport.close() {
            warn!("closing transport failed: {}", e);
        }
        if let Err(e) = self.recorder.finish() {
            warn!("flushing recorder failed: {}", e);
        }
    }
}
