//! Connection state machine.
//!
//! `Link` owns no I/O. It consumes decoded BGAPI messages and clock ticks and
//! answers with [`Action`]s for the session to carry out. At most one command
//! is in flight: the next one is sent only once the previous one has fully
//! completed (its response and, where the procedure has one, the follow-up
//! event for the same connection and attribute).

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::bgapi::{BdAddr, BgapiMessage, Command, ConnectionStatus, Response, ScanResponse};
use crate::config::DriverConfig;
use crate::errors::{DriverError, Result};
use crate::myo::{self, FirmwareVersion, HandleMap};

/// Connection handles the dongle may still hold from an earlier run.
const STALE_CONNECTIONS: u8 = 3;

/// Where the link to the armband stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing sent yet.
    Idle,
    /// Waiting for an advertisement that carries the signature.
    Scanning,
    /// connect-direct issued, waiting for the link to come up.
    Connecting,
    /// Resolving attribute handles and reading firmware, name and battery.
    ServiceDiscovery,
    /// Writing CCCDs and command-characteristic settings.
    Configuring,
    /// Notifications are forwarded to the session.
    Streaming,
    Disconnected,
    Error,
}

impl LinkState {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Error)
    }
}

/// What the session has to do after feeding the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Command),
    /// Configuration finished; notifications on these handles follow.
    StreamingStarted(HandleMap),
    Notification { handle: u16, value: Vec<u8> },
    /// The armband went away while streaming or after a requested disconnect.
    Closed { reason: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Cleanup,
    Scan,
    StopScan,
    Connect,
    Discover,
    ReadFirmware,
    ReadName,
    ReadBattery,
    Configure,
}

#[derive(Debug, Clone)]
struct Step {
    command: Command,
    purpose: Purpose,
    tolerate_failure: bool,
    /// Timeouts suffered so far.
    attempts: u32,
}

impl Step {
    fn new(command: Command, purpose: Purpose) -> Self {
        Self {
            command,
            purpose,
            tolerate_failure: false,
            attempts: 0,
        }
    }

    fn tolerated(command: Command, purpose: Purpose) -> Self {
        Self {
            tolerate_failure: true,
            ..Self::new(command, purpose)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitResponse,
    AwaitEvent,
}

#[derive(Debug)]
struct Pending {
    step: Step,
    stage: Stage,
    deadline: Instant,
}

/// Sans-I/O connection state machine.
///
/// Fed decoded messages and clock ticks, it answers with [`Action`]s and
/// keeps at most one command outstanding at the dongle.
pub struct Link {
    config: DriverConfig,
    state: LinkState,
    queue: VecDeque<Step>,
    pending: Option<Pending>,
    found: Vec<(u16, Vec<u8>)>,
    handles: Option<HandleMap>,
    firmware: Option<FirmwareVersion>,
    scan_deadline: Option<Instant>,
    scan_restarts: u32,
    peer: Option<BdAddr>,
    /// Handle returned by connect-direct; bound once the link is up.
    connection: Option<u8>,
    closing: bool,
}

impl Link {
    /// A link in [`LinkState::Idle`]; nothing is sent before [`Link::start`].
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            config: config.clone(),
            state: LinkState::Idle,
            queue: VecDeque::new(),
            pending: None,
            found: Vec::new(),
            handles: None,
            firmware: None,
            scan_deadline: None,
            scan_restarts: 0,
            peer: None,
            connection: None,
            closing: false,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Connection handle, once the dongle reported the link as connected.
    pub fn connection(&self) -> Option<u8> {
        self.connection
    }

    /// Command currently in flight.
    pub fn awaiting(&self) -> Option<&Command> {
        self.pending.as_ref().map(|p| &p.step.command)
    }

    /// Address of the armband chosen during scanning.
    pub fn peer(&self) -> Option<BdAddr> {
        self.peer
    }

    /// Firmware read during service discovery.
    pub fn firmware(&self) -> Option<FirmwareVersion> {
        self.firmware
    }

    /// Attribute handles in use, once resolved.
    pub fn handles(&self) -> Option<&HandleMap> {
        self.handles.as_ref()
    }

    /// Earliest instant at which [`Link::poll`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let pending = self.pending.as_ref().map(|p| p.deadline);
        match (pending, self.scan_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Clear whatever an earlier run left behind on the dongle, then scan.
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        if self.state != LinkState::Idle {
            return Vec::new();
        }
        info!(
            "scanning: signature={} bytes, target={}",
            self.config.signature.len(),
            self.config
                .target_address
                .map_or_else(|| "any".to_string(), |a| a.to_string())
        );
        self.queue
            .push_back(Step::tolerated(Command::ScanStop, Purpose::Cleanup));
        for connection in 0..STALE_CONNECTIONS {
            self.queue.push_back(Step::tolerated(
                Command::Disconnect { connection },
                Purpose::Cleanup,
            ));
        }
        self.queue.push_back(Step::new(
            Command::ScanStart {
                mode: self.config.discover_mode,
            },
            Purpose::Scan,
        ));
        self.state = LinkState::Scanning;

        let mut actions = Vec::new();
        self.advance(now, &mut actions);
        actions
    }

    /// Feed one decoded message.
    pub fn handle(&mut self, message: BgapiMessage, now: Instant) -> Result<Vec<Action>> {
        if self.state.is_terminal() {
            return Ok(Vec::new());
        }
        let mut actions = Vec::new();
        let result = self.on_message(message, now, &mut actions);
        self.settle_or_fail(result, now, actions)
    }

    /// Evaluate deadlines. Call at every suspension point.
    pub fn poll(&mut self, now: Instant) -> Result<Vec<Action>> {
        if self.state.is_terminal() {
            return Ok(Vec::new());
        }
        let result = self.check_deadlines(now);
        self.settle_or_fail(result, now, Vec::new())
    }

    /// Begin an orderly teardown. Returns the command that ends the link, if
    /// one is needed; the link reports `Closed` once the dongle confirms.
    pub fn shutdown(&mut self) -> Option<Command> {
        if self.state.is_terminal() {
            return None;
        }
        self.closing = true;
        self.queue.clear();
        self.pending = None;
        self.scan_deadline = None;
        match self.connection {
            Some(connection) => {
                info!("disconnecting: connection={}", connection);
                Some(Command::Disconnect { connection })
            }
            None => {
                let was_scanning = matches!(self.state, LinkState::Scanning | LinkState::Connecting);
                self.state = LinkState::Disconnected;
                was_scanning.then_some(Command::ScanStop)
            }
        }
    }

    /// Enter `Error` after a fatal failure elsewhere. Returns a best-effort
    /// command that releases the dongle.
    pub fn fail(&mut self) -> Option<Command> {
        let previous = self.state;
        self.state = LinkState::Error;
        self.queue.clear();
        self.pending = None;
        self.scan_deadline = None;
        match self.connection.take() {
            Some(connection) => Some(Command::Disconnect { connection }),
            None if matches!(previous, LinkState::Scanning | LinkState::Connecting) => {
                Some(Command::ScanStop)
            }
            None => None,
        }
    }

    // ------------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------------

    fn on_message(
        &mut self,
        message: BgapiMessage,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        match message {
            BgapiMessage::Response(rsp) => self.on_response(rsp, now),
            BgapiMessage::ScanResponse(adv) => {
                self.on_advertisement(adv);
                Ok(())
            }
            BgapiMessage::ConnectionStatus(status) => {
                self.on_status(status);
                Ok(())
            }
            BgapiMessage::Disconnected { connection, reason } => {
                self.on_disconnected(connection, reason, actions)
            }
            BgapiMessage::AttributeValue {
                connection,
                handle,
                value,
                ..
            } => self.on_value(connection, handle, value, actions),
            BgapiMessage::ProcedureCompleted {
                connection,
                result,
                handle,
            } => self.on_procedure_completed(connection, result, handle),
            BgapiMessage::InformationFound {
                connection,
                handle,
                uuid,
            } => {
                let discovering = matches!(
                    self.awaited_event(),
                    Some(Command::FindInformation { connection: c, .. }) if *c == connection
                );
                if discovering {
                    self.found.push((handle, uuid));
                }
                Ok(())
            }
        }
    }

    fn on_response(&mut self, rsp: Response, now: Instant) -> Result<()> {
        let expected = match &self.pending {
            Some(p) if p.stage == Stage::AwaitResponse && rsp.answers(&p.step.command) => {
                match (p.step.command.connection(), response_connection(&rsp)) {
                    (Some(sent), Some(got)) => sent == got,
                    _ => true,
                }
            }
            _ => false,
        };
        if !expected {
            trace!("ignoring unexpected response {:?}", rsp);
            return Ok(());
        }
        if rsp.result() != 0 {
            return self.step_failed(rsp.result());
        }

        match rsp {
            Response::ScanStart { .. } => {
                self.scan_deadline = Some(now + self.config.scan_timeout);
                self.complete();
            }
            Response::ConnectDirect { connection, .. } => {
                self.connection = Some(connection);
                self.await_event();
            }
            Response::AttributeWrite { .. }
            | Response::AttributeRead { .. }
            | Response::FindInformation { .. } => self.await_event(),
            Response::ScanStop { .. } | Response::Disconnect { .. } => self.complete(),
        }
        Ok(())
    }

    fn on_advertisement(&mut self, adv: ScanResponse) {
        if self.state != LinkState::Scanning || self.peer.is_some() {
            return;
        }
        if !adv.advertises(&self.config.signature) {
            trace!("ignoring {} (no signature)", adv.address);
            return;
        }
        if let Some(target) = self.config.target_address {
            if target != adv.address {
                debug!("ignoring armband {} (want {})", adv.address, target);
                return;
            }
        }

        info!("found armband: address={}, rssi={}", adv.address, adv.rssi);
        self.peer = Some(adv.address);
        self.scan_deadline = None;
        self.queue.retain(|s| s.purpose != Purpose::Scan);
        self.queue
            .push_back(Step::tolerated(Command::ScanStop, Purpose::StopScan));
        let params = self.config.connection;
        self.queue.push_back(Step::new(
            Command::ConnectDirect {
                address: adv.address,
                address_type: adv.address_type,
                interval_min: params.interval_min,
                interval_max: params.interval_max,
                supervision_timeout: params.supervision_timeout,
                latency: params.latency,
            },
            Purpose::Connect,
        ));
        self.state = LinkState::Connecting;
    }

    fn on_status(&mut self, status: ConnectionStatus) {
        let connecting = matches!(self.awaited_event(), Some(Command::ConnectDirect { .. }));
        if !connecting || self.connection != Some(status.connection) || !status.is_connected() {
            trace!("ignoring connection status {:?}", status);
            return;
        }
        info!(
            "connected: connection={}, address={}, interval={}, timeout={}",
            status.connection, status.address, status.interval, status.timeout
        );
        self.complete();
        self.state = LinkState::ServiceDiscovery;
        if self.config.discover_handles {
            self.found.clear();
            self.queue.push_back(Step::new(
                Command::FindInformation {
                    connection: status.connection,
                    start: 0x0001,
                    end: 0xFFFF,
                },
                Purpose::Discover,
            ));
        } else {
            self.handles = Some(HandleMap::default());
            self.queue_reads(status.connection);
        }
    }

    fn on_disconnected(
        &mut self,
        connection: u8,
        reason: u16,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        if self.connection != Some(connection) {
            trace!("ignoring disconnect of connection {}", connection);
            return Ok(());
        }
        self.connection = None;
        if self.state == LinkState::Streaming || self.closing {
            info!("disconnected: reason={:#06x}", reason);
            self.state = LinkState::Disconnected;
            self.queue.clear();
            self.pending = None;
            actions.push(Action::Closed { reason });
            return Ok(());
        }
        Err(DriverError::LinkLost {
            state: self.state,
            reason,
        })
    }

    fn on_value(
        &mut self,
        connection: u8,
        handle: u16,
        value: Vec<u8>,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        if self.connection != Some(connection) {
            return Ok(());
        }
        let read = match self.awaited_event() {
            Some(Command::AttributeRead { handle: h, .. }) if *h == handle => {
                self.pending.as_ref().map(|p| p.step.purpose)
            }
            _ => None,
        };
        if let Some(purpose) = read {
            self.complete();
            return self.on_read(purpose, &value);
        }

        if self.state == LinkState::Streaming && !self.closing {
            actions.push(Action::Notification { handle, value });
        } else {
            trace!("dropping value on {:#06x} in {:?}", handle, self.state);
        }
        Ok(())
    }

    fn on_read(&mut self, purpose: Purpose, value: &[u8]) -> Result<()> {
        match purpose {
            Purpose::ReadFirmware => {
                let firmware = FirmwareVersion::parse(value).map_err(|e| {
                    DriverError::Discovery(format!("unreadable firmware version: {e}"))
                })?;
                info!("firmware: {}", firmware);
                self.firmware = Some(firmware);
            }
            Purpose::ReadName => info!("device name: {}", String::from_utf8_lossy(value)),
            Purpose::ReadBattery => match value.first() {
                Some(level) => info!("battery: {}%", level),
                None => warn!("empty battery level"),
            },
            _ => {}
        }
        Ok(())
    }

    fn on_procedure_completed(&mut self, connection: u8, result: u16, handle: u16) -> Result<()> {
        if self.connection != Some(connection) {
            return Ok(());
        }
        let Some(command) = self.awaited_event().cloned() else {
            return Ok(());
        };
        match command {
            Command::AttributeWrite { handle: h, .. } if h == handle => {
                if result != 0 {
                    return self.step_failed(result);
                }
                self.complete();
            }
            // A successful read ends with its value; this only reports failure.
            Command::AttributeRead { handle: h, .. } if h == handle && result != 0 => {
                return self.step_failed(result);
            }
            Command::FindInformation { connection, .. } => {
                if result != 0 {
                    return self.step_failed(result);
                }
                self.complete();
                let handles = HandleMap::from_discovery(&self.found)?;
                self.handles = Some(handles);
                self.queue_reads(connection);
            }
            _ => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queue management
    // ------------------------------------------------------------------------

    fn queue_reads(&mut self, connection: u8) {
        let Some(handles) = &self.handles else {
            return;
        };
        let mut reads = vec![Step::new(
            Command::AttributeRead {
                connection,
                handle: handles.firmware,
            },
            Purpose::ReadFirmware,
        )];
        if let Some(handle) = handles.device_name {
            reads.push(Step::tolerated(
                Command::AttributeRead { connection, handle },
                Purpose::ReadName,
            ));
        }
        if let Some(handle) = handles.battery {
            reads.push(Step::tolerated(
                Command::AttributeRead { connection, handle },
                Purpose::ReadBattery,
            ));
        }
        self.queue.extend(reads);
    }

    /// Command of the pending step once its response is in.
    fn awaited_event(&self) -> Option<&Command> {
        self.pending
            .as_ref()
            .filter(|p| p.stage == Stage::AwaitEvent)
            .map(|p| &p.step.command)
    }

    fn await_event(&mut self) {
        if let Some(p) = self.pending.as_mut() {
            p.stage = Stage::AwaitEvent;
        }
    }

    fn complete(&mut self) {
        if let Some(p) = self.pending.take() {
            trace!("{} complete", p.step.command.name());
        }
    }

    fn step_failed(&mut self, result: u16) -> Result<()> {
        let Some(p) = self.pending.take() else {
            return Ok(());
        };
        let command = p.step.command.name();
        if p.step.tolerate_failure {
            debug!("{} returned {:#06x}, continuing", command, result);
            return Ok(());
        }
        Err(DriverError::CommandFailed { command, result })
    }

    fn check_deadlines(&mut self, now: Instant) -> Result<()> {
        if self.pending.as_ref().is_some_and(|p| now >= p.deadline) {
            if let Some(p) = self.pending.take() {
                self.retry(p.step)?;
            }
        }

        let scan_expired = self.scan_deadline.is_some_and(|d| now >= d);
        if scan_expired && self.state == LinkState::Scanning && self.peer.is_none() {
            self.scan_deadline = None;
            self.scan_restarts += 1;
            if self.scan_restarts > self.config.max_retries {
                return Err(DriverError::ProtocolTimeout {
                    what: "scan",
                    attempts: self.scan_restarts,
                });
            }
            warn!(
                "no armband found, restarting scan ({}/{})",
                self.scan_restarts, self.config.max_retries
            );
            self.queue
                .push_back(Step::tolerated(Command::ScanStop, Purpose::Scan));
            self.queue.push_back(Step::new(
                Command::ScanStart {
                    mode: self.config.discover_mode,
                },
                Purpose::Scan,
            ));
        }
        Ok(())
    }

    fn retry(&mut self, mut step: Step) -> Result<()> {
        step.attempts += 1;
        let what = step.command.name();
        if step.attempts > self.config.max_retries {
            if step.tolerate_failure {
                warn!("{} timed out {} times, skipping", what, step.attempts);
                return Ok(());
            }
            return Err(DriverError::ProtocolTimeout {
                what,
                attempts: step.attempts,
            });
        }
        warn!(
            "{} timed out, retry {}/{}",
            what, step.attempts, self.config.max_retries
        );
        match step.command {
            Command::ConnectDirect { .. } => {
                // The dongle keeps trying until told to stop.
                self.connection = None;
                self.queue.push_front(step);
                self.queue
                    .push_front(Step::tolerated(Command::ScanStop, Purpose::StopScan));
            }
            Command::FindInformation { .. } => {
                self.found.clear();
                self.queue.push_front(step);
            }
            _ => self.queue.push_front(step),
        }
        Ok(())
    }

    fn issue(&mut self, step: Step, now: Instant, actions: &mut Vec<Action>) {
        let timeout = match step.command {
            Command::ConnectDirect { .. } => self.config.connect_timeout,
            _ => self.config.command_timeout,
        };
        debug!(
            "-> {} (attempt {})",
            step.command.name(),
            step.attempts + 1
        );
        actions.push(Action::Send(step.command.clone()));
        self.pending = Some(Pending {
            step,
            stage: Stage::AwaitResponse,
            deadline: now + timeout,
        });
    }

    /// Issue queued commands and take phase transitions while nothing is in flight.
    fn advance(&mut self, now: Instant, actions: &mut Vec<Action>) {
        while self.pending.is_none() && !self.state.is_terminal() {
            if let Some(step) = self.queue.pop_front() {
                self.issue(step, now, actions);
            } else if !self.settle(actions) {
                break;
            }
        }
    }

    fn settle(&mut self, actions: &mut Vec<Action>) -> bool {
        match self.state {
            LinkState::ServiceDiscovery => {
                let (Some(handles), Some(firmware), Some(connection)) =
                    (&self.handles, &self.firmware, self.connection)
                else {
                    return false;
                };
                let writes = myo::setup_writes(handles, firmware, &self.config);
                info!("configuring: {} writes", writes.len());
                for (handle, value) in writes {
                    self.queue.push_back(Step::new(
                        Command::AttributeWrite {
                            connection,
                            handle,
                            value,
                        },
                        Purpose::Configure,
                    ));
                }
                self.state = LinkState::Configuring;
                true
            }
            LinkState::Configuring => {
                self.state = LinkState::Streaming;
                if let Some(handles) = &self.handles {
                    info!("streaming");
                    actions.push(Action::StreamingStarted(handles.clone()));
                }
                true
            }
            _ => false,
        }
    }

    fn settle_or_fail(
        &mut self,
        result: Result<()>,
        now: Instant,
        mut actions: Vec<Action>,
    ) -> Result<Vec<Action>> {
        match result {
            Ok(()) => {
                self.advance(now, &mut actions);
                Ok(actions)
            }
            Err(e) => {
                self.state = LinkState::Error;
                self.queue.clear();
                self.pending = None;
                self.scan_deadline = None;
                Err(e)
            }
        }
    }
}

fn response_connection(rsp: &Response) -> Option<u8> {
    match rsp {
        Response::Disconnect { connection, .. }
        | Response::AttributeWrite { connection, .. }
        | Response::AttributeRead { connection, .. }
        | Response::FindInformation { connection, .. } => Some(*connection),
        _ => None,
    }
}
