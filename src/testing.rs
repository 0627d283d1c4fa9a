//! Test doubles: a scripted BLED112 with a Myo attached, and a transport
//! that talks to it at the byte level.

use std::collections::VecDeque;
use std::io;

use crate::bgapi::{
    BdAddr, BgapiMessage, Command, ConnectionStatus, Response, ScanResponse, ADDRESS_PUBLIC,
    ATTRIBUTE_VALUE_NOTIFY, ATTRIBUTE_VALUE_READ,
};
use crate::framer::Framer;
use crate::myo::{
    myo_uuid, BATTERY_LEVEL, COMMAND, CONTROL_SERVICE, DEVICE_NAME, EMG_DATA, FIRMWARE_VERSION,
    GATT_CCCD, GATT_CHARACTERISTIC, GATT_PRIMARY_SERVICE, IMU_DATA,
};
use crate::recorder::Sink;
use crate::session::CancelToken;
use crate::transport::Transport;

/// xorshift64; deterministic noise for property tests.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-ish value in `0..n`.
    pub fn below(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

fn short(uuid: u16) -> Vec<u8> {
    uuid.to_le_bytes().to_vec()
}

fn long(id: u16) -> Vec<u8> {
    myo_uuid(id).to_vec()
}

/// Firmware 1.5.1970, hardware revision 2.
pub const FIRMWARE_BYTES: [u8; 8] = [1, 0, 5, 0, 0xB2, 0x07, 2, 0];

/// `(handle, attribute type, value)` of a stock armband.
pub fn myo_gatt_table() -> Vec<(u16, Vec<u8>, Vec<u8>)> {
    let decl = || short(GATT_CHARACTERISTIC);
    let cccd = || short(GATT_CCCD);
    let service = || short(GATT_PRIMARY_SERVICE);
    let none = Vec::new;
    vec![
        (0x01, service(), vec![0x00, 0x18]),
        (0x02, decl(), none()),
        (0x03, short(DEVICE_NAME), b"Myo".to_vec()),
        (0x04, decl(), none()),
        (0x05, short(0x2A01), none()),
        (0x06, decl(), none()),
        (0x07, short(0x2A04), none()),
        (0x08, service(), vec![0x01, 0x18]),
        (0x09, decl(), none()),
        (0x0a, short(0x2A05), none()),
        (0x0b, cccd(), none()),
        (0x0c, service(), vec![0x0A, 0x18]),
        (0x0d, decl(), none()),
        (0x0e, short(0x2A29), b"Thalmic Labs".to_vec()),
        (0x0f, service(), vec![0x0F, 0x18]),
        (0x10, decl(), none()),
        (0x11, short(BATTERY_LEVEL), vec![87]),
        (0x12, cccd(), none()),
        (0x13, service(), long(CONTROL_SERVICE)),
        (0x14, decl(), none()),
        (0x15, long(0x0101), none()),
        (0x16, decl(), none()),
        (0x17, long(FIRMWARE_VERSION), FIRMWARE_BYTES.to_vec()),
        (0x18, decl(), none()),
        (0x19, long(COMMAND), none()),
        (0x1a, service(), long(0x0002)),
        (0x1b, decl(), none()),
        (0x1c, long(IMU_DATA), none()),
        (0x1d, cccd(), none()),
        (0x1e, decl(), none()),
        (0x1f, long(0x0502), none()),
        (0x20, cccd(), none()),
        (0x21, service(), long(0x0003)),
        (0x22, decl(), none()),
        (0x23, long(0x0103), none()),
        (0x24, cccd(), none()),
        (0x25, service(), long(0x0004)),
        (0x26, decl(), none()),
        (0x27, long(0x0104), none()),
        (0x28, cccd(), none()),
        (0x29, service(), long(0x0005)),
        (0x2a, decl(), none()),
        (0x2b, long(EMG_DATA[0]), none()),
        (0x2c, cccd(), none()),
        (0x2d, decl(), none()),
        (0x2e, long(EMG_DATA[1]), none()),
        (0x2f, cccd(), none()),
        (0x30, decl(), none()),
        (0x31, long(EMG_DATA[2]), none()),
        (0x32, cccd(), none()),
        (0x33, decl(), none()),
        (0x34, long(EMG_DATA[3]), none()),
        (0x35, cccd(), none()),
    ]
}

/// Advertisement of an armband: flags plus the control service UUID.
pub fn myo_advertisement(address: BdAddr) -> ScanResponse {
    let mut data = vec![0x02, 0x01, 0x06, 0x11, 0x07];
    data.extend_from_slice(&myo_uuid(CONTROL_SERVICE));
    ScanResponse {
        rssi: -58,
        packet_type: 0,
        address,
        address_type: ADDRESS_PUBLIC,
        bond: 0xFF,
        data,
    }
}

/// A heart-rate strap that happens to be nearby.
pub fn bystander_advertisement() -> ScanResponse {
    ScanResponse {
        rssi: -71,
        packet_type: 0,
        address: BdAddr::from_wire([0x13, 0x71, 0xDA, 0x7D, 0x1A, 0x00]),
        address_type: ADDRESS_PUBLIC,
        bond: 0xFF,
        data: vec![0x02, 0x01, 0x06, 0x03, 0x03, 0x0D, 0x18],
    }
}

/// BLED112 behaviour as seen from the host, with one armband in range.
pub struct Dongle {
    pub address: BdAddr,
    pub connection: u8,
    /// Advertised before the armband on every scan.
    pub decoys: Vec<ScanResponse>,
    /// Whether the armband advertises at all.
    pub advertise: bool,
    /// Commands (by name) that get no reply.
    pub silent: Vec<&'static str>,
    /// Commands (by name) answered with an error result.
    pub refuse: Vec<&'static str>,
    pub gatt: Vec<(u16, Vec<u8>, Vec<u8>)>,
    /// Attribute writes the armband accepted.
    pub writes: Vec<(u16, Vec<u8>)>,
    connected: bool,
}

const RESULT_WRONG_STATE: u16 = 0x0181;
const RESULT_NOT_CONNECTED: u16 = 0x0186;
const RESULT_ATTRIBUTE_NOT_FOUND: u16 = 0x040A;
const REASON_LOCAL_HOST: u16 = 0x0216;

impl Dongle {
    pub fn new() -> Self {
        Self {
            address: "d4:2a:1f:0c:99:e1".parse().unwrap(),
            connection: 0,
            decoys: vec![bystander_advertisement()],
            advertise: true,
            silent: Vec::new(),
            refuse: Vec::new(),
            gatt: myo_gatt_table(),
            writes: Vec::new(),
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Everything the dongle sends back for `command`, in order.
    pub fn respond(&mut self, command: &Command) -> Vec<BgapiMessage> {
        if self.silent.contains(&command.name()) {
            return Vec::new();
        }
        let refused = self.refuse.contains(&command.name());
        let result = if refused { RESULT_WRONG_STATE } else { 0 };
        let conn = self.connection;
        let rsp = |r: Response| vec![BgapiMessage::Response(r)];

        match command {
            Command::ScanStart { .. } => {
                let mut out = rsp(Response::ScanStart { result });
                if !refused {
                    out.extend(self.decoys.iter().cloned().map(BgapiMessage::ScanResponse));
                    if self.advertise {
                        out.push(BgapiMessage::ScanResponse(myo_advertisement(self.address)));
                    }
                }
                out
            }
            Command::ScanStop => rsp(Response::ScanStop { result }),
            Command::ConnectDirect { address, .. } => {
                let mut out = rsp(Response::ConnectDirect {
                    result,
                    connection: conn,
                });
                if !refused && *address == self.address {
                    self.connected = true;
                    out.push(BgapiMessage::ConnectionStatus(ConnectionStatus {
                        connection: conn,
                        flags: 0x05,
                        address: *address,
                        address_type: ADDRESS_PUBLIC,
                        interval: 6,
                        timeout: 64,
                        latency: 0,
                        bonding: 0xFF,
                    }));
                }
                out
            }
            Command::Disconnect { connection } => {
                if !self.connected || *connection != conn {
                    return rsp(Response::Disconnect {
                        connection: *connection,
                        result: RESULT_NOT_CONNECTED,
                    });
                }
                self.connected = false;
                let mut out = rsp(Response::Disconnect {
                    connection: conn,
                    result: 0,
                });
                out.push(BgapiMessage::Disconnected {
                    connection: conn,
                    reason: REASON_LOCAL_HOST,
                });
                out
            }
            Command::AttributeWrite {
                connection,
                handle,
                value,
            } => {
                let mut out = rsp(Response::AttributeWrite {
                    connection: *connection,
                    result,
                });
                if !refused {
                    self.writes.push((*handle, value.clone()));
                    out.push(BgapiMessage::ProcedureCompleted {
                        connection: *connection,
                        result: 0,
                        handle: *handle,
                    });
                }
                out
            }
            Command::AttributeRead { connection, handle } => {
                let mut out = rsp(Response::AttributeRead {
                    connection: *connection,
                    result,
                });
                if refused {
                    return out;
                }
                match self.gatt.iter().find(|(h, _, _)| h == handle) {
                    Some((_, _, value)) => out.push(BgapiMessage::AttributeValue {
                        connection: *connection,
                        handle: *handle,
                        value_type: ATTRIBUTE_VALUE_READ,
                        value: value.clone(),
                    }),
                    None => out.push(BgapiMessage::ProcedureCompleted {
                        connection: *connection,
                        result: RESULT_ATTRIBUTE_NOT_FOUND,
                        handle: *handle,
                    }),
                }
                out
            }
            Command::FindInformation {
                connection,
                start,
                end,
            } => {
                let mut out = rsp(Response::FindInformation {
                    connection: *connection,
                    result,
                });
                if refused {
                    return out;
                }
                out.extend(
                    self.gatt
                        .iter()
                        .filter(|(h, _, _)| (*start..=*end).contains(h))
                        .map(|(h, uuid, _)| BgapiMessage::InformationFound {
                            connection: *connection,
                            handle: *h,
                            uuid: uuid.clone(),
                        }),
                );
                out.push(BgapiMessage::ProcedureCompleted {
                    connection: *connection,
                    result: 0,
                    handle: *end,
                });
                out
            }
        }
    }

    /// EMG notification on characteristic `index` (0-3).
    pub fn emg_notification(&self, index: usize, samples: [i8; 16]) -> BgapiMessage {
        BgapiMessage::AttributeValue {
            connection: self.connection,
            handle: 0x2b + 3 * index as u16,
            value_type: ATTRIBUTE_VALUE_NOTIFY,
            value: samples.iter().map(|s| *s as u8).collect(),
        }
    }

    pub fn imu_notification(&self, words: [i16; 10]) -> BgapiMessage {
        BgapiMessage::AttributeValue {
            connection: self.connection,
            handle: 0x1c,
            value_type: ATTRIBUTE_VALUE_NOTIFY,
            value: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
        }
    }
}

/// How the scripted stream ends once every notification was delivered.
pub enum StreamEnd {
    /// The armband drops the link with this reason.
    Disconnect(u16),
    /// The serial device disappears.
    Fail,
    /// The user interrupts the session.
    Cancel(CancelToken),
    /// The dongle emits these bytes verbatim and then goes quiet.
    Raw(Vec<u8>),
}

/// Byte-level transport in front of a [`Dongle`].
///
/// Written bytes are parsed as commands and answered immediately. Scripted
/// notifications are released once the host has asked for streaming and has
/// read every reply, so none arrive before configuration completed.
pub struct MockTransport {
    pub dongle: Dongle,
    /// Every command the host wrote, in order.
    pub sent: Vec<Command>,
    pub closed: bool,
    commands: Framer,
    inbound: VecDeque<u8>,
    stream: VecDeque<BgapiMessage>,
    end: Option<StreamEnd>,
    mode_set: bool,
    failed: bool,
    rng: XorShift,
    max_chunk: usize,
}

impl MockTransport {
    pub fn new(dongle: Dongle, stream: Vec<BgapiMessage>, end: StreamEnd) -> Self {
        Self {
            dongle,
            sent: Vec::new(),
            closed: false,
            commands: Framer::new(),
            inbound: VecDeque::new(),
            stream: stream.into(),
            end: Some(end),
            mode_set: false,
            failed: false,
            rng: XorShift::new(0xB6D),
            max_chunk: 64,
        }
    }

    /// Deliver at most `max` bytes per read.
    pub fn chunked(mut self, max: usize, seed: u64) -> Self {
        self.max_chunk = max.max(1);
        self.rng = XorShift::new(seed);
        self
    }

    fn queue(&mut self, message: &BgapiMessage) {
        self.inbound.extend(message.to_packet().to_bytes());
    }

    fn refill(&mut self) {
        if !self.inbound.is_empty() || !self.mode_set {
            return;
        }
        if let Some(message) = self.stream.pop_front() {
            self.queue(&message);
            return;
        }
        match self.end.take() {
            Some(StreamEnd::Disconnect(reason)) => {
                self.dongle.connected = false;
                let message = BgapiMessage::Disconnected {
                    connection: self.dongle.connection,
                    reason,
                };
                self.queue(&message);
            }
            Some(StreamEnd::Fail) => self.failed = true,
            Some(StreamEnd::Cancel(token)) => token.cancel(),
            Some(StreamEnd::Raw(bytes)) => self.inbound.extend(bytes),
            None => {}
        }
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        self.refill();
        if self.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        let limit = 1 + self.rng.below(self.max_chunk);
        let n = buf.len().min(limit).min(self.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.commands.push(bytes);
        while let Ok(packet) = self.commands.extract() {
            let command = Command::from_packet(&packet)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            self.sent.push(command.clone());
            if self.failed || self.closed {
                continue;
            }
            if let Command::AttributeWrite { value, .. } = &command {
                if value.starts_with(&[0x01, 0x03]) {
                    self.mode_set = true;
                }
            }
            for message in self.dongle.respond(&command) {
                self.queue(&message);
            }
        }
        if self.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Accepts `budget` rows, then fails like a full disk.
pub struct FailingSink {
    pub budget: usize,
    pub rows: Vec<String>,
    pub flushes: usize,
}

impl FailingSink {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            rows: Vec::new(),
            flushes: 0,
        }
    }

    fn take(&mut self, row: String) -> io::Result<()> {
        if self.rows.len() == self.budget {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.rows.push(row);
        Ok(())
    }
}

impl Sink for FailingSink {
    fn write_emg_row(&mut self, t: f64, _: &[i8; 8]) -> io::Result<()> {
        self.take(format!("emg {t}"))
    }

    fn write_imu_row(&mut self, t: f64, _: &[f32; 4], _: &[f32; 3], _: &[f32; 3]) -> io::Result<()> {
        self.take(format!("imu {t}"))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
