//! BGAPI commands, responses and events for the BLE stack of the BLED112.
//!
//! Only the slice of the protocol a GATT client needs is modelled: GAP
//! discovery and direct connection, connection teardown, and attribute
//! client reads, writes and information discovery. Integers are
//! little-endian; `uint8array` fields are a length byte followed by bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::framer::{MessageKind, RawPacket};

/// Class ids.
pub mod class {
    pub const CONNECTION: u8 = 3;
    pub const ATTCLIENT: u8 = 4;
    pub const GAP: u8 = 6;
}

// (class, command) pairs. Commands and their responses share an id.
const GAP_DISCOVER: (u8, u8) = (class::GAP, 2);
const GAP_CONNECT_DIRECT: (u8, u8) = (class::GAP, 3);
const GAP_END_PROCEDURE: (u8, u8) = (class::GAP, 4);
const CONNECTION_DISCONNECT: (u8, u8) = (class::CONNECTION, 0);
const ATTCLIENT_FIND_INFORMATION: (u8, u8) = (class::ATTCLIENT, 3);
const ATTCLIENT_READ_BY_HANDLE: (u8, u8) = (class::ATTCLIENT, 4);
const ATTCLIENT_ATTRIBUTE_WRITE: (u8, u8) = (class::ATTCLIENT, 5);

const EVT_GAP_SCAN_RESPONSE: (u8, u8) = (class::GAP, 0);
const EVT_CONNECTION_STATUS: (u8, u8) = (class::CONNECTION, 0);
const EVT_CONNECTION_DISCONNECTED: (u8, u8) = (class::CONNECTION, 4);
const EVT_ATTCLIENT_PROCEDURE_COMPLETED: (u8, u8) = (class::ATTCLIENT, 1);
const EVT_ATTCLIENT_INFORMATION_FOUND: (u8, u8) = (class::ATTCLIENT, 4);
const EVT_ATTCLIENT_ATTRIBUTE_VALUE: (u8, u8) = (class::ATTCLIENT, 5);

/// `flags` bit of a connection status event once the link is up.
pub const CONNECTION_CONNECTED: u8 = 0x01;

/// `type` of an attribute value event carrying a read result.
pub const ATTRIBUTE_VALUE_READ: u8 = 0;
/// `type` of an attribute value event carrying a notification.
pub const ATTRIBUTE_VALUE_NOTIFY: u8 = 1;

/// Public device address type, as used by the Myo.
pub const ADDRESS_PUBLIC: u8 = 0;

// ============================================================================
// Device address
// ============================================================================

/// Bluetooth device address, kept in wire order (least significant byte first).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    pub const fn from_wire(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn wire(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BdAddr({self})")
    }
}

impl FromStr for BdAddr {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || DriverError::Config(format!("invalid device address: {s:?}"));
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(invalid());
            }
            // Text is most significant byte first, the wire the other way round.
            bytes[5 - i] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for BdAddr {
    type Error = DriverError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BdAddr> for String {
    fn from(addr: BdAddr) -> Self {
        addr.to_string()
    }
}

// ============================================================================
// Commands
// ============================================================================

/// GAP discovery mode for [`Command::ScanStart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscoverMode {
    Limited = 0,
    #[default]
    Generic = 1,
    Observation = 2,
}

impl DiscoverMode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DiscoverMode::Limited),
            1 => Some(DiscoverMode::Generic),
            2 => Some(DiscoverMode::Observation),
            _ => None,
        }
    }
}

/// Outgoing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `gap_discover`
    ScanStart { mode: DiscoverMode },
    /// `gap_end_procedure`; also aborts a pending direct connection.
    ScanStop,
    /// `gap_connect_direct`. Intervals in 1.25 ms units, timeout in 10 ms units.
    ConnectDirect {
        address: BdAddr,
        address_type: u8,
        interval_min: u16,
        interval_max: u16,
        supervision_timeout: u16,
        latency: u16,
    },
    /// `connection_disconnect`
    Disconnect { connection: u8 },
    /// `attclient_attribute_write`
    AttributeWrite {
        connection: u8,
        handle: u16,
        value: Vec<u8>,
    },
    /// `attclient_read_by_handle`
    AttributeRead { connection: u8, handle: u16 },
    /// `attclient_find_information`
    FindInformation { connection: u8, start: u16, end: u16 },
}

impl Command {
    /// (class, command) id shared with the matching response.
    pub fn id(&self) -> (u8, u8) {
        match self {
            Command::ScanStart { .. } => GAP_DISCOVER,
            Command::ScanStop => GAP_END_PROCEDURE,
            Command::ConnectDirect { .. } => GAP_CONNECT_DIRECT,
            Command::Disconnect { .. } => CONNECTION_DISCONNECT,
            Command::AttributeWrite { .. } => ATTCLIENT_ATTRIBUTE_WRITE,
            Command::AttributeRead { .. } => ATTCLIENT_READ_BY_HANDLE,
            Command::FindInformation { .. } => ATTCLIENT_FIND_INFORMATION,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::ScanStart { .. } => "scan-start",
            Command::ScanStop => "scan-stop",
            Command::ConnectDirect { .. } => "connect-direct",
            Command::Disconnect { .. } => "disconnect",
            Command::AttributeWrite { .. } => "attribute-write",
            Command::AttributeRead { .. } => "attribute-read",
            Command::FindInformation { .. } => "find-information",
        }
    }

    /// Connection handle the command is addressed to, if any.
    pub fn connection(&self) -> Option<u8> {
        match self {
            Command::Disconnect { connection }
            | Command::AttributeWrite { connection, .. }
            | Command::AttributeRead { connection, .. }
            | Command::FindInformation { connection, .. } => Some(*connection),
            _ => None,
        }
    }

    pub fn to_packet(&self) -> RawPacket {
        let mut payload = Vec::new();
        match self {
            Command::ScanStart { mode } => payload.push(*mode as u8),
            Command::ScanStop => {}
            Command::ConnectDirect {
                address,
                address_type,
                interval_min,
                interval_max,
                supervision_timeout,
                latency,
            } => {
                payload.extend_from_slice(&address.wire());
                payload.push(*address_type);
                put_u16(&mut payload, *interval_min);
                put_u16(&mut payload, *interval_max);
                put_u16(&mut payload, *supervision_timeout);
                put_u16(&mut payload, *latency);
            }
            Command::Disconnect { connection } => payload.push(*connection),
            Command::AttributeWrite {
                connection,
                handle,
                value,
            } => {
                payload.push(*connection);
                put_u16(&mut payload, *handle);
                put_array(&mut payload, value);
            }
            Command::AttributeRead { connection, handle } => {
                payload.push(*connection);
                put_u16(&mut payload, *handle);
            }
            Command::FindInformation {
                connection,
                start,
                end,
            } => {
                payload.push(*connection);
                put_u16(&mut payload, *start);
                put_u16(&mut payload, *end);
            }
        }
        let (class, command) = self.id();
        RawPacket::new(MessageKind::Response, class, command, payload)
    }

    /// Wire bytes, header included.
    pub fn encode(&self) -> Vec<u8> {
        self.to_packet().to_bytes()
    }

    /// Parse a command packet as the dongle would see it.
    pub fn from_packet(packet: &RawPacket) -> Result<Self> {
        let id = (packet.class, packet.command);
        if packet.kind != MessageKind::Response || packet.technology != 0 {
            return Err(unknown(packet));
        }
        let mut f = Fields::new(&packet.payload, "command");
        let command = match id {
            GAP_DISCOVER => {
                let mode = f.u8()?;
                Command::ScanStart {
                    mode: DiscoverMode::from_u8(mode).ok_or_else(|| f.malformed())?,
                }
            }
            GAP_END_PROCEDURE => Command::ScanStop,
            GAP_CONNECT_DIRECT => Command::ConnectDirect {
                address: f.addr()?,
                address_type: f.u8()?,
                interval_min: f.u16()?,
                interval_max: f.u16()?,
                supervision_timeout: f.u16()?,
                latency: f.u16()?,
            },
            CONNECTION_DISCONNECT => Command::Disconnect {
                connection: f.u8()?,
            },
            ATTCLIENT_ATTRIBUTE_WRITE => Command::AttributeWrite {
                connection: f.u8()?,
                handle: f.u16()?,
                value: f.array()?,
            },
            ATTCLIENT_READ_BY_HANDLE => Command::AttributeRead {
                connection: f.u8()?,
                handle: f.u16()?,
            },
            ATTCLIENT_FIND_INFORMATION => Command::FindInformation {
                connection: f.u8()?,
                start: f.u16()?,
                end: f.u16()?,
            },
            _ => return Err(unknown(packet)),
        };
        Ok(command)
    }
}

// ============================================================================
// Responses and events
// ============================================================================

/// Response to a [`Command`], one variant per command type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ScanStart { result: u16 },
    ScanStop { result: u16 },
    ConnectDirect { result: u16, connection: u8 },
    Disconnect { connection: u8, result: u16 },
    AttributeWrite { connection: u8, result: u16 },
    AttributeRead { connection: u8, result: u16 },
    FindInformation { connection: u8, result: u16 },
}

impl Response {
    /// (class, command) id of the command this answers.
    pub fn id(&self) -> (u8, u8) {
        match self {
            Response::ScanStart { .. } => GAP_DISCOVER,
            Response::ScanStop { .. } => GAP_END_PROCEDURE,
            Response::ConnectDirect { .. } => GAP_CONNECT_DIRECT,
            Response::Disconnect { .. } => CONNECTION_DISCONNECT,
            Response::AttributeWrite { .. } => ATTCLIENT_ATTRIBUTE_WRITE,
            Response::AttributeRead { .. } => ATTCLIENT_READ_BY_HANDLE,
            Response::FindInformation { .. } => ATTCLIENT_FIND_INFORMATION,
        }
    }

    /// BGAPI result code; 0 is success.
    pub fn result(&self) -> u16 {
        match self {
            Response::ScanStart { result }
            | Response::ScanStop { result }
            | Response::ConnectDirect { result, .. }
            | Response::Disconnect { result, .. }
            | Response::AttributeWrite { result, .. }
            | Response::AttributeRead { result, .. }
            | Response::FindInformation { result, .. } => *result,
        }
    }

    /// Whether this answers `command`.
    pub fn answers(&self, command: &Command) -> bool {
        self.id() == command.id()
    }
}

/// Advertisement or scan response seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResponse {
    pub rssi: i8,
    pub packet_type: u8,
    pub address: BdAddr,
    pub address_type: u8,
    pub bond: u8,
    /// Raw advertisement data (AD structures).
    pub data: Vec<u8>,
}

impl ScanResponse {
    /// Whether the advertisement data carries `signature` anywhere.
    pub fn advertises(&self, signature: &[u8]) -> bool {
        !signature.is_empty() && self.data.windows(signature.len()).any(|w| w == signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connection: u8,
    pub flags: u8,
    pub address: BdAddr,
    pub address_type: u8,
    pub interval: u16,
    pub timeout: u16,
    pub latency: u16,
    pub bonding: u8,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.flags & CONNECTION_CONNECTED != 0
    }
}

/// Decoded dongle-to-host message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BgapiMessage {
    Response(Response),
    ScanResponse(ScanResponse),
    ConnectionStatus(ConnectionStatus),
    Disconnected {
        connection: u8,
        reason: u16,
    },
    AttributeValue {
        connection: u8,
        handle: u16,
        value_type: u8,
        value: Vec<u8>,
    },
    ProcedureCompleted {
        connection: u8,
        result: u16,
        handle: u16,
    },
    InformationFound {
        connection: u8,
        handle: u16,
        uuid: Vec<u8>,
    },
}

/// Classify a packet and decode its fields.
pub fn decode(packet: &RawPacket) -> Result<BgapiMessage> {
    if packet.technology != 0 {
        return Err(unknown(packet));
    }
    let id = (packet.class, packet.command);
    let mut f = Fields::new(&packet.payload, "message");

    let message = match packet.kind {
        MessageKind::Response => BgapiMessage::Response(match id {
            GAP_DISCOVER => Response::ScanStart { result: f.u16()? },
            GAP_END_PROCEDURE => Response::ScanStop { result: f.u16()? },
            GAP_CONNECT_DIRECT => Response::ConnectDirect {
                result: f.u16()?,
                connection: f.u8()?,
            },
            CONNECTION_DISCONNECT => Response::Disconnect {
                connection: f.u8()?,
                result: f.u16()?,
            },
            ATTCLIENT_ATTRIBUTE_WRITE => Response::AttributeWrite {
                connection: f.u8()?,
                result: f.u16()?,
            },
            ATTCLIENT_READ_BY_HANDLE => Response::AttributeRead {
                connection: f.u8()?,
                result: f.u16()?,
            },
            ATTCLIENT_FIND_INFORMATION => Response::FindInformation {
                connection: f.u8()?,
                result: f.u16()?,
            },
            _ => return Err(unknown(packet)),
        }),
        MessageKind::Event => match id {
            EVT_GAP_SCAN_RESPONSE => BgapiMessage::ScanResponse(ScanResponse {
                rssi: f.u8()? as i8,
                packet_type: f.u8()?,
                address: f.addr()?,
                address_type: f.u8()?,
                bond: f.u8()?,
                data: f.array()?,
            }),
            EVT_CONNECTION_STATUS => BgapiMessage::ConnectionStatus(ConnectionStatus {
                connection: f.u8()?,
                flags: f.u8()?,
                address: f.addr()?,
                address_type: f.u8()?,
                interval: f.u16()?,
                timeout: f.u16()?,
                latency: f.u16()?,
                bonding: f.u8()?,
            }),
            EVT_CONNECTION_DISCONNECTED => BgapiMessage::Disconnected {
                connection: f.u8()?,
                reason: f.u16()?,
            },
            EVT_ATTCLIENT_PROCEDURE_COMPLETED => BgapiMessage::ProcedureCompleted {
                connection: f.u8()?,
                result: f.u16()?,
                handle: f.u16()?,
            },
            EVT_ATTCLIENT_INFORMATION_FOUND => BgapiMessage::InformationFound {
                connection: f.u8()?,
                handle: f.u16()?,
                uuid: f.array()?,
            },
            EVT_ATTCLIENT_ATTRIBUTE_VALUE => BgapiMessage::AttributeValue {
                connection: f.u8()?,
                handle: f.u16()?,
                value_type: f.u8()?,
                value: f.array()?,
            },
            _ => return Err(unknown(packet)),
        },
    };
    Ok(message)
}

impl BgapiMessage {
    /// Encode as the dongle would send it. Inverse of [`decode`].
    pub fn to_packet(&self) -> RawPacket {
        let mut p = Vec::new();
        let (kind, (class, command)) = match self {
            BgapiMessage::Response(rsp) => {
                match rsp {
                    Response::ScanStart { result } | Response::ScanStop { result } => {
                        put_u16(&mut p, *result)
                    }
                    Response::ConnectDirect { result, connection } => {
                        put_u16(&mut p, *result);
                        p.push(*connection);
                    }
                    Response::Disconnect { connection, result }
                    | Response::AttributeWrite { connection, result }
                    | Response::AttributeRead { connection, result }
                    | Response::FindInformation { connection, result } => {
                        p.push(*connection);
                        put_u16(&mut p, *result);
                    }
                }
                (MessageKind::Response, rsp.id())
            }
            BgapiMessage::ScanResponse(adv) => {
                p.push(adv.rssi as u8);
                p.push(adv.packet_type);
                p.extend_from_slice(&adv.address.wire());
                p.push(adv.address_type);
                p.push(adv.bond);
                put_array(&mut p, &adv.data);
                (MessageKind::Event, EVT_GAP_SCAN_RESPONSE)
            }
            BgapiMessage::ConnectionStatus(status) => {
                p.push(status.connection);
                p.push(status.flags);
                p.extend_from_slice(&status.address.wire());
                p.push(status.address_type);
                put_u16(&mut p, status.interval);
                put_u16(&mut p, status.timeout);
                put_u16(&mut p, status.latency);
                p.push(status.bonding);
                (MessageKind::Event, EVT_CONNECTION_STATUS)
            }
            BgapiMessage::Disconnected { connection, reason } => {
                p.push(*connection);
                put_u16(&mut p, *reason);
                (MessageKind::Event, EVT_CONNECTION_DISCONNECTED)
            }
            BgapiMessage::AttributeValue {
                connection,
                handle,
                value_type,
                value,
            } => {
                p.push(*connection);
                put_u16(&mut p, *handle);
                p.push(*value_type);
                put_array(&mut p, value);
                (MessageKind::Event, EVT_ATTCLIENT_ATTRIBUTE_VALUE)
            }
            BgapiMessage::ProcedureCompleted {
                connection,
                result,
                handle,
            } => {
                p.push(*connection);
                put_u16(&mut p, *result);
                put_u16(&mut p, *handle);
                (MessageKind::Event, EVT_ATTCLIENT_PROCEDURE_COMPLETED)
            }
            BgapiMessage::InformationFound {
                connection,
                handle,
                uuid,
            } => {
                p.push(*connection);
                put_u16(&mut p, *handle);
                put_array(&mut p, uuid);
                (MessageKind::Event, EVT_ATTCLIENT_INFORMATION_FOUND)
            }
        };
        RawPacket::new(kind, class, command, p)
    }
}

// ============================================================================
// Field helpers
// ============================================================================

fn unknown(packet: &RawPacket) -> DriverError {
    DriverError::UnknownMessage {
        kind: packet.type_byte(),
        class: packet.class,
        command: packet.command,
    }
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_array(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

/// Sequential little-endian reader over a payload.
struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Fields<'a> {
    fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    fn malformed(&self) -> DriverError {
        DriverError::MalformedPayload {
            what: self.what,
            len: self.data.len(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(self.malformed());
        }
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn addr(&mut self) -> Result<BdAddr> {
        let b = self.take(6)?;
        Ok(BdAddr::from_wire([b[0], b[1], b[2], b[3], b[4], b[5]]))
    }

    fn array(&mut self) -> Result<Vec<u8>> {
        let len = self.u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}
