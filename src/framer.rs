//! BGAPI packet framing.
//!
//! Every packet starts with a 4-byte header:
//!
//! ```text
//! byte 0  bit 7     message type (0 = command/response, 1 = event)
//!         bits 6-3  technology (0 = Bluetooth LE, 1 = Wi-Fi)
//!         bits 2-0  payload length, high bits
//! byte 1            payload length, low byte
//! byte 2            class id
//! byte 3            command id
//! ```
//!
//! followed by the payload. The framer buffers until header + payload are
//! available and then consumes exactly that many bytes.

use log::trace;

use crate::errors::DriverError;

/// Largest payload a sane dongle declares. Anything bigger means we lost sync.
pub const MAX_PAYLOAD_LEN: usize = 256;

pub const HEADER_LEN: usize = 4;

const EVENT_BIT: u8 = 0x80;
const TECHNOLOGY_MASK: u8 = 0x78;
const LENGTH_HIGH_MASK: u8 = 0x07;

/// Whether a packet is a command/response or an asynchronous event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Commands travel host to dongle, responses dongle to host; both use type 0.
    Response,
    Event,
}

/// One complete packet as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub kind: MessageKind,
    /// 0 for Bluetooth LE, 1 for Wi-Fi.
    pub technology: u8,
    pub class: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl RawPacket {
    pub fn new(kind: MessageKind, class: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            kind,
            technology: 0,
            class,
            command,
            payload,
        }
    }

    /// Header byte 0 for this packet.
    pub fn type_byte(&self) -> u8 {
        let kind = match self.kind {
            MessageKind::Response => 0,
            MessageKind::Event => EVENT_BIT,
        };
        let length_high = (self.payload.len() >> 8) as u8 & LENGTH_HIGH_MASK;
        kind | ((self.technology << 3) & TECHNOLOGY_MASK) | length_high
    }

    /// Serialize header and payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.type_byte());
        out.push((self.payload.len() & 0xFF) as u8);
        out.push(self.class);
        out.push(self.command);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Why [`Framer::extract`] did not yield a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes buffered yet. Wait for more.
    Incomplete,
    /// The header declares an impossible payload length.
    MalformedHeader { declared: usize },
}

/// Reassembles packets from an append-only byte stream.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
    discarded: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes dropped while hunting for a valid header.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Try to take one complete packet off the front of the buffer.
    pub fn extract(&mut self) -> Result<RawPacket, FrameError> {
        self.resync();

        if self.buf.len() < HEADER_LEN {
            return Err(FrameError::Incomplete);
        }

        let declared = (((self.buf[0] & LENGTH_HIGH_MASK) as usize) << 8) | self.buf[1] as usize;
        if declared > MAX_PAYLOAD_LEN {
            return Err(FrameError::MalformedHeader { declared });
        }

        let total = HEADER_LEN + declared;
        if self.buf.len() < total {
            return Err(FrameError::Incomplete);
        }

        let header = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        let payload = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(..total);

        Ok(RawPacket {
            kind: if header[0] & EVENT_BIT != 0 {
                MessageKind::Event
            } else {
                MessageKind::Response
            },
            technology: (header[0] & TECHNOLOGY_MASK) >> 3,
            class: header[2],
            command: header[3],
            payload,
        })
    }

    /// Loop-friendly form of [`Framer::extract`]: `Ok(None)` when more bytes are needed.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>, DriverError> {
        match self.extract() {
            Ok(packet) => Ok(Some(packet)),
            Err(FrameError::Incomplete) => Ok(None),
            Err(FrameError::MalformedHeader { declared }) => Err(DriverError::MalformedHeader {
                declared,
                max: MAX_PAYLOAD_LEN,
            }),
        }
    }

    /// Drop leading bytes that cannot start a packet (technology other than BLE/Wi-Fi).
    fn resync(&mut self) {
        let skip = self
            .buf
            .iter()
            .take_while(|&&b| (b & TECHNOLOGY_MASK) >> 3 > 1)
            .count();
        if skip > 0 {
            trace!("framer discarding {} byte(s) before header", skip);
            self.buf.drain(..skip);
            self.discarded += skip;
        }
    }
}
