//! Namespace-level event packets.
//!
//! Event packets ride inside engine `message` packets. Each one targets a
//! namespace and carries a JSON payload whose binary leaves travel as
//! separate attachment frames.
//!
//! # Wire Format
//!
//! ```text
//! <type>[<attachments>-][<nsp>,][<id>][<json>]
//! ```
//!
//! | Digit | Type | Payload |
//! |-------|------|---------|
//! | `0` | `CONNECT` | object or absent |
//! | `1` | `DISCONNECT` | absent |
//! | `2` | `EVENT` | non-empty array |
//! | `3` | `ACK` | array |
//! | `4` | `CONNECT_ERROR` | string or object |
//! | `5` | `BINARY_EVENT` | non-empty array with placeholders |
//! | `6` | `BINARY_ACK` | array with placeholders |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};

use super::packet::Frame;
use super::payload::Payload;

// ============================================================================
// Constants
// ============================================================================

/// The namespace used when a packet names none.
pub const DEFAULT_NAMESPACE: &str = "/";

// ============================================================================
// EventType
// ============================================================================

/// Wire type digit of an event packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Namespace connect request or confirmation.
    Connect,
    /// Namespace disconnect.
    Disconnect,
    /// Event without binary attachments.
    Event,
    /// Acknowledgement without binary attachments.
    Ack,
    /// Namespace connection refused.
    ConnectError,
    /// Event with binary attachments.
    BinaryEvent,
    /// Acknowledgement with binary attachments.
    BinaryAck,
}

impl EventType {
    /// Returns the wire digit.
    #[inline]
    #[must_use]
    pub const fn digit(self) -> u8 {
        match self {
            Self::Connect => 0,
            Self::Disconnect => 1,
            Self::Event => 2,
            Self::Ack => 3,
            Self::ConnectError => 4,
            Self::BinaryEvent => 5,
            Self::BinaryAck => 6,
        }
    }

    /// Parses a wire digit.
    #[inline]
    #[must_use]
    pub const fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(Self::Connect),
            1 => Some(Self::Disconnect),
            2 => Some(Self::Event),
            3 => Some(Self::Ack),
            4 => Some(Self::ConnectError),
            5 => Some(Self::BinaryEvent),
            6 => Some(Self::BinaryAck),
            _ => None,
        }
    }

    /// Returns `true` for the attachment-carrying variants.
    #[inline]
    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::Event => "EVENT",
            Self::Ack => "ACK",
            Self::ConnectError => "CONNECT_ERROR",
            Self::BinaryEvent => "BINARY_EVENT",
            Self::BinaryAck => "BINARY_ACK",
        };
        f.write_str(name)
    }
}

// ============================================================================
// PacketKind
// ============================================================================

/// Validated content of an event packet.
///
/// Binary and plain variants share one case; the wire type is derived from
/// whether the data holds binary leaves.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketKind {
    /// Connect request (client) or confirmation (server).
    Connect(Option<Payload>),
    /// Disconnect notice.
    Disconnect,
    /// Event: first element is the event name.
    Event {
        /// Acknowledgement id, if the sender expects one.
        id: Option<u64>,
        /// Event name followed by arguments.
        data: Vec<Payload>,
    },
    /// Acknowledgement of an event.
    Ack {
        /// Id of the acknowledged event.
        id: u64,
        /// Acknowledgement arguments.
        data: Vec<Payload>,
    },
    /// Connection refusal, a string or an object.
    ConnectError(Payload),
}

// ============================================================================
// EventPacket
// ============================================================================

/// An event packet addressed to one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPacket {
    /// Target namespace.
    pub nsp: String,
    /// Packet content.
    pub kind: PacketKind,
}

impl EventPacket {
    /// Creates a packet.
    #[inline]
    #[must_use]
    pub fn new(nsp: impl Into<String>, kind: PacketKind) -> Self {
        Self {
            nsp: nsp.into(),
            kind,
        }
    }

    /// Creates a CONNECT packet.
    #[inline]
    #[must_use]
    pub fn connect(nsp: impl Into<String>, auth: Option<Payload>) -> Self {
        Self::new(nsp, PacketKind::Connect(auth))
    }

    /// Creates a DISCONNECT packet.
    #[inline]
    #[must_use]
    pub fn disconnect(nsp: impl Into<String>) -> Self {
        Self::new(nsp, PacketKind::Disconnect)
    }

    /// Creates an EVENT packet.
    #[inline]
    #[must_use]
    pub fn event(nsp: impl Into<String>, id: Option<u64>, data: Vec<Payload>) -> Self {
        Self::new(nsp, PacketKind::Event { id, data })
    }

    /// Creates an ACK packet.
    #[inline]
    #[must_use]
    pub fn ack(nsp: impl Into<String>, id: u64, data: Vec<Payload>) -> Self {
        Self::new(nsp, PacketKind::Ack { id, data })
    }

    /// Wire type of this packet.
    #[must_use]
    pub fn packet_type(&self) -> EventType {
        match &self.kind {
            PacketKind::Connect(_) => EventType::Connect,
            PacketKind::Disconnect => EventType::Disconnect,
            PacketKind::Event { data, .. } if data.iter().any(Payload::has_binary) => {
                EventType::BinaryEvent
            }
            PacketKind::Event { .. } => EventType::Event,
            PacketKind::Ack { data, .. } if data.iter().any(Payload::has_binary) => {
                EventType::BinaryAck
            }
            PacketKind::Ack { .. } => EventType::Ack,
            PacketKind::ConnectError(_) => EventType::ConnectError,
        }
    }

    /// Acknowledgement id, if any.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        match &self.kind {
            PacketKind::Event { id, .. } => *id,
            PacketKind::Ack { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Number of binary attachments.
    #[must_use]
    pub fn attachments(&self) -> usize {
        match &self.kind {
            PacketKind::Event { data, .. } | PacketKind::Ack { data, .. } => {
                data.iter().map(Payload::binary_count).sum()
            }
            _ => 0,
        }
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Serializes event packets into frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    /// Creates an encoder.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Encodes a packet.
    ///
    /// The first frame is the text header; one binary frame follows per
    /// attachment, in depth-first order.
    #[must_use]
    pub fn encode(&self, packet: &EventPacket) -> Vec<Frame> {
        let packet_type = packet.packet_type();
        let mut attachments = Vec::new();

        let data = match &packet.kind {
            PacketKind::Connect(auth) => auth.as_ref().map(|a| a.deconstruct(&mut attachments)),
            PacketKind::Disconnect => None,
            PacketKind::Event { data, .. } | PacketKind::Ack { data, .. } => Some(Value::Array(
                data.iter().map(|item| item.deconstruct(&mut attachments)).collect(),
            )),
            PacketKind::ConnectError(error) => Some(error.deconstruct(&mut attachments)),
        };

        let mut header = packet_type.digit().to_string();
        if packet_type.is_binary() {
            header.push_str(&attachments.len().to_string());
            header.push('-');
        }
        if !packet.nsp.is_empty() && packet.nsp != DEFAULT_NAMESPACE {
            header.push_str(&packet.nsp);
            header.push(',');
        }
        if let Some(id) = packet.id() {
            header.push_str(&id.to_string());
        }
        if let Some(data) = data {
            header.push_str(&data.to_string());
        }

        trace!(
            packet_type = %packet_type,
            nsp = %packet.nsp,
            attachments = attachments.len(),
            "Encoded packet"
        );

        let mut frames = Vec::with_capacity(1 + attachments.len());
        frames.push(Frame::Text(header));
        frames.extend(attachments.into_iter().map(Frame::Binary));
        frames
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Header of a packet whose attachments are still arriving.
#[derive(Debug)]
struct Reconstruction {
    header: Header,
    expected: usize,
    buffers: Vec<Vec<u8>>,
}

/// Parsed text frame before payload validation.
#[derive(Debug)]
struct Header {
    packet_type: EventType,
    nsp: String,
    id: Option<u64>,
    data: Option<Value>,
}

/// Incremental decoder for incoming frames.
///
/// Keeps at most one partially received binary packet.
#[derive(Debug, Default)]
pub struct Decoder {
    reconstruction: Option<Reconstruction>,
}

impl Decoder {
    /// Creates a decoder.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while a binary packet awaits attachments.
    #[inline]
    #[must_use]
    pub fn is_reconstructing(&self) -> bool {
        self.reconstruction.is_some()
    }

    /// Drops any partial reconstruction.
    #[inline]
    pub fn reset(&mut self) {
        self.reconstruction = None;
    }

    /// Feeds one frame.
    ///
    /// Returns a packet once it is complete, `None` while attachments are
    /// still expected.
    ///
    /// # Errors
    ///
    /// - [`Error::Parse`] on a malformed header or payload, on a text frame
    ///   arriving mid-reconstruction, or on an unexpected binary frame
    pub fn add(&mut self, frame: Frame) -> Result<Option<EventPacket>> {
        match frame {
            Frame::Text(text) => {
                if self.reconstruction.is_some() {
                    self.reset();
                    return Err(Error::parse("got plaintext data when reconstructing a packet"));
                }

                let (header, attachments) = parse_header(&text)?;
                if header.packet_type.is_binary() && attachments > 0 {
                    self.reconstruction = Some(Reconstruction {
                        header,
                        expected: attachments,
                        buffers: Vec::with_capacity(attachments),
                    });
                    return Ok(None);
                }

                finish(header, &[]).map(Some)
            }
            Frame::Binary(bytes) => {
                let Some(reconstruction) = self.reconstruction.as_mut() else {
                    return Err(Error::parse("got binary data when not reconstructing a packet"));
                };

                reconstruction.buffers.push(bytes);
                if reconstruction.buffers.len() < reconstruction.expected {
                    return Ok(None);
                }

                let Some(Reconstruction {
                    header, buffers, ..
                }) = self.reconstruction.take()
                else {
                    return Ok(None);
                };
                finish(header, &buffers).map(Some)
            }
        }
    }
}

// ============================================================================
// Header Parsing
// ============================================================================

/// Parses the text frame, returning the header and attachment count.
fn parse_header(text: &str) -> Result<(Header, usize)> {
    let bytes = text.as_bytes();
    let mut cursor = 0;

    let packet_type = bytes
        .first()
        .filter(|b| b.is_ascii_digit())
        .and_then(|b| EventType::from_digit(b - b'0'))
        .ok_or_else(|| Error::parse(format!("unknown packet type in {text:?}")))?;
    cursor += 1;

    let mut attachments = 0;
    if packet_type.is_binary() {
        let start = cursor;
        while cursor < bytes.len() && bytes[cursor] != b'-' {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            return Err(Error::parse("illegal attachments"));
        }
        attachments = text[start..cursor]
            .parse::<usize>()
            .map_err(|_| Error::parse("illegal attachments"))?;
        cursor += 1;
    }

    let mut nsp = DEFAULT_NAMESPACE.to_string();
    if bytes.get(cursor) == Some(&b'/') {
        let start = cursor;
        while cursor < bytes.len() && bytes[cursor] != b',' {
            cursor += 1;
        }
        nsp = text[start..cursor].to_string();
        if cursor < bytes.len() {
            cursor += 1;
        }
    }

    let mut id = None;
    let start = cursor;
    while cursor < bytes.len() && bytes[cursor].is_ascii_digit() {
        cursor += 1;
    }
    if cursor > start {
        id = Some(
            text[start..cursor]
                .parse::<u64>()
                .map_err(|_| Error::parse("illegal packet id"))?,
        );
    }

    let data = if cursor < bytes.len() {
        let value = serde_json::from_str::<Value>(&text[cursor..])
            .map_err(|e| Error::parse(format!("invalid payload: {e}")))?;
        Some(value)
    } else {
        None
    };

    Ok((
        Header {
            packet_type,
            nsp,
            id,
            data,
        },
        attachments,
    ))
}

/// Validates the payload shape and builds the packet.
fn finish(header: Header, attachments: &[Vec<u8>]) -> Result<EventPacket> {
    let Header {
        packet_type,
        nsp,
        id,
        data,
    } = header;

    let kind = match (packet_type, data) {
        (EventType::Connect, None | Some(Value::Null)) => PacketKind::Connect(None),
        (EventType::Connect, Some(data @ Value::Object(_))) => {
            PacketKind::Connect(Some(Payload::reconstruct(data, attachments)?))
        }
        (EventType::Disconnect, None) => PacketKind::Disconnect,
        (EventType::Event | EventType::BinaryEvent, Some(Value::Array(items)))
            if !items.is_empty() =>
        {
            PacketKind::Event {
                id,
                data: reconstruct_all(items, attachments)?,
            }
        }
        (EventType::Ack | EventType::BinaryAck, Some(Value::Array(items))) => {
            let id = id.ok_or_else(|| Error::parse("ack packet without id"))?;
            PacketKind::Ack {
                id,
                data: reconstruct_all(items, attachments)?,
            }
        }
        (EventType::ConnectError, Some(data @ (Value::String(_) | Value::Object(_)))) => {
            PacketKind::ConnectError(Payload::from(data))
        }
        (packet_type, _) => {
            return Err(Error::parse(format!("invalid payload for {packet_type}")));
        }
    };

    Ok(EventPacket { nsp, kind })
}

/// Reconstructs every element of an argument array.
fn reconstruct_all(items: Vec<Value>, attachments: &[Vec<u8>]) -> Result<Vec<Payload>> {
    items
        .into_iter()
        .map(|item| Payload::reconstruct(item, attachments))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
