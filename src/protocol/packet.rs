//! Engine-level wire packets.
//!
//! A wire packet is a single type digit followed by an optional payload.
//! Several packets sent over polling are batched into one payload.
//!
//! # Packet Types
//!
//! | Digit | Type | Purpose |
//! |-------|------|---------|
//! | `0` | `open` | Handshake, carries session parameters |
//! | `1` | `close` | Transport close request |
//! | `2` | `ping` | Heartbeat / upgrade probe |
//! | `3` | `pong` | Heartbeat / upgrade probe reply |
//! | `4` | `message` | Application data |
//! | `5` | `upgrade` | Switch to the probed transport |
//! | `6` | `noop` | Used to flush a pending poll |
//!
//! # Protocol Versions
//!
//! | | V3 | V4 |
//! |-|----|----|
//! | Binary over text | `b4<base64>` | `b<base64>` |
//! | Raw binary frame | type byte + data | data only |
//! | Polling payload | `<len>:<packet>...` | packets joined by `\x1e` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Separator between packets of a V4 polling payload.
pub const RECORD_SEPARATOR: char = '\x1e';

/// Payload of the packet produced for undecodable input.
pub const PARSER_ERROR: &str = "parser error";

/// Marker of a base64-encoded binary packet.
const BASE64_MARKER: char = 'b';

// ============================================================================
// ProtocolVersion
// ============================================================================

/// Engine protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolVersion {
    /// Legacy revision: client-initiated heartbeat, length-prefixed payloads.
    V3,
    /// Current revision: server-initiated heartbeat, separator-joined payloads.
    #[default]
    V4,
}

impl ProtocolVersion {
    /// Value of the `EIO` query parameter.
    #[inline]
    #[must_use]
    pub const fn eio(self) -> u8 {
        match self {
            Self::V3 => 3,
            Self::V4 => 4,
        }
    }

    /// Returns `true` if the server sends pings and the client answers.
    #[inline]
    #[must_use]
    pub const fn server_pings(self) -> bool {
        matches!(self, Self::V4)
    }
}

// ============================================================================
// PacketType
// ============================================================================

/// Type of an engine packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Handshake.
    Open,
    /// Close request.
    Close,
    /// Heartbeat or probe.
    Ping,
    /// Heartbeat or probe reply.
    Pong,
    /// Application data.
    Message,
    /// Transport switch.
    Upgrade,
    /// No-op.
    Noop,
    /// Local marker for undecodable input; never encoded.
    Error,
}

impl PacketType {
    /// Returns the wire digit, or `None` for [`PacketType::Error`].
    #[inline]
    #[must_use]
    pub const fn digit(self) -> Option<char> {
        match self {
            Self::Open => Some('0'),
            Self::Close => Some('1'),
            Self::Ping => Some('2'),
            Self::Pong => Some('3'),
            Self::Message => Some('4'),
            Self::Upgrade => Some('5'),
            Self::Noop => Some('6'),
            Self::Error => None,
        }
    }

    /// Parses a wire digit.
    #[inline]
    #[must_use]
    pub const fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Open),
            '1' => Some(Self::Close),
            '2' => Some(Self::Ping),
            '3' => Some(Self::Pong),
            '4' => Some(Self::Message),
            '5' => Some(Self::Upgrade),
            '6' => Some(Self::Noop),
            _ => None,
        }
    }

    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Message => "message",
            Self::Upgrade => "upgrade",
            Self::Noop => "noop",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One unit exchanged with a transport provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text frame or text body.
    Text(String),
    /// Binary frame or binary body.
    Binary(Vec<u8>),
}

impl Frame {
    /// Returns the text, if this is a text frame.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Returns `true` if this is a binary frame.
    #[inline]
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Estimated number of bytes this frame takes on the wire.
    ///
    /// Text counts UTF-8 bytes; binary is inflated by the base64 ratio.
    #[must_use]
    pub fn byte_length(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => (bytes.len() as f64 * 1.33).ceil() as usize,
        }
    }
}

impl From<String> for Frame {
    #[inline]
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Frame {
    #[inline]
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Frame {
    #[inline]
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

// ============================================================================
// Packet
// ============================================================================

/// An engine packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub kind: PacketType,
    /// Optional payload.
    pub data: Option<Frame>,
}

impl Packet {
    /// Creates a packet without payload.
    #[inline]
    #[must_use]
    pub const fn new(kind: PacketType) -> Self {
        Self { kind, data: None }
    }

    /// Creates a packet with payload.
    #[inline]
    #[must_use]
    pub fn with_data(kind: PacketType, data: impl Into<Frame>) -> Self {
        Self {
            kind,
            data: Some(data.into()),
        }
    }

    /// Creates a message packet.
    #[inline]
    #[must_use]
    pub fn message(data: impl Into<Frame>) -> Self {
        Self::with_data(PacketType::Message, data)
    }

    /// The packet produced for undecodable input.
    #[inline]
    #[must_use]
    pub fn error() -> Self {
        Self::with_data(PacketType::Error, PARSER_ERROR)
    }

    /// Returns `true` if this is the parser error packet.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind == PacketType::Error
    }

    /// Returns the payload text, if any.
    #[inline]
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.data.as_ref().and_then(Frame::as_text)
    }

    /// Estimated payload size used for polling payload budgeting.
    #[inline]
    #[must_use]
    pub fn byte_length(&self) -> usize {
        self.data.as_ref().map_or(0, Frame::byte_length)
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Session parameters carried by the `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session id.
    pub sid: String,
    /// Transports the server allows upgrading to.
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Heartbeat interval in milliseconds.
    pub ping_interval: u64,
    /// Heartbeat grace period in milliseconds.
    pub ping_timeout: u64,
    /// Largest polling payload the server accepts, `0` when unbounded.
    #[serde(default)]
    pub max_payload: u64,
}

impl Handshake {
    /// Parses the payload of an `open` packet.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the payload is not a valid handshake object
    pub fn parse(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

// ============================================================================
// Packet Encoding
// ============================================================================

/// Encodes one packet into a frame.
///
/// Binary payloads become a raw binary frame when `supports_binary` is set,
/// and base64 text otherwise.
#[must_use]
pub fn encode_packet(packet: &Packet, supports_binary: bool, version: ProtocolVersion) -> Frame {
    let digit = packet.kind.digit().unwrap_or('6');

    match &packet.data {
        Some(Frame::Binary(bytes)) if supports_binary => match version {
            ProtocolVersion::V4 => Frame::Binary(bytes.clone()),
            ProtocolVersion::V3 => {
                let mut out = Vec::with_capacity(bytes.len() + 1);
                out.push(digit as u8 - b'0');
                out.extend_from_slice(bytes);
                Frame::Binary(out)
            }
        },
        Some(Frame::Binary(bytes)) => {
            let encoded = BASE64.encode(bytes);
            match version {
                ProtocolVersion::V4 => Frame::Text(format!("{BASE64_MARKER}{encoded}")),
                ProtocolVersion::V3 => Frame::Text(format!("{BASE64_MARKER}{digit}{encoded}")),
            }
        }
        Some(Frame::Text(text)) => Frame::Text(format!("{digit}{text}")),
        None => Frame::Text(digit.to_string()),
    }
}

// ============================================================================
// Packet Decoding
// ============================================================================

/// Decodes one frame into a packet.
///
/// Malformed input yields [`Packet::error`], never a panic.
#[must_use]
pub fn decode_packet(frame: &Frame, version: ProtocolVersion) -> Packet {
    match frame {
        Frame::Text(text) => decode_text(text, version),
        Frame::Binary(bytes) => match version {
            ProtocolVersion::V4 => Packet::with_data(PacketType::Message, bytes.clone()),
            ProtocolVersion::V3 => {
                let Some((&first, rest)) = bytes.split_first() else {
                    return Packet::error();
                };
                match char::from_digit(u32::from(first), 10).and_then(PacketType::from_digit) {
                    Some(kind) => Packet::with_data(kind, rest.to_vec()),
                    None => Packet::error(),
                }
            }
        },
    }
}

/// Decodes a text-encoded packet.
fn decode_text(text: &str, version: ProtocolVersion) -> Packet {
    let mut chars = text.chars();
    let Some(first) = chars.next() else {
        return Packet::error();
    };

    if first == BASE64_MARKER {
        return decode_base64(chars.as_str(), version);
    }

    let Some(kind) = PacketType::from_digit(first) else {
        return Packet::error();
    };

    let rest = chars.as_str();
    if rest.is_empty() {
        Packet::new(kind)
    } else {
        Packet::with_data(kind, rest)
    }
}

/// Decodes a base64 binary packet (marker already stripped).
fn decode_base64(encoded: &str, version: ProtocolVersion) -> Packet {
    let (kind, encoded) = match version {
        ProtocolVersion::V4 => (PacketType::Message, encoded),
        ProtocolVersion::V3 => {
            let mut chars = encoded.chars();
            match chars.next().and_then(PacketType::from_digit) {
                Some(kind) => (kind, chars.as_str()),
                None => return Packet::error(),
            }
        }
    };

    match BASE64.decode(encoded) {
        Ok(bytes) => Packet::with_data(kind, bytes),
        Err(_) => Packet::error(),
    }
}

// ============================================================================
// Payload Encoding
// ============================================================================

/// Encodes a batch of packets into one polling body.
///
/// Binary data is always base64-encoded inside a payload.
#[must_use]
pub fn encode_payload(packets: &[Packet], version: ProtocolVersion) -> String {
    let encoded = packets.iter().map(|packet| match encode_packet(packet, false, version) {
        Frame::Text(text) => text,
        Frame::Binary(_) => String::new(),
    });

    match version {
        ProtocolVersion::V4 => encoded.collect::<Vec<_>>().join(&RECORD_SEPARATOR.to_string()),
        ProtocolVersion::V3 => encoded
            .map(|text| format!("{}:{text}", text.encode_utf16().count()))
            .collect(),
    }
}

// ============================================================================
// Payload Decoding
// ============================================================================

/// Decodes a polling body into packets.
///
/// Decoding stops at the first undecodable packet, which is included as
/// [`Packet::error`] at the end of the result.
#[must_use]
pub fn decode_payload(body: &Frame, version: ProtocolVersion) -> Vec<Packet> {
    let text = match body {
        Frame::Text(text) => text,
        Frame::Binary(_) => return vec![decode_packet(body, version)],
    };

    match version {
        ProtocolVersion::V4 => decode_separated(text, version),
        ProtocolVersion::V3 => decode_length_prefixed(text, version),
    }
}

/// Decodes a `\x1e`-separated payload.
fn decode_separated(text: &str, version: ProtocolVersion) -> Vec<Packet> {
    let mut packets = Vec::new();

    for chunk in text.split(RECORD_SEPARATOR) {
        let packet = decode_text(chunk, version);
        let failed = packet.is_error();
        packets.push(packet);
        if failed {
            break;
        }
    }

    packets
}

/// Decodes a `<utf16-length>:<packet>` payload.
fn decode_length_prefixed(text: &str, version: ProtocolVersion) -> Vec<Packet> {
    if text.is_empty() {
        return vec![Packet::error()];
    }

    let mut packets = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some((length, tail)) = rest.split_once(':') else {
            packets.push(Packet::error());
            return packets;
        };
        let Ok(units) = length.parse::<usize>() else {
            packets.push(Packet::error());
            return packets;
        };
        let Some(split) = utf16_boundary(tail, units) else {
            packets.push(Packet::error());
            return packets;
        };

        let (message, remainder) = tail.split_at(split);
        if !message.is_empty() {
            let packet = decode_text(message, version);
            if packet.is_error() {
                packets.push(packet);
                return packets;
            }
            packets.push(packet);
        }
        rest = remainder;
    }

    packets
}

/// Byte offset after `units` UTF-16 code units, if `text` is long enough
/// and the offset falls on a character boundary.
fn utf16_boundary(text: &str, units: usize) -> Option<usize> {
    let mut counted = 0;
    for (offset, c) in text.char_indices() {
        if counted == units {
            return Some(offset);
        }
        counted += c.len_utf16();
        if counted > units {
            return None;
        }
    }
    (counted == units).then_some(text.len())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const V3: ProtocolVersion = ProtocolVersion::V3;
    const V4: ProtocolVersion = ProtocolVersion::V4;

    #[test]
    fn test_encode_text_packets() {
        assert_eq!(encode_packet(&Packet::new(PacketType::Ping), true, V4), Frame::from("2"));
        assert_eq!(
            encode_packet(&Packet::with_data(PacketType::Ping, "probe"), true, V4),
            Frame::from("2probe")
        );
        assert_eq!(encode_packet(&Packet::message("hello"), true, V3), Frame::from("4hello"));
    }

    #[test]
    fn test_encode_binary_packets() {
        let packet = Packet::message(vec![1u8, 2, 3]);
        assert_eq!(encode_packet(&packet, true, V4), Frame::Binary(vec![1, 2, 3]));
        assert_eq!(encode_packet(&packet, false, V4), Frame::from("bAQID"));
        assert_eq!(encode_packet(&packet, true, V3), Frame::Binary(vec![4, 1, 2, 3]));
        assert_eq!(encode_packet(&packet, false, V3), Frame::from("b4AQID"));
    }

    #[test]
    fn test_decode_packets() {
        assert_eq!(decode_packet(&Frame::from("3probe"), V4), Packet::with_data(PacketType::Pong, "probe"));
        assert_eq!(decode_packet(&Frame::from("6"), V4), Packet::new(PacketType::Noop));
        assert_eq!(decode_packet(&Frame::from("bAQID"), V4), Packet::message(vec![1u8, 2, 3]));
        assert_eq!(decode_packet(&Frame::from("b4AQID"), V3), Packet::message(vec![1u8, 2, 3]));
        assert_eq!(decode_packet(&Frame::Binary(vec![4, 7]), V3), Packet::message(vec![7u8]));
        assert_eq!(decode_packet(&Frame::Binary(vec![7]), V4), Packet::message(vec![7u8]));
    }

    #[test]
    fn test_decode_invalid_yields_error_packet() {
        assert!(decode_packet(&Frame::from("9"), V4).is_error());
        assert!(decode_packet(&Frame::from(""), V4).is_error());
        assert!(decode_packet(&Frame::from("b!!!"), V4).is_error());
        assert!(decode_packet(&Frame::Binary(Vec::new()), V3).is_error());
        assert_eq!(Packet::error().text(), Some(PARSER_ERROR));
    }

    #[test]
    fn test_payload_v4() {
        let packets = vec![
            Packet::message("hello"),
            Packet::message(vec![1u8, 2, 3]),
            Packet::new(PacketType::Ping),
        ];
        let body = encode_payload(&packets, V4);
        assert_eq!(body, "4hello\x1ebAQID\x1e2");
        assert_eq!(decode_payload(&Frame::Text(body), V4), packets);
    }

    #[test]
    fn test_payload_v4_stops_at_error() {
        let packets = decode_payload(&Frame::from("4a\x1e9\x1e4b"), V4);
        assert_eq!(packets.len(), 2);
        assert!(packets[1].is_error());
    }

    #[test]
    fn test_payload_v3() {
        let packets = vec![Packet::message("héllo €"), Packet::new(PacketType::Pong)];
        let body = encode_payload(&packets, V3);
        assert_eq!(body, "8:4héllo €1:3");
        assert_eq!(decode_payload(&Frame::Text(body), V3), packets);
    }

    #[test]
    fn test_payload_v3_utf16_length() {
        // U+1F600 is two UTF-16 code units.
        let packets = vec![Packet::message("\u{1F600}")];
        let body = encode_payload(&packets, V3);
        assert_eq!(body, "3:4\u{1F600}");
        assert_eq!(decode_payload(&Frame::Text(body), V3), packets);
    }

    #[test]
    fn test_payload_v3_malformed() {
        assert!(decode_payload(&Frame::from("x:4a"), V3)[0].is_error());
        assert!(decode_payload(&Frame::from("10:4a"), V3)[0].is_error());
        assert!(decode_payload(&Frame::from(""), V3)[0].is_error());
    }

    #[test]
    fn test_handshake_parse() {
        let handshake = Handshake::parse(
            r#"{"sid":"abc","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();
        assert_eq!(handshake.sid, "abc");
        assert_eq!(handshake.upgrades, vec!["websocket".to_string()]);
        assert_eq!(handshake.ping_interval, 25000);
        assert_eq!(handshake.max_payload, 1_000_000);
        assert!(Handshake::parse("{}").is_err());
    }

    #[test]
    fn test_byte_length() {
        assert_eq!(Frame::from("é").byte_length(), 2);
        assert_eq!(Frame::Binary(vec![0; 3]).byte_length(), 4);
        assert_eq!(Packet::new(PacketType::Ping).byte_length(), 0);
    }
}
