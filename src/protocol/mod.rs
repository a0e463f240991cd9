//! Wire codecs.
//!
//! Two layers share the connection:
//!
//! | Layer | Unit | Purpose |
//! |-------|------|---------|
//! | Engine | [`Packet`] | Handshake, heartbeat, upgrade, message framing |
//! | Namespace | [`EventPacket`] | Events, acknowledgements, namespace connect |
//!
//! Every namespace packet travels as one or more engine `message`
//! packets: a text header, then one binary frame per attachment.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `event` | Namespace packets, [`Encoder`] and [`Decoder`] |
//! | `packet` | Engine packets and polling payloads |
//! | `payload` | [`Payload`] value tree with binary leaves |

// ============================================================================
// Submodules
// ============================================================================

/// Namespace-level event packets.
pub mod event;

/// Engine-level wire packets.
pub mod packet;

/// Event payload values.
pub mod payload;

// ============================================================================
// Re-exports
// ============================================================================

pub use event::{DEFAULT_NAMESPACE, Decoder, Encoder, EventPacket, EventType, PacketKind};
pub use packet::{
    Frame, Handshake, Packet, PacketType, ProtocolVersion, decode_packet, decode_payload,
    encode_packet, encode_payload,
};
pub use payload::Payload;
