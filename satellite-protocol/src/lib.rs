//! # satellite-protocol
//!
//! Wire protocol implementation for the Satellite replication protocol.
//!
//! This crate provides:
//! - Protobuf message schema for every Satellite message
//! - Type-tagged message codec: `[1-byte type code][protobuf body]`
//! - Length-prefixed, CRC-checked framing for byte-stream transports

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{decode, encode};
pub use error::ProtocolError;
pub use frame::{Frame, FrameDecoder, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{MessageType, SatMessage};

/// Protocol version announced in the `PROTO_VERSION` auth header.
pub const PROTOCOL_VSN: &str = "1.0";

/// Version of the transport frame layout.
pub const FRAME_VERSION: u16 = 1;

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
