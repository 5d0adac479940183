//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding, decoding or framing Satellite messages.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("empty message: missing type code")]
    EmptyMessage,

    #[error("unknown message type code: {0}")]
    UnknownMessageType(u8),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("invalid frame magic: expected 'SATF', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u16),

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownMessageType(42);
        assert!(err.to_string().contains("42"));

        let err = ProtocolError::InvalidMagic(*b"XXXX");
        assert!(err.to_string().contains("magic"));

        let err = ProtocolError::UnsupportedVersion(99);
        assert!(err.to_string().contains("99"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::CrcMismatch {
            expected: 0xABC,
            actual: 0xDEF,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc") || msg.contains("ABC"));

        let err = ProtocolError::InvalidFlags(0xFF);
        let msg = err.to_string();
        assert!(msg.contains("ff") || msg.contains("FF"));

        assert!(ProtocolError::EmptyMessage.to_string().contains("type code"));
    }
}
