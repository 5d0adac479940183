//! Transport framing for byte-stream sockets.
//!
//! Satellite messages carry no length prefix of their own, so stream
//! transports (TCP, TLS) wrap each one in a frame:
//!
//! ```text
//! +--------+---------+--------+-------------+--------+---------------------+
//! | magic  | version | flags  | payload_len | crc32c | payload             |
//! | 4 bytes| 2 bytes |2 bytes |   4 bytes   | 4 bytes| payload_len bytes   |
//! +--------+---------+--------+-------------+--------+---------------------+
//! ```
//!
//! The payload is exactly one `[type code][protobuf body]` message.

use crate::error::ProtocolError;
use crate::{FRAME_VERSION, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying Satellite frames: "SATF"
pub const MAGIC: [u8; 4] = *b"SATF";

/// Size of the fixed frame header in bytes (4+2+2+4+4 = 16).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// CRC32C checksum is present and valid.
    pub const CRC_PRESENT: u16 = 1 << 0;

    const VALID_MASK: u16 = 0x0001;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A framed Satellite message.
#[derive(Debug, Clone)]
pub struct Frame {
    pub flags: FrameFlags,
    /// One encoded Satellite message.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a CRC-protected frame around an encoded message.
    pub fn new(payload: Bytes) -> Self {
        Self {
            flags: FrameFlags::new().with_crc(),
            payload,
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let payload_len = self.payload.len() as u32;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(FRAME_VERSION);
        buf.put_u16(self.flags.bits());
        buf.put_u32(payload_len);
        let crc = if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        };
        buf.put_u32(crc);
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if more data is needed. Bytes are consumed only
    /// once a complete frame is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != FRAME_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;

        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        let total_len = FRAME_HEADER_SIZE + payload_len as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len as usize).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self { flags, payload }))
    }
}

/// Accumulates stream bytes and yields complete frame payloads.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the payload of the next complete frame, if any.
    pub fn next_payload(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        Ok(Frame::decode(&mut self.buffer)?.map(|frame| frame.payload))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let payload = Bytes::from_static(&[5]);
        let encoded = Frame::new(payload.clone()).encode().unwrap();
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 1);

        let mut buf = encoded;
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(decoded.flags.has_crc());
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_crc_validation() {
        let mut encoded = Frame::new(Bytes::from_static(b"\x0bpayload")).encode().unwrap();
        let len = encoded.len();
        encoded[len - 1] ^= 0xFF;

        let result = Frame::decode(&mut encoded);
        assert!(matches!(result, Err(ProtocolError::CrcMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&b"BADX\x00\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::InvalidMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = BytesMut::from(&b"SATF\x00\x63\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"[..]);
        let result = Frame::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_invalid_flags() {
        let result = FrameFlags::from_bits(0x0100);
        assert!(matches!(result, Err(ProtocolError::InvalidFlags(0x0100))));
    }

    #[test]
    fn test_frame_too_large() {
        let huge = vec![0u8; (MAX_PAYLOAD_SIZE + 1) as usize];
        let result = Frame::new(Bytes::from(huge)).encode();
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_frame_without_crc() {
        let mut frame = Frame::new(Bytes::from_static(&[6]));
        frame.flags = FrameFlags::new();

        let mut buf = frame.encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.flags.has_crc());
    }

    #[test]
    fn test_decoder_partial_and_multiple_frames() {
        let first = Frame::new(Bytes::from_static(&[5])).encode().unwrap();
        let second = Frame::new(Bytes::from_static(&[6, 0x0a, 0x01, 0x07])).encode().unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&first[..10]);
        assert!(decoder.next_payload().unwrap().is_none());
        assert_eq!(decoder.buffered(), 10);

        decoder.extend(&first[10..]);
        decoder.extend(&second);
        assert_eq!(decoder.next_payload().unwrap().unwrap().as_ref(), &[5]);
        assert_eq!(
            decoder.next_payload().unwrap().unwrap().as_ref(),
            &[6, 0x0a, 0x01, 0x07]
        );
        assert!(decoder.next_payload().unwrap().is_none());
        assert_eq!(decoder.buffered(), 0);
    }
}
