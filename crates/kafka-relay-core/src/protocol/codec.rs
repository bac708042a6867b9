//! Kafka protocol frame codec.
//!
//! Implements tokio's `Decoder` and `Encoder` traits for Kafka wire protocol
//! frames. Kafka uses a simple framing format: a 4-byte big-endian length
//! prefix followed by that many bytes. The same framing is used for requests
//! and responses, so one codec serves both directions of a connection pair.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProxyError;

/// Maximum frame size (100 MB by default).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Length-prefixed frame codec.
///
/// Decoding yields the frame body without its prefix. Encoding always writes
/// a prefix computed from the body actually being sent, so a rewritten body
/// whose size changed still goes out correctly framed.
#[derive(Debug, Clone)]
pub struct KafkaCodec {
    max_frame_size: usize,
}

impl KafkaCodec {
    /// Create a new codec with default max frame size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with custom max frame size.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for KafkaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for KafkaCodec {
    type Item = BytesMut;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for the length prefix
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Read length without consuming
        let length = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if length < 0 {
            return Err(ProxyError::decode(format!("negative frame length {length}")));
        }
        let length = length as usize;

        if length > self.max_frame_size {
            return Err(ProxyError::decode(format!(
                "frame size {length} exceeds maximum {}",
                self.max_frame_size
            )));
        }

        // Need length prefix + message body
        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<Bytes> for KafkaCodec {
    type Error = ProxyError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = i32::try_from(body.len())
            .map_err(|_| ProxyError::encode(format!("frame of {} bytes is too large", body.len())))?;

        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_i32(length);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn test_decode_valid_frame() {
        let mut codec = KafkaCodec::new();
        let mut buf = make_frame(&[0, 18, 0, 3, 0, 0, 48, 57]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[0, 18, 0, 3, 0, 0, 48, 57]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_length() {
        let mut codec = KafkaCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]); // Only 3 bytes

        let result = codec.decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_incomplete_body() {
        let mut codec = KafkaCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(100); // Expect 100 bytes
        buf.put_u32(0); // Only 4 bytes of body

        let result = codec.decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert!(buf.capacity() >= 104);
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let mut codec = KafkaCodec::new();
        let wire = make_frame(b"0123456789abcdef");
        let mut buf = BytesMut::new();

        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(&decoded.unwrap()[..], b"0123456789abcdef");
            }
        }
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut codec = KafkaCodec::with_max_frame_size(100);
        let mut buf = BytesMut::new();
        buf.put_u32(200); // Larger than max

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ProxyError::ProtocolDecode { .. })));
    }

    #[test]
    fn test_decode_negative_length() {
        let mut codec = KafkaCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(-5);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProxyError::ProtocolDecode { .. })
        ));
    }

    #[test]
    fn test_decode_empty_frame() {
        let mut codec = KafkaCodec::new();
        let mut buf = make_frame(&[]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_encode_writes_fresh_prefix() {
        let mut codec = KafkaCodec::new();
        let mut dst = BytesMut::new();

        codec
            .encode(Bytes::from_static(&[1, 2, 3, 4, 5]), &mut dst)
            .unwrap();

        assert_eq!(dst.len(), 9);
        assert_eq!(u32::from_be_bytes([dst[0], dst[1], dst[2], dst[3]]), 5);
        assert_eq!(&dst[4..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_multiple_frames() {
        let mut codec = KafkaCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&make_frame(&[0, 0, 0, 1]));
        buf.extend_from_slice(&make_frame(&[0, 0, 0, 2, 9]));

        let frame1 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame1[..], &[0, 0, 0, 1]);

        let frame2 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame2[..], &[0, 0, 0, 2, 9]);

        // No more frames
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_then_encode_is_byte_identical() {
        let mut codec = KafkaCodec::new();
        let wire = make_frame(b"opaque payload");
        let mut src = wire.clone();

        let frame = codec.decode(&mut src).unwrap().unwrap();
        let mut out = BytesMut::new();
        codec.encode(frame.freeze(), &mut out).unwrap();

        assert_eq!(out, wire);
    }
}
