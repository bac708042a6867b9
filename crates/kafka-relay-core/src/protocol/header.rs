//! Fixed-position header fields of Kafka frames.
//!
//! Every request starts with `api_key: i16`, `api_version: i16`,
//! `correlation_id: i32`; every response starts with `correlation_id: i32`.
//! That is all the relay needs to route a frame. Bodies stay opaque except
//! for the `acks` field of Produce requests, which decides whether the broker
//! will answer at all.

use std::fmt;

use bytes::Buf;
use kafka_protocol::messages::{ApiKey, ProduceRequest};
use kafka_protocol::protocol::HeaderVersion;

use crate::error::{ProxyError, Result};

/// Routing fields of a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
}

impl FrameHeader {
    /// Size of the fixed request header prefix.
    pub const LEN: usize = 8;

    /// Read the fixed header from a request body (length prefix removed).
    ///
    /// # Errors
    ///
    /// Returns a decode error if the frame is shorter than 8 bytes. Unknown
    /// API keys are not an error; such frames are relayed opaquely.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < Self::LEN {
            return Err(ProxyError::decode(format!(
                "request frame of {} bytes is too small for a header",
                frame.len()
            )));
        }
        Ok(Self {
            api_key: i16::from_be_bytes([frame[0], frame[1]]),
            api_version: i16::from_be_bytes([frame[2], frame[3]]),
            correlation_id: i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
        })
    }

    /// The API key, if it is one this build knows about.
    #[must_use]
    pub fn api(&self) -> Option<ApiKey> {
        ApiKey::try_from(self.api_key).ok()
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.api() {
            Some(api) => write!(f, "{api:?}"),
            None => write!(f, "ApiKey({})", self.api_key),
        }?;
        write!(f, " v{} #{}", self.api_version, self.correlation_id)
    }
}

/// Read the correlation id from a response body.
///
/// # Errors
///
/// Returns a decode error if the frame is shorter than 4 bytes.
pub fn response_correlation_id(frame: &[u8]) -> Result<i32> {
    match frame {
        [a, b, c, d, ..] => Ok(i32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(ProxyError::decode(format!(
            "response frame of {} bytes is too small for a header",
            frame.len()
        ))),
    }
}

/// Whether the broker will send a response for this request.
///
/// Only Produce with `acks = 0` is fire-and-forget.
///
/// # Errors
///
/// Returns a decode error if a Produce request is truncated before `acks`.
pub fn expects_response(header: &FrameHeader, frame: &[u8]) -> Result<bool> {
    if header.api_key != ApiKey::Produce as i16 {
        return Ok(true);
    }
    Ok(produce_acks(header.api_version, frame)? != 0)
}

fn produce_acks(version: i16, frame: &[u8]) -> Result<i16> {
    let truncated = || ProxyError::decode("produce request truncated before acks");
    let mut buf = frame.get(FrameHeader::LEN..).ok_or_else(truncated)?;

    // client_id is a plain nullable string in every header version.
    skip_nullable_string(&mut buf).ok_or_else(truncated)?;
    if ProduceRequest::header_version(version) >= 2 {
        skip_tagged_fields(&mut buf).ok_or_else(truncated)?;
    }

    let flexible = version >= 9;
    if version >= 3 {
        if flexible {
            skip_compact_nullable_string(&mut buf).ok_or_else(truncated)?;
        } else {
            skip_nullable_string(&mut buf).ok_or_else(truncated)?;
        }
    }

    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_i16())
}

fn skip(buf: &mut &[u8], n: usize) -> Option<()> {
    if buf.remaining() < n {
        return None;
    }
    buf.advance(n);
    Some(())
}

fn skip_nullable_string(buf: &mut &[u8]) -> Option<()> {
    if buf.remaining() < 2 {
        return None;
    }
    let len = buf.get_i16();
    if len > 0 {
        skip(buf, len as usize)?;
    }
    Some(())
}

fn skip_compact_nullable_string(buf: &mut &[u8]) -> Option<()> {
    let len = read_unsigned_varint(buf)?;
    if len > 1 {
        skip(buf, (len - 1) as usize)?;
    }
    Some(())
}

fn skip_tagged_fields(buf: &mut &[u8]) -> Option<()> {
    let count = read_unsigned_varint(buf)?;
    for _ in 0..count {
        let _tag = read_unsigned_varint(buf)?;
        let size = read_unsigned_varint(buf)?;
        skip(buf, size as usize)?;
    }
    Some(())
}

fn read_unsigned_varint(buf: &mut &[u8]) -> Option<u32> {
    let mut value = 0u32;
    for shift in (0..35).step_by(7) {
        if !buf.has_remaining() {
            return None;
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}
