//! Wire framing and the shared request/response header.
//!
//! Frame format:
//! ```text
//! +------------------+------------------+
//! | Length (4 bytes) | Payload          |
//! +------------------+------------------+
//! ```
//!
//! The length prefix is a signed big-endian 32-bit integer. Request payloads
//! start with the shared header (api key, api version, correlation id,
//! nullable client id); response payloads start with the echoed correlation
//! id. Everything after the header is opaque to this module.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ConnResult, ConnectionError, ErrorCode};

/// Default maximum frame size (100MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Length-prefixed frame codec.
///
/// Decoding returns `None` until a complete frame is buffered. A negative or
/// oversized length prefix is a [`ConnectionError::Framing`] and terminates
/// the connection: the stream position can no longer be trusted.
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> ConnResult<Option<Self::Item>> {
        // Need at least 4 bytes for the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        // Read length without consuming
        let length = (&src[..4]).get_i32();

        if length < 0 {
            return Err(ConnectionError::Framing(format!(
                "negative frame size {}",
                length
            )));
        }

        let length = length as usize;
        if length > self.max_frame_size {
            return Err(ConnectionError::Framing(format!(
                "frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        // Check if we have the full frame
        let total_length = 4 + length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<BytesMut> for FrameCodec {
    type Error = ConnectionError;

    fn encode(&mut self, item: BytesMut, dst: &mut BytesMut) -> ConnResult<()> {
        let length = item.len();

        if length > self.max_frame_size {
            return Err(ConnectionError::Framing(format!(
                "frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        dst.reserve(4 + length);
        dst.put_i32(length as i32);
        dst.extend_from_slice(&item);

        Ok(())
    }
}

/// Shared request header.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    /// Parse the header from the front of a frame, leaving the opaque request
    /// payload in `buf`. Any truncation or malformed field is a
    /// [`ConnectionError::Decode`]: the correlation id cannot be trusted
    /// before it has been read, so the caller must treat this as fatal.
    pub fn parse(buf: &mut BytesMut) -> ConnResult<Self> {
        if buf.len() < 8 {
            return Err(ConnectionError::Decode("request header too short".to_string()));
        }

        let api_key = buf.get_i16();
        let api_version = buf.get_i16();
        let correlation_id = buf.get_i32();
        let client_id = parse_nullable_string(buf)?;

        Ok(RequestHeader {
            api_key,
            api_version,
            correlation_id,
            client_id,
        })
    }
}

/// Shared response header: just the echoed correlation id.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub correlation_id: i32,
}

impl ResponseHeader {
    pub fn new(correlation_id: i32) -> Self {
        Self { correlation_id }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.correlation_id);
    }
}

/// Build a complete response body: correlation id followed by the handler
/// payload. The frame length prefix is added by [`FrameCodec`] on send.
pub fn encode_response(correlation_id: i32, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    ResponseHeader::new(correlation_id).encode(&mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Build a generic per-request error response: correlation id plus a bare
/// error code. Used for engine-generated rejections (unsupported version,
/// authentication required, authorization failed, quota rejection).
pub fn encode_error_response(correlation_id: i32, code: ErrorCode) -> BytesMut {
    let mut buf = BytesMut::with_capacity(6);
    ResponseHeader::new(correlation_id).encode(&mut buf);
    buf.put_i16(code.as_i16());
    buf
}

/// Parse a nullable string (int16 length + bytes, -1 for null)
pub fn parse_nullable_string(buf: &mut BytesMut) -> ConnResult<Option<String>> {
    if buf.len() < 2 {
        return Err(ConnectionError::Decode(
            "buffer too short for string".to_string(),
        ));
    }

    let length = buf.get_i16();

    if length < 0 {
        return Ok(None);
    }

    let length = length as usize;
    if buf.len() < length {
        return Err(ConnectionError::Decode(format!(
            "buffer too short for string of length {}",
            length
        )));
    }

    let bytes = buf.split_to(length);
    let s = String::from_utf8(bytes.to_vec())
        .map_err(|e| ConnectionError::Decode(format!("invalid UTF-8 in string: {}", e)))?;

    Ok(Some(s))
}

/// Parse a string (int16 length + bytes)
pub fn parse_string(buf: &mut BytesMut) -> ConnResult<String> {
    parse_nullable_string(buf)?
        .ok_or_else(|| ConnectionError::Decode("expected non-null string".to_string()))
}

/// Parse nullable bytes (int32 length + bytes, -1 for null)
pub fn parse_nullable_bytes(buf: &mut BytesMut) -> ConnResult<Option<Vec<u8>>> {
    if buf.len() < 4 {
        return Err(ConnectionError::Decode(
            "buffer too short for bytes".to_string(),
        ));
    }

    let length = buf.get_i32();

    if length < 0 {
        return Ok(None);
    }

    let length = length as usize;
    if buf.len() < length {
        return Err(ConnectionError::Decode(format!(
            "buffer too short for bytes of length {}",
            length
        )));
    }

    Ok(Some(buf.split_to(length).to_vec()))
}

/// Parse bytes (int32 length + bytes)
pub fn parse_bytes(buf: &mut BytesMut) -> ConnResult<Vec<u8>> {
    parse_nullable_bytes(buf)?
        .ok_or_else(|| ConnectionError::Decode("expected non-null bytes".to_string()))
}

/// Encode a nullable string
pub fn encode_nullable_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_i16(s.len() as i16);
            buf.extend_from_slice(s.as_bytes());
        }
        None => {
            buf.put_i16(-1);
        }
    }
}

/// Encode a string
pub fn encode_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.extend_from_slice(s.as_bytes());
}

/// Encode bytes (int32 length prefix)
pub fn encode_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===============================================================
    // FrameCodec
    // ===============================================================

    #[test]
    fn codec_roundtrip_simple() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let payload = BytesMut::from(&b"hello broker"[..]);
        codec.encode(payload.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_decode_incomplete_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_decode_incomplete_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(100);
        buf.extend_from_slice(&[0u8; 10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_decode_negative_length_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(-5);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ConnectionError::Framing(_)));
    }

    #[test]
    fn codec_decode_oversized_frame_rejected() {
        let mut codec = FrameCodec::with_max_frame_size(1024);
        let mut buf = BytesMut::new();
        buf.put_i32(2048);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(format!("{}", err).contains("exceeds maximum"));
    }

    #[test]
    fn codec_decode_zero_length_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_i32(0);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn codec_decode_multiple_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            buf.put_i32(payload.len() as i32);
            buf.extend_from_slice(payload);
        }

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"three");
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_encode_oversized_rejected() {
        let mut codec = FrameCodec::with_max_frame_size(16);
        let mut dst = BytesMut::new();
        let payload = BytesMut::from(&[0u8; 32][..]);
        assert!(codec.encode(payload, &mut dst).is_err());
    }

    #[test]
    fn codec_encode_length_prefix_is_correct() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(BytesMut::from(&b"12345"[..]), &mut buf).unwrap();
        assert_eq!((&buf[..4]).get_i32(), 5);
        assert_eq!(&buf[4..], b"12345");
    }

    // ===============================================================
    // RequestHeader
    // ===============================================================

    #[test]
    fn request_header_parse_basic() {
        let mut buf = BytesMut::new();
        buf.put_i16(3);
        buf.put_i16(1);
        buf.put_i32(42);
        encode_nullable_string(&mut buf, Some("my-client"));
        buf.extend_from_slice(b"payload");

        let header = RequestHeader::parse(&mut buf).unwrap();
        assert_eq!(header.api_key, 3);
        assert_eq!(header.api_version, 1);
        assert_eq!(header.correlation_id, 42);
        assert_eq!(header.client_id.as_deref(), Some("my-client"));
        assert_eq!(&buf[..], b"payload");
    }

    #[test]
    fn request_header_parse_null_client_id() {
        let mut buf = BytesMut::new();
        buf.put_i16(0);
        buf.put_i16(0);
        buf.put_i32(1);
        buf.put_i16(-1);

        let header = RequestHeader::parse(&mut buf).unwrap();
        assert_eq!(header.client_id, None);
    }

    #[test]
    fn request_header_parse_too_short() {
        let mut buf = BytesMut::new();
        buf.put_i16(0);
        assert!(RequestHeader::parse(&mut buf).is_err());
    }

    #[test]
    fn request_header_parse_truncated_client_id() {
        let mut buf = BytesMut::new();
        buf.put_i16(3);
        buf.put_i16(0);
        buf.put_i32(7);
        buf.put_i16(10); // says 10 bytes follow
        buf.extend_from_slice(b"short");

        assert!(RequestHeader::parse(&mut buf).is_err());
    }

    #[test]
    fn request_header_negative_correlation_id_is_valid() {
        let mut buf = BytesMut::new();
        buf.put_i16(1);
        buf.put_i16(0);
        buf.put_i32(-1);
        buf.put_i16(-1);

        let header = RequestHeader::parse(&mut buf).unwrap();
        assert_eq!(header.correlation_id, -1);
    }

    // ===============================================================
    // Response encoding
    // ===============================================================

    #[test]
    fn response_echoes_correlation_id() {
        let mut buf = encode_response(42, b"abc");
        assert_eq!(buf.get_i32(), 42);
        assert_eq!(&buf[..], b"abc");
    }

    #[test]
    fn error_response_layout() {
        let mut buf = encode_error_response(7, ErrorCode::UnsupportedVersion);
        assert_eq!(buf.get_i32(), 7);
        assert_eq!(buf.get_i16(), 35);
        assert!(buf.is_empty());
    }

    // ===============================================================
    // String / bytes helpers
    // ===============================================================

    #[test]
    fn nullable_string_roundtrip() {
        let mut buf = BytesMut::new();
        encode_nullable_string(&mut buf, Some("hello"));
        assert_eq!(
            parse_nullable_string(&mut buf).unwrap().as_deref(),
            Some("hello")
        );

        let mut buf = BytesMut::new();
        encode_nullable_string(&mut buf, None);
        assert_eq!(buf.len(), 2);
        assert_eq!(parse_nullable_string(&mut buf).unwrap(), None);
    }

    #[test]
    fn string_null_errors() {
        let mut buf = BytesMut::new();
        encode_nullable_string(&mut buf, None);
        assert!(parse_string(&mut buf).is_err());
    }

    #[test]
    fn bytes_roundtrip() {
        let mut buf = BytesMut::new();
        encode_bytes(&mut buf, b"\x00\x01\xFF");
        assert_eq!(parse_bytes(&mut buf).unwrap(), vec![0x00, 0x01, 0xFF]);
    }

    #[test]
    fn nullable_bytes_truncated_errors() {
        let mut buf = BytesMut::new();
        buf.put_i32(100);
        buf.extend_from_slice(&[0u8; 10]);
        assert!(parse_nullable_bytes(&mut buf).is_err());
    }

    #[test]
    fn string_invalid_utf8_errors() {
        let mut buf = BytesMut::new();
        buf.put_i16(2);
        buf.extend_from_slice(&[0xFF, 0xFE]);
        assert!(parse_nullable_string(&mut buf).is_err());
    }
}
