//! Multiplexing frames and their wire encoding

use crate::varint::{self, Varint};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Stream identifier
///
/// Ids must stay below `2^63` so that the initiator bit still fits in the
/// header varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Largest representable stream id
    pub const MAX: StreamId = StreamId(u64::MAX >> 1);

    pub fn new(id: u64) -> Result<Self, FrameError> {
        if id > Self::MAX.0 {
            return Err(FrameError::StreamIdOverflow(id));
        }
        Ok(Self(id))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_even(&self) -> bool {
        self.0 % 2 == 0
    }

    /// The id two steps further along the same parity, if one exists
    pub fn next_same_parity(&self) -> Option<StreamId> {
        self.0
            .checked_add(2)
            .filter(|next| *next <= Self::MAX.0)
            .map(StreamId)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    New = 0,
    Message = 1,
    Close = 2,
    Reset = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::New),
            1 => Ok(FrameType::Message),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::Reset),
            _ => Err(FrameError::UnknownFrameType(value)),
        }
    }
}

/// Frame codec errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Truncated frame")]
    Truncated,

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("Varint overflow")]
    VarintOverflow,

    #[error("Stream id out of range: {0}")]
    StreamIdOverflow(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    /// Set when the sender of this frame opened the stream
    pub initiator: bool,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

/// Where a complete frame sits inside a buffer
pub(crate) struct FrameBounds {
    pub header: u64,
    pub type_byte: u8,
    pub payload_start: usize,
    pub payload_len: usize,
}

impl FrameBounds {
    pub fn end(&self) -> usize {
        self.payload_start + self.payload_len
    }
}

/// Parse a frame header from the front of `buf`.
///
/// Returns `Ok(None)` if the header is not complete yet. The payload length is
/// checked against `max_payload` as soon as it is known, before the payload
/// itself has arrived.
pub(crate) fn parse_header(buf: &[u8], max_payload: usize) -> Result<Option<FrameBounds>, FrameError> {
    let (header, mut pos) = match varint::decode(buf) {
        Varint::Value(v, n) => (v, n),
        Varint::Incomplete => return Ok(None),
        Varint::Overflow => return Err(FrameError::VarintOverflow),
    };

    let Some(&type_byte) = buf.get(pos) else {
        return Ok(None);
    };
    FrameType::try_from(type_byte)?;
    pos += 1;

    let (length, n) = match varint::decode(&buf[pos..]) {
        Varint::Value(v, n) => (v, n),
        Varint::Incomplete => return Ok(None),
        Varint::Overflow => return Err(FrameError::VarintOverflow),
    };
    pos += n;

    let payload_len = usize::try_from(length).map_err(|_| FrameError::PayloadTooLarge {
        len: usize::MAX,
        max: max_payload,
    })?;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            len: payload_len,
            max: max_payload,
        });
    }

    Ok(Some(FrameBounds {
        header,
        type_byte,
        payload_start: pos,
        payload_len,
    }))
}

impl Frame {
    pub fn new(stream_id: StreamId, initiator: bool, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            initiator,
            frame_type,
            payload,
        }
    }

    pub fn new_stream(stream_id: StreamId, name: Bytes) -> Self {
        Self::new(stream_id, true, FrameType::New, name)
    }

    pub fn message(stream_id: StreamId, initiator: bool, payload: Bytes) -> Self {
        Self::new(stream_id, initiator, FrameType::Message, payload)
    }

    pub fn close(stream_id: StreamId, initiator: bool) -> Self {
        Self::new(stream_id, initiator, FrameType::Close, Bytes::new())
    }

    pub fn reset(stream_id: StreamId, initiator: bool) -> Self {
        Self::new(stream_id, initiator, FrameType::Reset, Bytes::new())
    }

    /// Header value carried by the leading varint
    fn header(&self) -> u64 {
        (self.stream_id.value() << 1) | u64::from(self.initiator)
    }

    /// Size of this frame on the wire
    pub fn encoded_len(&self) -> usize {
        varint::encoded_len(self.header())
            + 1
            + varint::encoded_len(self.payload.len() as u64)
            + self.payload.len()
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut, max_payload: usize) -> Result<(), FrameError> {
        let payload_len = self.payload.len();
        if payload_len > max_payload {
            return Err(FrameError::PayloadTooLarge {
                len: payload_len,
                max: max_payload,
            });
        }

        buf.reserve(self.encoded_len());
        varint::encode(self.header(), buf);
        buf.put_u8(self.frame_type as u8);
        varint::encode(payload_len as u64, buf);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self, max_payload: usize) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf, max_payload)?;
        Ok(buf.freeze())
    }

    /// Decode exactly one complete frame from `buf`
    pub fn decode(buf: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        let bounds = parse_header(buf, max_payload)?.ok_or(FrameError::Truncated)?;
        let end = bounds.end();
        if buf.len() < end {
            return Err(FrameError::Truncated);
        }
        if buf.len() > end {
            return Err(FrameError::TrailingBytes(buf.len() - end));
        }

        Self::from_parts(&bounds, Bytes::copy_from_slice(&buf[bounds.payload_start..end]))
    }

    pub(crate) fn from_parts(bounds: &FrameBounds, payload: Bytes) -> Result<Self, FrameError> {
        Ok(Self {
            stream_id: StreamId::new(bounds.header >> 1)?,
            initiator: bounds.header & 1 == 1,
            frame_type: FrameType::try_from(bounds.type_byte)?,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MAX_PAYLOAD_SIZE as MAX;

    fn id(v: u64) -> StreamId {
        StreamId::new(v).unwrap()
    }

    #[test]
    fn test_frame_encode_decode() {
        let frame = Frame::message(id(42), true, Bytes::from("hello world"));

        let encoded = frame.encode(MAX).unwrap();
        assert_eq!(encoded.len(), frame.encoded_len());

        let decoded = Frame::decode(&encoded, MAX).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_header_layout() {
        let encoded = Frame::close(id(3), false).encode(MAX).unwrap();
        assert_eq!(&encoded[..], &[3 << 1, FrameType::Close as u8, 0]);

        let encoded = Frame::new_stream(id(0), Bytes::from("0")).encode(MAX).unwrap();
        assert_eq!(&encoded[..], &[1, FrameType::New as u8, 1, b'0']);
    }

    #[test]
    fn test_all_frame_types() {
        let frames = [
            Frame::new_stream(id(2), Bytes::from("2")),
            Frame::message(id(7), false, Bytes::from(vec![0u8; 300])),
            Frame::close(id(StreamId::MAX.value()), true),
            Frame::reset(id(1), false),
        ];

        for frame in frames {
            let encoded = frame.encode(MAX).unwrap();
            assert_eq!(Frame::decode(&encoded, MAX).unwrap(), frame);
        }
    }

    #[test]
    fn test_decode_truncated_is_error() {
        let encoded = Frame::message(id(5), true, Bytes::from("payload"))
            .encode(MAX)
            .unwrap();

        for cut in 0..encoded.len() {
            assert!(
                matches!(Frame::decode(&encoded[..cut], MAX), Err(FrameError::Truncated)),
                "cut at {} should be truncated",
                cut
            );
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut encoded = Frame::close(id(1), true).encode(MAX).unwrap().to_vec();
        encoded.push(0);
        assert!(matches!(
            Frame::decode(&encoded, MAX),
            Err(FrameError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let result = Frame::decode(&[2, 9, 0], MAX);
        assert!(matches!(result, Err(FrameError::UnknownFrameType(9))));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::message(id(1), true, Bytes::from(vec![1u8; 64]));
        assert!(matches!(
            frame.encode(32),
            Err(FrameError::PayloadTooLarge { len: 64, max: 32 })
        ));

        let encoded = frame.encode(MAX).unwrap();
        assert!(matches!(
            Frame::decode(&encoded, 32),
            Err(FrameError::PayloadTooLarge { len: 64, max: 32 })
        ));
    }

    #[test]
    fn test_stream_id_range() {
        assert!(StreamId::new(u64::MAX >> 1).is_ok());
        assert!(matches!(
            StreamId::new(u64::MAX),
            Err(FrameError::StreamIdOverflow(_))
        ));
        assert_eq!(id(4).next_same_parity(), Some(id(6)));
        assert_eq!(StreamId::MAX.next_same_parity(), None);
    }
}
