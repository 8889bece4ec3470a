//! Incremental frame codec for byte transports

use crate::frame::{parse_header, Frame, FrameError};
use crate::DEFAULT_MAX_PAYLOAD_SIZE;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Frame codec
///
/// Decoding never yields a partial frame: bytes stay buffered until the whole
/// frame is present. Oversized length prefixes are rejected before the
/// payload is buffered.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Try to decode every complete frame in the buffer
    pub fn decode_all(&mut self, buf: &mut BytesMut) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();

        while let Some(frame) = self.decode(buf)? {
            frames.push(frame);
        }

        Ok(frames)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(bounds) = parse_header(src, self.max_payload_size)? else {
            return Ok(None);
        };

        let end = bounds.end();
        if src.len() < end {
            src.reserve(end - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(end);
        raw.advance(bounds.payload_start);
        let frame = Frame::from_parts(&bounds, raw.freeze())?;

        trace!(
            "Decoded frame: stream={}, type={:?}, len={}",
            frame.stream_id,
            frame.frame_type,
            frame.payload.len()
        );
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::Truncated),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        frame.encode_into(dst, self.max_payload_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameType, StreamId};
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn id(v: u64) -> StreamId {
        StreamId::new(v).unwrap()
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::message(id(9), false, Bytes::from("split me"));
        let encoded = frame.encode(DEFAULT_MAX_PAYLOAD_SIZE).unwrap();
        let mut codec = FrameCodec::default();

        // Only the header
        let mut buf = BytesMut::from(&encoded[..3]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 3);

        // Rest of the frame
        buf.extend_from_slice(&encoded[3..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple() {
        let first = Frame::new_stream(id(0), Bytes::from("0"));
        let second = Frame::message(id(0), true, Bytes::from("hey"));
        let third = Frame::close(id(0), true);

        let mut buf = BytesMut::new();
        let mut codec = FrameCodec::default();
        for frame in [&first, &second, &third] {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }

        let frames = codec.decode_all(&mut buf).unwrap();
        assert_eq!(frames, vec![first, second, third]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_length_rejected_before_payload() {
        let mut codec = FrameCodec::new(16);

        // Header announces 1000 bytes; none of the payload has arrived
        let mut buf = BytesMut::new();
        crate::varint::encode(2, &mut buf);
        buf.extend_from_slice(&[FrameType::Message as u8]);
        crate::varint::encode(1000, &mut buf);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::PayloadTooLarge { len: 1000, max: 16 })
        ));
    }

    #[test]
    fn test_decode_eof_with_leftover_bytes() {
        let encoded = Frame::message(id(1), true, Bytes::from("abc"))
            .encode(DEFAULT_MAX_PAYLOAD_SIZE)
            .unwrap();
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);

        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::Truncated)
        ));
        assert_eq!(codec.decode_eof(&mut BytesMut::new()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, FrameCodec::default());
        let mut reader = FramedRead::new(server, FrameCodec::default());

        let frames = vec![
            Frame::new_stream(id(2), Bytes::from("2")),
            Frame::message(id(2), true, Bytes::from(vec![7u8; 500])),
            Frame::reset(id(2), true),
        ];

        let expected = frames.clone();
        let send = tokio::spawn(async move {
            for frame in frames {
                writer.send(frame).await.unwrap();
            }
        });

        for frame in expected {
            assert_eq!(reader.next().await.unwrap().unwrap(), frame);
        }
        send.await.unwrap();
    }
}
