//! Streaming frame decoder and tokio codec

use crate::mux::{Frame, ProtocolError};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Header parsing state shared by [`FrameDecoder`] and [`FrameCodec`]
#[derive(Debug, Clone)]
struct DecodeState {
    max_frame_size: usize,
    /// Payload bytes of an oversized frame still to be skipped
    discard_remaining: usize,
}

impl DecodeState {
    fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            discard_remaining: 0,
        }
    }

    fn skip_discarded(&mut self, src: &mut BytesMut) {
        if self.discard_remaining == 0 {
            return;
        }
        let n = self.discard_remaining.min(src.len());
        src.advance(n);
        self.discard_remaining -= n;
    }

    /// Returns Ok(Some(frame)) if a complete frame was decoded,
    /// Ok(None) if more data is needed.
    /// On error the offending frame's bytes are consumed.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        self.skip_discarded(src);
        if self.discard_remaining > 0 {
            return Ok(None);
        }

        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let kind = src[0];
        let stream_id = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        let length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;

        if length > self.max_frame_size {
            src.advance(Frame::HEADER_SIZE);
            self.discard_remaining = length;
            self.skip_discarded(src);
            warn!(
                stream_id,
                length,
                max = self.max_frame_size,
                "Discarding oversized frame"
            );
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        if src.len() < Frame::HEADER_SIZE + length {
            src.reserve(Frame::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Frame::HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        Frame::from_parts(kind, stream_id, payload).map(Some)
    }
}

/// Incremental decoder fed with arbitrary byte chunks
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::new(max_frame_size),
            buffer: BytesMut::new(),
        }
    }

    /// Append a chunk read from the channel
    pub fn push(&mut self, chunk: &[u8]) {
        let mut chunk = chunk;
        if self.state.discard_remaining > 0 && self.buffer.is_empty() {
            let n = self.state.discard_remaining.min(chunk.len());
            chunk = &chunk[n..];
            self.state.discard_remaining -= n;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Try to decode the next frame from what has been pushed so far
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        self.state.decode(&mut self.buffer)
    }

    /// Drain every frame currently decodable, errors included
    pub fn decode_all(&mut self) -> Vec<Result<Frame, ProtocolError>> {
        let mut frames = Vec::new();
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => frames.push(Ok(frame)),
                Ok(None) => break,
                Err(e) => frames.push(Err(e)),
            }
        }
        frames
    }

    /// Bytes currently held waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_frame_size(&self) -> usize {
        self.state.max_frame_size
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Frame codec for use with `tokio_util::codec::Framed`
#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: DecodeState,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::new(max_frame_size),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        Ok(self.state.decode(src)?)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let size = frame.payload_len();
        if size > self.state.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.state.max_frame_size,
            }
            .into());
        }
        frame.encode_into(dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StreamTransport, DEFAULT_MAX_FRAME_SIZE};
    use bytes::Bytes;

    fn encode(frame: &Frame) -> Bytes {
        frame.encode().unwrap()
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::open(1, "10.0.0.1:6443", StreamTransport::Tls);
        let encoded = encode(&frame);

        let mut decoder = FrameDecoder::default();
        decoder.push(&encoded[..4]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.push(&encoded[4..12]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.push(&encoded[12..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(frame));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_byte_at_a_time_interleaved_streams() {
        let frames = vec![
            Frame::open(1, "a:1", StreamTransport::Plain),
            Frame::open(2, "b:2", StreamTransport::Plain),
            Frame::data(1, Bytes::from_static(b"one-a")),
            Frame::data(2, Bytes::from_static(b"two-a")),
            Frame::data(1, Bytes::from_static(b"one-b")),
            Frame::close(2, "done"),
            Frame::data(1, Bytes::from_static(b"one-c")),
            Frame::close(1, ""),
        ];
        let wire: Vec<u8> = frames.iter().flat_map(|f| encode(f).to_vec()).collect();

        let mut decoder = FrameDecoder::default();
        let mut decoded = Vec::new();
        for byte in wire {
            decoder.push(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, frames);

        let stream_one: Vec<Bytes> = decoded
            .iter()
            .filter_map(|f| match f {
                Frame::Data { stream_id: 1, payload } => Some(payload.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            stream_one,
            vec![
                Bytes::from_static(b"one-a"),
                Bytes::from_static(b"one-b"),
                Bytes::from_static(b"one-c")
            ]
        );
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let max = 64;
        let mut decoder = FrameDecoder::new(max);

        let big = Frame::data(3, Bytes::from(vec![0xAB; 200]));
        let after = Frame::close(4, "still parsed");

        let big_wire = encode(&big);
        // header plus the first part of the oversized payload
        decoder.push(&big_wire[..50]);
        assert_eq!(
            decoder.next_frame(),
            Err(ProtocolError::FrameTooLarge { size: 200, max })
        );
        assert!(decoder.buffered() <= Frame::HEADER_SIZE + max);

        decoder.push(&big_wire[50..150]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);

        let mut tail = big_wire[150..].to_vec();
        tail.extend_from_slice(&encode(&after));
        decoder.push(&tail);
        assert_eq!(decoder.next_frame().unwrap(), Some(after));
    }

    #[test]
    fn test_malformed_frame_is_consumed() {
        let mut raw = encode(&Frame::close(1, "x")).to_vec();
        raw[0] = 42;
        let good = Frame::data(1, Bytes::from_static(b"ok"));
        raw.extend_from_slice(&encode(&good));

        let mut decoder = FrameDecoder::default();
        decoder.push(&raw);
        let results = decoder.decode_all();

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(ProtocolError::Malformed(_))));
        assert_eq!(results[1], Ok(good));
    }

    #[test]
    fn test_codec_rejects_oversized_outbound() {
        let mut codec = FrameCodec::new(8);
        let mut dst = BytesMut::new();
        let result = codec.encode(Frame::data(1, Bytes::from(vec![0; 9])), &mut dst);
        assert!(matches!(
            result,
            Err(CodecError::Protocol(ProtocolError::FrameTooLarge { size: 9, max: 8 }))
        ));
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        use futures::{SinkExt, StreamExt};
        use tokio_util::codec::Framed;

        let (a, b) = tokio::io::duplex(64);
        let mut left = Framed::new(a, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE));
        let mut right = Framed::new(b, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE));

        let payload = Bytes::from(vec![7u8; 4096]);
        let sent = vec![
            Frame::Ping { nonce: 1 },
            Frame::data(9, payload.clone()),
            Frame::window_update(9, 1024),
        ];

        let writer = tokio::spawn(async move {
            for frame in sent {
                left.send(frame).await.unwrap();
            }
            left
        });

        assert_eq!(right.next().await.unwrap().unwrap(), Frame::Ping { nonce: 1 });
        assert_eq!(right.next().await.unwrap().unwrap(), Frame::data(9, payload));
        assert_eq!(
            right.next().await.unwrap().unwrap(),
            Frame::window_update(9, 1024)
        );
        writer.await.unwrap();
    }
}
