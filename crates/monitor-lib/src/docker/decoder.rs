//! Streaming JSON frame decoding
//!
//! The daemon writes one JSON document per frame, each terminated by a
//! newline, on a long-lived chunked response. Chunk boundaries do not line up
//! with frame boundaries, so bytes are buffered until a full document is
//! available.

use super::{ByteStream, DockerError};
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_stream::StreamExt;

/// Why the next frame could not be produced
#[derive(Debug, Error)]
pub enum StreamError {
    /// A frame could not be decoded; the stream itself is still usable
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The daemon closed the stream
    #[error("end of stream")]
    EndOfStream,

    /// Reading the response body failed
    #[error("stream transport failed: {0}")]
    Transport(#[source] DockerError),
}

impl StreamError {
    /// Whether the stream is gone and reading must stop
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamError::Malformed(_))
    }
}

/// Incremental decoder over buffered bytes
#[derive(Debug)]
pub struct FrameDecoder<T> {
    buffer: BytesMut,
    _frame: PhantomData<fn() -> T>,
}

impl<T> Default for FrameDecoder<T> {
    fn default() -> Self {
        Self {
            buffer: BytesMut::new(),
            _frame: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the stream
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Whether anything other than whitespace is still buffered
    pub fn has_pending(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Decode the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed. A malformed frame is dropped up
    /// to the next newline and the remaining bytes stay buffered.
    pub fn decode(&mut self) -> Result<Option<T>, serde_json::Error> {
        let leading = self
            .buffer
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buffer.advance(leading);

        if self.buffer.is_empty() {
            return Ok(None);
        }

        let (next, consumed) = {
            let mut frames = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<T>();
            let next = frames.next();
            (next, frames.byte_offset())
        };

        match next {
            Some(Ok(frame)) => {
                self.buffer.advance(consumed);
                Ok(Some(frame))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                self.skip_frame();
                Err(e)
            }
            None => Ok(None),
        }
    }

    /// Drop everything up to and including the next newline
    fn skip_frame(&mut self) {
        match self.buffer.iter().position(|b| *b == b'\n') {
            Some(newline) => self.buffer.advance(newline + 1),
            None => self.buffer.clear(),
        }
    }

    /// Discard everything buffered
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Decoded frames read from a response body
pub struct FrameStream<T> {
    body: ByteStream,
    decoder: FrameDecoder<T>,
    finished: bool,
}

impl<T: DeserializeOwned> FrameStream<T> {
    pub fn new(body: ByteStream) -> Self {
        Self {
            body,
            decoder: FrameDecoder::new(),
            finished: false,
        }
    }

    /// Read until the next frame is decoded or the stream fails.
    ///
    /// Cancel safe: bytes already pulled from the body stay buffered.
    pub async fn next_frame(&mut self) -> Result<T, StreamError> {
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => return Err(StreamError::Malformed(e)),
            }

            if self.finished {
                if self.decoder.has_pending() {
                    // Whatever is left can never complete
                    let trailing = serde_json::from_slice::<T>(self.decoder.buffered());
                    self.decoder.clear();
                    if let Err(e) = trailing {
                        return Err(StreamError::Malformed(e));
                    }
                }
                return Err(StreamError::EndOfStream);
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.decoder.extend(&chunk),
                Some(Err(e)) => {
                    self.finished = true;
                    return Err(StreamError::Transport(e));
                }
                None => self.finished = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Frame {
        n: u32,
    }

    fn body(chunks: &[&str]) -> ByteStream {
        let chunks: Vec<Result<Bytes, DockerError>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        Box::pin(tokio_stream::iter(chunks))
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let mut decoder = FrameDecoder::<Frame>::new();
        decoder.extend(b"{\"n\":");
        assert!(decoder.decode().unwrap().is_none());

        decoder.extend(b"1}\n{\"n\":2}\n");
        assert_eq!(decoder.decode().unwrap(), Some(Frame { n: 1 }));
        assert_eq!(decoder.decode().unwrap(), Some(Frame { n: 2 }));
        assert!(decoder.decode().unwrap().is_none());
        assert!(!decoder.has_pending());
    }

    #[test]
    fn test_decoder_skips_malformed_frame_and_keeps_rest() {
        let mut decoder = FrameDecoder::<Frame>::new();
        decoder.extend(b"{\"n\": oops}\n{\"n\":3}\n");

        assert!(decoder.decode().is_err());
        assert_eq!(decoder.decode().unwrap(), Some(Frame { n: 3 }));
    }

    #[test]
    fn test_decoder_skips_type_mismatch() {
        let mut decoder = FrameDecoder::<Frame>::new();
        decoder.extend(b"{\"n\":\"text\"}\n{\"n\":4}");

        assert!(decoder.decode().is_err());
        assert_eq!(decoder.decode().unwrap(), Some(Frame { n: 4 }));
    }

    #[tokio::test]
    async fn test_frame_stream_across_chunk_boundaries() {
        let mut stream = FrameStream::<Frame>::new(body(&["{\"n\"", ":1}\n{\"n\":", "2}\n"]));

        assert_eq!(stream.next_frame().await.unwrap(), Frame { n: 1 });
        assert_eq!(stream.next_frame().await.unwrap(), Frame { n: 2 });
        assert!(matches!(
            stream.next_frame().await,
            Err(StreamError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn test_frame_stream_recovers_after_malformed_frame() {
        let mut stream = FrameStream::<Frame>::new(body(&["garbage\n{\"n\":5}\n"]));

        let err = stream.next_frame().await.unwrap_err();
        assert!(!err.is_terminal());
        assert_eq!(stream.next_frame().await.unwrap(), Frame { n: 5 });
    }

    #[tokio::test]
    async fn test_frame_stream_truncated_tail_then_end() {
        let mut stream = FrameStream::<Frame>::new(body(&["{\"n\":6}\n{\"n\":"]));

        assert_eq!(stream.next_frame().await.unwrap(), Frame { n: 6 });
        assert!(matches!(
            stream.next_frame().await,
            Err(StreamError::Malformed(_))
        ));
        let end = stream.next_frame().await.unwrap_err();
        assert!(end.is_terminal());
        assert!(matches!(end, StreamError::EndOfStream));
    }

    #[tokio::test]
    async fn test_frame_stream_transport_error_is_terminal() {
        let chunks: Vec<Result<Bytes, DockerError>> = vec![Err(DockerError::InvalidHost(
            "tcp://nowhere".to_string(),
        ))];
        let mut stream = FrameStream::<Frame>::new(Box::pin(tokio_stream::iter(chunks)));

        let err = stream.next_frame().await.unwrap_err();
        assert!(matches!(err, StreamError::Transport(_)));
        assert!(err.is_terminal());
    }
}
