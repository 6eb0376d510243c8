//! Multipart part framing and the chunked transport seam.
//!
//! Each frame goes out as one `multipart/x-mixed-replace` part:
//!
//! ```text
//! \r\n--<boundary>\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of JPEG, written in paced sub-chunks>
//! ```

use bytes::Bytes;
use camlink_common::config::StreamConfig;
use camlink_common::frame::Frame;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

/// Written when no frame is ready, to keep the connection warm.
pub const KEEPALIVE: &[u8] = b"\r\n";

/// Failure of a single chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("write stalled")]
    Transient,
}

/// Part of a frame write that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    Boundary,
    Header,
    Payload,
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("client disconnected during {stage:?}")]
    Disconnected { stage: WriteStage },
    #[error("transient write failure during {stage:?}")]
    Transient { stage: WriteStage },
}

impl TransportError {
    fn at(stage: WriteStage) -> impl Fn(ChunkError) -> TransportError {
        move |e| match e {
            ChunkError::Disconnected => TransportError::Disconnected { stage },
            ChunkError::Transient => TransportError::Transient { stage },
        }
    }
}

/// Destination of a chunked response body.
pub trait ChunkSink: Send {
    fn send_chunk(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), ChunkError>> + Send;
}

/// Sink feeding an HTTP response body through a bounded channel.
///
/// A dropped receiver means the server has dropped the body, i.e. the peer
/// went away. A chunk that cannot be buffered within `send_timeout` means the
/// peer is not reading fast enough.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    send_timeout: Duration,
}

impl ChannelSink {
    pub fn channel(buffer: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx, send_timeout }, rx)
    }
}

impl ChunkSink for ChannelSink {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), ChunkError> {
        match self.tx.send_timeout(chunk, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(ChunkError::Disconnected),
            Err(SendTimeoutError::Timeout(_)) => Err(ChunkError::Transient),
        }
    }
}

/// Writes frames as multipart parts in fixed-size, paced sub-chunks.
#[derive(Debug, Clone)]
pub struct StreamEncoder {
    boundary: String,
    boundary_line: Bytes,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl StreamEncoder {
    pub fn new(boundary: &str, chunk_size: usize, chunk_delay: Duration) -> Self {
        Self {
            boundary: boundary.to_string(),
            boundary_line: Bytes::from(format!("\r\n--{boundary}\r\n")),
            chunk_size: chunk_size.max(1),
            chunk_delay,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(&config.boundary, config.chunk_size, config.chunk_delay())
    }

    /// Value of the response `Content-Type` header.
    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace;boundary={}", self.boundary)
    }

    pub fn part_header(len: usize) -> Bytes {
        Bytes::from(format!(
            "Content-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n"
        ))
    }

    /// Write one frame. The first failed write aborts the rest of the part;
    /// a partially written frame is never retried.
    pub async fn write_frame<K: ChunkSink>(
        &self,
        sink: &mut K,
        frame: &Frame,
    ) -> Result<(), TransportError> {
        sink.send_chunk(self.boundary_line.clone())
            .await
            .map_err(TransportError::at(WriteStage::Boundary))?;
        sink.send_chunk(Self::part_header(frame.len()))
            .await
            .map_err(TransportError::at(WriteStage::Header))?;

        let data = frame.data();
        let mut sent = 0;
        while sent < data.len() {
            let end = (sent + self.chunk_size).min(data.len());
            sink.send_chunk(data.slice(sent..end))
                .await
                .map_err(TransportError::at(WriteStage::Payload))?;
            sent = end;
            if sent < data.len() && !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }
        Ok(())
    }

    pub async fn write_keepalive<K: ChunkSink>(&self, sink: &mut K) -> Result<(), TransportError> {
        sink.send_chunk(Bytes::from_static(KEEPALIVE))
            .await
            .map_err(TransportError::at(WriteStage::KeepAlive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use proptest::prelude::*;

    fn encoder(chunk_size: usize) -> StreamEncoder {
        StreamEncoder::new("123456789000000000000987654321", chunk_size, Duration::ZERO)
    }

    fn frame(len: usize) -> Frame {
        Frame::new(Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>()), 0, 0)
    }

    /// Parse the declared Content-Length out of a recorded header chunk.
    fn declared_length(header: &[u8]) -> usize {
        let text = std::str::from_utf8(header).unwrap();
        text.lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn writes_boundary_header_and_chunked_payload() {
        let mut sink = RecordingSink::accepting();
        encoder(4).write_frame(&mut sink, &frame(10)).await.unwrap();

        assert_eq!(
            sink.chunks[0].as_ref(),
            b"\r\n--123456789000000000000987654321\r\n"
        );
        assert_eq!(
            sink.chunks[1].as_ref(),
            b"Content-Type: image/jpeg\r\nContent-Length: 10\r\n\r\n"
        );
        let sizes: Vec<_> = sink.chunks[2..].iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_between_sub_chunks() {
        let encoder = StreamEncoder::new("b", 2, Duration::from_millis(5));
        let mut sink = RecordingSink::accepting();
        let start = tokio::time::Instant::now();
        encoder.write_frame(&mut sink, &frame(6)).await.unwrap();
        // Three sub-chunks, two gaps
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(start.elapsed() < Duration::from_millis(15));
    }

    #[tokio::test]
    async fn failure_aborts_rest_of_frame() {
        // Calls: boundary, header, payload #1 ok, payload #2 fails
        let mut sink = RecordingSink::failing_at(3, ChunkError::Transient);
        let err = encoder(4).write_frame(&mut sink, &frame(12)).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Transient {
                stage: WriteStage::Payload
            }
        );
        assert_eq!(sink.calls, 4);
        assert_eq!(sink.chunks.len(), 3);
    }

    #[tokio::test]
    async fn disconnect_during_boundary_is_classified() {
        let mut sink = RecordingSink::failing_at(0, ChunkError::Disconnected);
        let err = encoder(4).write_frame(&mut sink, &frame(4)).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Disconnected {
                stage: WriteStage::Boundary
            }
        );
        assert_eq!(sink.calls, 1);
    }

    #[tokio::test]
    async fn keepalive_is_crlf() {
        let mut sink = RecordingSink::accepting();
        encoder(4).write_keepalive(&mut sink).await.unwrap();
        assert_eq!(sink.chunks, vec![Bytes::from_static(b"\r\n")]);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_sink_classifies_closed_and_stalled() {
        let (mut sink, rx) = ChannelSink::channel(1, Duration::from_millis(100));
        sink.send_chunk(Bytes::from_static(b"a")).await.unwrap();
        // Buffer full and nobody reading
        assert_eq!(
            sink.send_chunk(Bytes::from_static(b"b")).await,
            Err(ChunkError::Transient)
        );
        drop(rx);
        assert_eq!(
            sink.send_chunk(Bytes::from_static(b"c")).await,
            Err(ChunkError::Disconnected)
        );
    }

    #[test]
    fn content_type_names_boundary() {
        assert_eq!(
            encoder(1).content_type(),
            "multipart/x-mixed-replace;boundary=123456789000000000000987654321"
        );
    }

    proptest! {
        #[test]
        fn content_length_matches_payload_bytes(len in 0usize..40_000, chunk in 1usize..5000) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let mut sink = RecordingSink::accepting();
            let frame = frame(len);
            rt.block_on(encoder(chunk).write_frame(&mut sink, &frame)).unwrap();

            let payload: Vec<u8> = sink.chunks[2..].iter().flat_map(|c| c.iter().copied()).collect();
            prop_assert_eq!(declared_length(&sink.chunks[1]), len);
            prop_assert_eq!(payload.len(), len);
            prop_assert_eq!(&payload[..], frame.data().as_ref());
            prop_assert!(sink.chunks[2..].iter().all(|c| c.len() <= chunk));
        }
    }
}
