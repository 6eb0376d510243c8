use bytes::{Bytes, BytesMut};
use camlink_common::frame::{Frame, FramePool};
use chrono::Utc;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CaptureError, FrameSource};

const HEADER_END: &[u8] = b"\r\n\r\n";
const DEFAULT_BOUNDARY: &str = "frame";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
}

/// Camera stand-in fed by an upstream MJPEG-over-HTTP stream.
///
/// A background task parses the upstream body and overwrites a single
/// latest-frame slot, so a slow caller always gets the newest image and
/// intermediate ones are simply lost.
pub struct MjpegSource {
    latest: watch::Receiver<Option<Bytes>>,
    pool: FramePool,
    acquire_timeout: Duration,
}

impl MjpegSource {
    pub fn spawn(
        url: String,
        pool: FramePool,
        acquire_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("upstream reader cancelled"),
                _ = run_upstream(&url, &tx) => {}
            }
        });
        Self::from_receiver(rx, pool, acquire_timeout)
    }

    fn from_receiver(
        latest: watch::Receiver<Option<Bytes>>,
        pool: FramePool,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            latest,
            pool,
            acquire_timeout,
        }
    }
}

impl FrameSource for MjpegSource {
    async fn acquire(&mut self) -> Result<Frame, CaptureError> {
        match tokio::time::timeout(self.acquire_timeout, self.latest.changed()).await {
            Err(_) => return Err(CaptureError::NoFrame(self.acquire_timeout)),
            Ok(Err(_)) => return Err(CaptureError::UpstreamDown),
            Ok(Ok(())) => {}
        }
        let jpeg = self
            .latest
            .borrow_and_update()
            .clone()
            .ok_or(CaptureError::NoFrame(self.acquire_timeout))?;
        Ok(self.pool.lease(jpeg, Utc::now().timestamp_millis())?)
    }
}

/// Follow the upstream stream forever, reconnecting with exponential backoff.
async fn run_upstream(url: &str, latest: &watch::Sender<Option<Bytes>>) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        if latest.is_closed() {
            debug!("no frame consumers left, stopping upstream reader");
            return;
        }
        info!(url, "connecting to upstream MJPEG stream");
        match consume_stream(url, latest).await {
            Ok(()) => {
                info!("upstream stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(e) => {
                error!(error = %e, "upstream stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(
    url: &str,
    latest: &watch::Sender<Option<Bytes>>,
) -> Result<(), UpstreamError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(UpstreamError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(UpstreamError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(UpstreamError::HttpStatus(response.status().as_u16()));
    }

    let boundary = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(boundary_from_content_type)
        .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());

    info!(status = %response.status(), boundary, "connected to upstream MJPEG stream");

    let mut parser = PartParser::new(&boundary);
    let mut byte_stream = response.bytes_stream();
    let mut frames: u64 = 0;

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(UpstreamError::HttpStream)?;
        parser.push(&chunk);
        while let Some(jpeg) = parser.next_frame() {
            frames += 1;
            if frames % 100 == 0 {
                debug!(frames, bytes = jpeg.len(), "upstream frames received");
            }
            latest.send_replace(Some(jpeg));
        }
        if latest.is_closed() {
            warn!("frame slot closed while reading upstream");
            return Ok(());
        }
    }

    Ok(())
}

/// Extract the `boundary=` parameter of a multipart content type.
fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"').trim_start_matches("--");
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Parse state for the MJPEG multipart stream.
#[derive(Debug, Clone, Copy)]
enum ParseState {
    /// Looking for the boundary marker `--<boundary>`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes, either a known length or up to the next boundary.
    CollectingJpeg { expected: Option<usize> },
}

/// Incremental parser for `multipart/x-mixed-replace` bodies.
pub struct PartParser {
    marker: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
}

impl PartParser {
    pub fn new(boundary: &str) -> Self {
        Self {
            marker: format!("--{boundary}").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Return the next complete JPEG part, if the buffer holds one.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.marker) {
                        let _ = self.buffer.split_to(pos + self.marker.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the marker spans chunks
                        if self.buffer.len() > self.marker.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - self.marker.len());
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let pos = find_subsequence(&self.buffer, HEADER_END)?;
                    let headers = self.buffer.split_to(pos + HEADER_END.len());
                    self.state = ParseState::CollectingJpeg {
                        expected: content_length(&headers),
                    };
                }
                ParseState::CollectingJpeg {
                    expected: Some(len),
                } => {
                    if self.buffer.len() < len {
                        return None;
                    }
                    let jpeg = self.buffer.split_to(len).freeze();
                    self.state = ParseState::SeekingBoundary;
                    if !jpeg.is_empty() {
                        return Some(jpeg);
                    }
                }
                ParseState::CollectingJpeg { expected: None } => {
                    let pos = find_subsequence(&self.buffer, &self.marker)?;
                    // Strip trailing \r\n before boundary
                    let end = if self.buffer[..pos].ends_with(b"\r\n") {
                        pos - 2
                    } else {
                        pos
                    };
                    let jpeg = self.buffer.split_to(end).freeze();
                    // Leave the marker in place for SeekingBoundary
                    let _ = self.buffer.split_to(pos - end);
                    self.state = ParseState::SeekingBoundary;
                    if !jpeg.is_empty() {
                        return Some(jpeg);
                    }
                }
            }
        }
    }
}

fn content_length(headers: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(headers).ok()?;
    text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(boundary: &str, jpeg: &[u8], with_length: bool) -> Vec<u8> {
        let mut out = format!("\r\n--{boundary}\r\nContent-Type: image/jpeg\r\n").into_bytes();
        if with_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", jpeg.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(jpeg);
        out
    }

    #[test]
    fn parses_parts_with_content_length() {
        let mut parser = PartParser::new("abc");
        let mut body = part("abc", b"\xFF\xD8first\xFF\xD9", true);
        body.extend(part("abc", b"\xFF\xD8second\xFF\xD9", true));
        parser.push(&body);

        assert_eq!(parser.next_frame().unwrap().as_ref(), b"\xFF\xD8first\xFF\xD9");
        assert_eq!(parser.next_frame().unwrap().as_ref(), b"\xFF\xD8second\xFF\xD9");
        assert!(parser.next_frame().is_none());
    }

    #[test]
    fn parses_parts_without_content_length() {
        let mut parser = PartParser::new("frame");
        let mut body = part("frame", b"one", false);
        body.extend(part("frame", b"two", false));
        parser.push(&body);

        assert_eq!(parser.next_frame().unwrap().as_ref(), b"one");
        // The second part is only complete once the following boundary arrives
        assert!(parser.next_frame().is_none());
        parser.push(b"\r\n--frame\r\n");
        assert_eq!(parser.next_frame().unwrap().as_ref(), b"two");
    }

    #[test]
    fn handles_bytes_split_across_pushes() {
        let mut parser = PartParser::new("abc");
        let body = part("abc", b"split-payload", true);
        let mut frames = Vec::new();
        for byte in &body {
            parser.push(std::slice::from_ref(byte));
            if let Some(f) = parser.next_frame() {
                frames.push(f);
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), b"split-payload");
    }

    #[test]
    fn boundary_parameter_extracted() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace;boundary=123456789000000000000987654321"),
            Some("123456789000000000000987654321".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=\"--frame\""),
            Some("frame".to_string())
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
    }

    #[tokio::test]
    async fn acquire_returns_newest_frame_only() {
        let (tx, rx) = watch::channel(None);
        let pool = FramePool::new(2);
        let mut source = MjpegSource::from_receiver(rx, pool.clone(), Duration::from_millis(50));

        tx.send_replace(Some(Bytes::from_static(b"old")));
        tx.send_replace(Some(Bytes::from_static(b"new")));
        let frame = source.acquire().await.unwrap();
        assert_eq!(frame.data().as_ref(), b"new");

        // Nothing newer has arrived since
        let err = source.acquire().await.unwrap_err();
        assert!(matches!(err, CaptureError::NoFrame(_)));

        drop(frame);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn acquire_reports_closed_upstream() {
        let (tx, rx) = watch::channel(None);
        let mut source = MjpegSource::from_receiver(rx, FramePool::new(1), Duration::from_millis(50));
        drop(tx);
        assert!(matches!(source.acquire().await, Err(CaptureError::UpstreamDown)));
    }
}
