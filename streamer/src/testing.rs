//! In-memory fakes shared by the unit tests.

use bytes::Bytes;
use camlink_common::config::{Config, StreamMode};
use camlink_common::frame::{Frame, FramePool};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::context::StreamingContext;
use crate::encoder::{ChunkError, ChunkSink};
use crate::source::{CaptureError, FrameSource};

/// Source that hands out frames of scripted sizes from a real pool.
pub struct ScriptedSource {
    pool: FramePool,
    sizes: VecDeque<usize>,
    repeat: Option<usize>,
}

impl ScriptedSource {
    /// Yield one frame per size, then report no frame forever.
    pub fn sizes(pool: &FramePool, sizes: &[usize]) -> Self {
        Self {
            pool: pool.clone(),
            sizes: sizes.iter().copied().collect(),
            repeat: None,
        }
    }

    /// Yield frames of `size` bytes indefinitely.
    pub fn repeating(pool: &FramePool, size: usize) -> Self {
        Self {
            pool: pool.clone(),
            sizes: VecDeque::new(),
            repeat: Some(size),
        }
    }
}

impl FrameSource for ScriptedSource {
    async fn acquire(&mut self) -> Result<Frame, CaptureError> {
        tokio::task::yield_now().await;
        let size = match self.sizes.pop_front().or(self.repeat) {
            Some(size) => size,
            None => return Err(CaptureError::NoFrame(Duration::ZERO)),
        };
        Ok(self.pool.lease(Bytes::from(vec![0xAB; size]), 0)?)
    }
}

type FailurePlan = Box<dyn FnMut(usize) -> Option<ChunkError> + Send>;

/// Sink that records accepted chunks and fails according to a plan keyed by
/// the zero-based call index.
pub struct RecordingSink {
    /// Chunks that were accepted.
    pub chunks: Vec<Bytes>,
    /// Every call, including failed ones.
    pub calls: usize,
    plan: FailurePlan,
}

impl RecordingSink {
    pub fn accepting() -> Self {
        Self::with_plan(|_| None)
    }

    pub fn failing_at(call: usize, error: ChunkError) -> Self {
        Self::with_plan(move |n| (n == call).then_some(error))
    }

    pub fn with_plan(plan: impl FnMut(usize) -> Option<ChunkError> + Send + 'static) -> Self {
        Self {
            chunks: Vec::new(),
            calls: 0,
            plan: Box::new(plan),
        }
    }

    /// Number of multipart parts started, counted by boundary lines.
    pub fn parts(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.starts_with(b"\r\n--"))
            .count()
    }
}

impl ChunkSink for RecordingSink {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), ChunkError> {
        let call = self.calls;
        self.calls += 1;
        if let Some(error) = (self.plan)(call) {
            return Err(error);
        }
        self.chunks.push(chunk);
        Ok(())
    }
}

/// Context over a scripted source with default config in `mode`, adjusted
/// by `tweak`.
pub fn scripted_context(
    mode: StreamMode,
    source: ScriptedSource,
    tweak: impl FnOnce(&mut Config),
) -> Arc<StreamingContext<ScriptedSource>> {
    let mut config = Config::default();
    config.stream.mode = mode;
    tweak(&mut config);
    StreamingContext::new(config, source, CancellationToken::new())
}
