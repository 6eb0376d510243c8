use camlink_common::frame::Frame;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::StreamingContext;
use crate::source::{CaptureError, FrameSource};

/// Skip and size limits applied to each captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterPolicy {
    /// Only every `skip_modulus`-th frame is forwarded.
    pub skip_modulus: u32,
    pub max_frame_bytes: usize,
}

/// Outcome of running one frame through a [`CaptureFilter`].
///
/// Rejected frames have already been released when this is returned.
#[derive(Debug)]
pub enum Admission {
    Forward(Frame),
    Skipped,
    Oversized { len: usize },
}

/// Frame-skip filter followed by the size ceiling, in that order.
#[derive(Debug, Default)]
pub struct CaptureFilter {
    index: u64,
}

impl CaptureFilter {
    pub fn admit(&mut self, frame: Frame, policy: FilterPolicy) -> Admission {
        let index = self.index;
        self.index += 1;

        if index % u64::from(policy.skip_modulus.max(1)) != 0 {
            return Admission::Skipped;
        }
        if frame.len() > policy.max_frame_bytes {
            return Admission::Oversized { len: frame.len() };
        }
        Admission::Forward(frame)
    }
}

/// Capture-side counters, readable from any task.
#[derive(Debug, Default)]
pub struct CaptureStats {
    captured: AtomicU64,
    forwarded: AtomicU64,
    skipped: AtomicU64,
    oversized: AtomicU64,
    queue_dropped: AtomicU64,
    unavailable: AtomicU64,
    pool_exhausted: AtomicU64,
}

/// Point-in-time copy of [`CaptureStats`].
///
/// `forwarded` counts frames that passed both filters, including any the
/// queue then dropped as `queue_dropped`. `pool_exhausted` is the part of
/// `unavailable` caused by every frame buffer being held downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureSnapshot {
    pub captured: u64,
    pub forwarded: u64,
    pub skipped: u64,
    pub oversized: u64,
    pub queue_dropped: u64,
    pub unavailable: u64,
    pub pool_exhausted: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            pool_exhausted: self.pool_exhausted.load(Ordering::Relaxed),
        }
    }

    /// Count a captured frame by its filter outcome.
    pub(crate) fn record_admission(&self, admission: &Admission) {
        Self::bump(&self.captured);
        match admission {
            Admission::Forward(_) => Self::bump(&self.forwarded),
            Admission::Skipped => Self::bump(&self.skipped),
            Admission::Oversized { .. } => Self::bump(&self.oversized),
        }
    }

    pub(crate) fn record_queue_dropped(&self) {
        Self::bump(&self.queue_dropped);
    }

    /// Count a failed acquire and log it, loudly when the pool ran dry.
    pub(crate) fn record_unavailable(&self, error: &CaptureError) {
        Self::bump(&self.unavailable);
        if error.is_pool_exhausted() {
            Self::bump(&self.pool_exhausted);
            warn!(error = %error, "frame buffers exhausted, capture stalled");
        } else {
            debug!(error = %error, "capture unavailable, retrying");
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Capture task of the queued mode.
///
/// Owns the source for its whole life. Idles while no session is attached,
/// otherwise filters frames with the fixed queue policy and pushes survivors
/// into the context's queue, dropping them when it is full. Queued frames
/// give their pool slot back, so a slow client never stalls the camera.
pub async fn run_capture_loop<S: FrameSource>(ctx: Arc<StreamingContext<S>>) {
    let Some(queue) = ctx.queue() else {
        warn!("capture loop started without a frame queue");
        return;
    };
    let config = &ctx.config().queue;
    let capture = &ctx.config().capture;
    let policy = FilterPolicy {
        skip_modulus: config.skip_modulus,
        max_frame_bytes: config.max_frame_bytes,
    };
    let stats = ctx.stats();
    let mut source = ctx.lock_source().await;
    let mut filter = CaptureFilter::default();

    info!(
        skip_modulus = policy.skip_modulus,
        max_frame_bytes = policy.max_frame_bytes,
        capacity = queue.capacity(),
        "capture loop started"
    );

    loop {
        if ctx.is_shutdown() {
            break;
        }
        if !ctx.streaming_enabled() {
            if !ctx.pause(capture.idle_poll()).await {
                break;
            }
            continue;
        }

        let frame = match source.acquire().await {
            Ok(f) => f,
            Err(e) => {
                stats.record_unavailable(&e);
                if !ctx.pause(capture.retry_delay()).await {
                    break;
                }
                continue;
            }
        };
        let admission = filter.admit(frame, policy);
        stats.record_admission(&admission);

        let delay = match admission {
            Admission::Forward(frame) => {
                let seq = frame.seq();
                if let Err(dropped) = queue.try_push(frame.into_unpooled()) {
                    stats.record_queue_dropped();
                    warn!(seq, pending = queue.len(), "frame queue full, dropping frame");
                    drop(dropped);
                }
                config.frame_interval()
            }
            Admission::Skipped => config.reject_delay(),
            Admission::Oversized { len } => {
                warn!(kb = len / 1024, "frame too large, skipping");
                config.reject_delay()
            }
        };

        if !ctx.pause(delay).await {
            break;
        }
    }

    info!(stats = ?stats.snapshot(), "capture loop stopped");
}
