use camlink_common::config::{Config, StreamMode};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{self, CaptureSnapshot, CaptureStats};
use crate::queue::FrameQueue;
use crate::source::FrameSource;

/// Everything the capture task and the stream sessions share.
///
/// Built once at startup and handed to every task behind an `Arc`. The source
/// sits behind an async mutex so exactly one task (the capture loop, or a
/// direct-mode session) pulls frames from it at a time.
pub struct StreamingContext<S> {
    config: Config,
    source: Arc<Mutex<S>>,
    queue: Option<FrameQueue>,
    stats: CaptureStats,
    active_sessions: AtomicUsize,
    next_session_id: AtomicU64,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub mode: String,
    pub streaming: bool,
    pub active_sessions: usize,
    pub pending_frames: usize,
    pub capture: CaptureSnapshot,
}

impl<S: FrameSource> StreamingContext<S> {
    pub fn new(config: Config, source: S, cancel: CancellationToken) -> Arc<Self> {
        let queue = match config.stream.mode {
            StreamMode::Queued => Some(FrameQueue::new(config.queue.capacity)),
            StreamMode::Direct => None,
        };
        Arc::new(Self {
            config,
            source: Arc::new(Mutex::new(source)),
            queue,
            stats: CaptureStats::default(),
            active_sessions: AtomicUsize::new(0),
            next_session_id: AtomicU64::new(1),
            cancel,
        })
    }

    /// Spawn the capture task when running in queued mode.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.queue.as_ref()?;
        Some(tokio::spawn(capture::run_capture_loop(Arc::clone(self))))
    }

    pub(crate) async fn lock_source(&self) -> OwnedMutexGuard<S> {
        Arc::clone(&self.source).lock_owned().await
    }

    pub(crate) fn try_lock_source(&self) -> Option<OwnedMutexGuard<S>> {
        Arc::clone(&self.source).try_lock_owned().ok()
    }
}

impl<S> StreamingContext<S> {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> StreamMode {
        self.config.stream.mode
    }

    pub fn queue(&self) -> Option<&FrameQueue> {
        self.queue.as_ref()
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True while at least one client is attached to the stream.
    pub fn streaming_enabled(&self) -> bool {
        self.active_sessions.load(Ordering::Acquire) > 0
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the capture task and every session at their next check.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Sleep for `duration`. Returns `false` if shutdown interrupted it.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Mark a client as attached until the returned guard is dropped.
    pub fn register_session(self: &Arc<Self>) -> ActiveSession<S> {
        self.active_sessions.fetch_add(1, Ordering::AcqRel);
        ActiveSession {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            ctx: Arc::clone(self),
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            mode: self.mode().to_string(),
            streaming: self.streaming_enabled(),
            active_sessions: self.active_sessions(),
            pending_frames: self.queue.as_ref().map_or(0, FrameQueue::len),
            capture: self.stats.snapshot(),
        }
    }
}

/// Registration of one attached client.
pub struct ActiveSession<S> {
    id: u64,
    ctx: Arc<StreamingContext<S>>,
}

impl<S> ActiveSession<S> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<S> Drop for ActiveSession<S> {
    fn drop(&mut self) {
        self.ctx.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scripted_context, ScriptedSource};
    use camlink_common::frame::FramePool;

    #[test]
    fn sessions_toggle_streaming_flag() {
        let pool = FramePool::new(1);
        let ctx = scripted_context(StreamMode::Direct, ScriptedSource::sizes(&pool, &[]), |_| {});
        assert!(!ctx.streaming_enabled());

        let a = ctx.register_session();
        let b = ctx.register_session();
        assert_ne!(a.id(), b.id());
        assert_eq!(ctx.status().active_sessions, 2);

        drop(a);
        assert!(ctx.streaming_enabled());
        drop(b);
        assert!(!ctx.streaming_enabled());
    }

    #[test]
    fn queue_only_in_queued_mode() {
        let pool = FramePool::new(1);
        let direct = scripted_context(StreamMode::Direct, ScriptedSource::sizes(&pool, &[]), |_| {});
        let queued = scripted_context(StreamMode::Queued, ScriptedSource::sizes(&pool, &[]), |_| {});
        assert!(direct.queue().is_none());
        assert_eq!(queued.queue().map(FrameQueue::capacity), Some(5));
        assert_eq!(queued.status().mode, "queued");
    }

    #[tokio::test(start_paused = true)]
    async fn pause_is_cut_short_by_shutdown() {
        let pool = FramePool::new(1);
        let ctx = scripted_context(StreamMode::Direct, ScriptedSource::sizes(&pool, &[]), |_| {});
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.pause(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        ctx.shutdown();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn source_is_exclusive() {
        let pool = FramePool::new(1);
        let ctx = scripted_context(StreamMode::Direct, ScriptedSource::sizes(&pool, &[]), |_| {});
        let held = ctx.try_lock_source();
        assert!(held.is_some());
        assert!(ctx.try_lock_source().is_none());
        drop(held);
        assert!(ctx.try_lock_source().is_some());
    }
}
