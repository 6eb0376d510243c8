use camlink_common::frame::Frame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::adaptive::{AdaptiveController, FailureAction};
use crate::capture::{Admission, CaptureFilter};
use crate::context::{ActiveSession, StreamingContext};
use crate::encoder::{ChunkSink, StreamEncoder, TransportError};
use crate::queue::QueueConsumer;
use crate::source::FrameSource;

/// Why a session could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    #[error("camera is held by another stream session")]
    SourceBusy,
    #[error("frame queue is held by another stream session")]
    QueueBusy,
    #[error("server is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    Shutdown,
}

/// Per-session counters, owned by the task serving the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub keepalives: u64,
    pub skipped: u64,
    pub oversized: u64,
    pub unavailable: u64,
    pub transient_errors: u64,
    pub cooldowns: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub stats: SessionStats,
}

enum Feed<S> {
    Direct(OwnedMutexGuard<S>),
    Queued(QueueConsumer),
}

/// Resources reserved for one client between accepting the request and the
/// end of its stream.
///
/// Dropping the lease, served or not, unregisters the session and then
/// releases the source or the queue, draining any frames left in it.
pub struct SessionLease<S> {
    // Field order is drop order: the capture task sees the client leave
    // before the queue is drained.
    active: ActiveSession<S>,
    feed: Feed<S>,
}

impl<S> SessionLease<S> {
    pub fn id(&self) -> u64 {
        self.active.id()
    }
}

/// Reserve the stream for a new client.
///
/// Direct mode takes the camera itself; queued mode takes the consuming end
/// of the frame queue. Either is exclusive, so a second client is refused.
pub fn open<S: FrameSource>(ctx: &Arc<StreamingContext<S>>) -> Result<SessionLease<S>, OpenError> {
    if ctx.is_shutdown() {
        return Err(OpenError::ShuttingDown);
    }
    let feed = match ctx.queue() {
        Some(queue) => {
            let mut consumer = queue.consumer().ok_or(OpenError::QueueBusy)?;
            // Frames left over from a previous client are stale by now
            if !queue.is_empty() {
                let stale = consumer.drain();
                debug!(stale, "discarded queued frames from a previous client");
            }
            Feed::Queued(consumer)
        }
        None => Feed::Direct(ctx.try_lock_source().ok_or(OpenError::SourceBusy)?),
    };
    Ok(SessionLease {
        active: ctx.register_session(),
        feed,
    })
}

/// Stream to one client until it disconnects or the server shuts down.
pub async fn serve<S: FrameSource, K: ChunkSink>(
    ctx: Arc<StreamingContext<S>>,
    mut lease: SessionLease<S>,
    sink: K,
) -> SessionReport {
    let id = lease.id();
    info!(session = id, mode = %ctx.mode(), "stream session started");

    let mut session = StreamSession::new(ctx, id, sink);
    let end = match &mut lease.feed {
        Feed::Direct(source) => session.run_direct(&mut **source).await,
        Feed::Queued(consumer) => session.run_queued(consumer).await,
    };
    drop(lease);

    SessionReport {
        end,
        stats: session.stats,
    }
}

/// State of the task serving one client.
pub struct StreamSession<S, K> {
    ctx: Arc<StreamingContext<S>>,
    id: u64,
    sink: K,
    encoder: StreamEncoder,
    controller: AdaptiveController,
    stats: SessionStats,
}

impl<S: FrameSource, K: ChunkSink> StreamSession<S, K> {
    pub fn new(ctx: Arc<StreamingContext<S>>, id: u64, sink: K) -> Self {
        let encoder = StreamEncoder::from_config(&ctx.config().stream);
        let controller = AdaptiveController::new(ctx.config().adaptive.clone());
        Self {
            ctx,
            id,
            sink,
            encoder,
            controller,
            stats: SessionStats::default(),
        }
    }

    /// Capture and send in the same task, with the skip modulus and size
    /// ceiling following the adaptive controller frame by frame.
    pub async fn run_direct(&mut self, source: &mut S) -> SessionEnd {
        let retry = self.ctx.config().capture.retry_delay();
        let mut filter = CaptureFilter::default();

        loop {
            if self.ctx.is_shutdown() {
                return SessionEnd::Shutdown;
            }

            let frame = match source.acquire().await {
                Ok(frame) => frame,
                Err(e) => {
                    self.stats.unavailable += 1;
                    self.ctx.stats().record_unavailable(&e);
                    if let Some(end) = Self::pause(&self.ctx, retry).await {
                        return end;
                    }
                    continue;
                }
            };

            let admission = filter.admit(frame, self.controller.policy());
            self.ctx.stats().record_admission(&admission);
            let outcome = match admission {
                Admission::Forward(frame) => self.deliver(frame).await,
                Admission::Skipped => {
                    self.stats.skipped += 1;
                    None
                }
                Admission::Oversized { len } => {
                    self.stats.oversized += 1;
                    debug!(
                        session = self.id,
                        kb = len / 1024,
                        ceiling = self.controller.size_ceiling(),
                        "frame too large, skipping"
                    );
                    None
                }
            };
            if let Some(end) = outcome {
                return end;
            }
        }
    }

    /// Send frames popped from the queue, writing a keep-alive whenever none
    /// arrives within the keep-alive timeout.
    pub async fn run_queued(&mut self, consumer: &mut QueueConsumer) -> SessionEnd {
        let wait = self.ctx.config().stream.keepalive_timeout();

        loop {
            if self.ctx.is_shutdown() {
                return SessionEnd::Shutdown;
            }

            let popped = tokio::select! {
                _ = self.ctx.cancel_token().cancelled() => return SessionEnd::Shutdown,
                popped = consumer.pop(wait) => popped,
            };

            let outcome = match popped {
                None => {
                    self.stats.keepalives += 1;
                    match self.encoder.write_keepalive(&mut self.sink).await {
                        Ok(()) => None,
                        Err(e) => self.on_transport_error(e).await,
                    }
                }
                Some(frame) if frame.len() > self.controller.size_ceiling() => {
                    self.stats.oversized += 1;
                    debug!(
                        session = self.id,
                        kb = frame.len() / 1024,
                        ceiling = self.controller.size_ceiling(),
                        "queued frame over session ceiling, skipping"
                    );
                    None
                }
                Some(frame) => self.deliver(frame).await,
            };
            if let Some(end) = outcome {
                return end;
            }
        }
    }

    /// Write one frame, release it, and pace or back off according to the
    /// result. `Some` ends the session.
    async fn deliver(&mut self, frame: Frame) -> Option<SessionEnd> {
        let len = frame.len();
        let result = self.encoder.write_frame(&mut self.sink, &frame).await;
        drop(frame);

        match result {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += len as u64;
                let log_every = self.ctx.config().stream.log_every_frames;
                if log_every > 0 && self.stats.frames_sent % log_every == 0 {
                    info!(
                        session = self.id,
                        frames_sent = self.stats.frames_sent,
                        skipped = self.stats.skipped,
                        oversized = self.stats.oversized,
                        transient_errors = self.stats.transient_errors,
                        "streaming"
                    );
                }
                let delay = self.controller.record_success();
                Self::pause(&self.ctx, delay).await
            }
            Err(e) => self.on_transport_error(e).await,
        }
    }

    async fn on_transport_error(&mut self, error: TransportError) -> Option<SessionEnd> {
        match error {
            TransportError::Disconnected { stage } => {
                info!(session = self.id, ?stage, "client disconnected");
                Some(SessionEnd::Disconnected)
            }
            TransportError::Transient { stage } => {
                self.stats.transient_errors += 1;
                match self.controller.record_failure(stage) {
                    FailureAction::Backoff(backoff) => {
                        warn!(
                            session = self.id,
                            ?stage,
                            errors = self.controller.error_count(),
                            backoff_ms = backoff.as_millis() as u64,
                            "write failed, backing off"
                        );
                        Self::pause(&self.ctx, backoff).await
                    }
                    FailureAction::Cooldown(cooldown) => {
                        self.stats.cooldowns += 1;
                        warn!(
                            session = self.id,
                            errors = self.controller.error_count(),
                            cooldown_ms = cooldown.as_millis() as u64,
                            "too many write failures, cooling down"
                        );
                        let end = Self::pause(&self.ctx, cooldown).await;
                        self.controller.finish_cooldown();
                        end
                    }
                }
            }
        }
    }

    // Borrows only the context, so the session future does not need the sink
    // to be `Sync`.
    async fn pause(ctx: &StreamingContext<S>, duration: Duration) -> Option<SessionEnd> {
        if ctx.pause(duration).await {
            None
        } else {
            Some(SessionEnd::Shutdown)
        }
    }
}
