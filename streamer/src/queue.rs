use camlink_common::frame::Frame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Bounded, lossy frame queue between the capture task and a stream session.
///
/// Producers never wait: when the queue is full the incoming frame is handed
/// back to the caller to be dropped, and queued frames are left untouched.
/// At most one consumer holds the receiving end at a time.
pub struct FrameQueue {
    tx: mpsc::Sender<Frame>,
    rx: Arc<Mutex<mpsc::Receiver<Frame>>>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            capacity,
        }
    }

    /// Queue a frame, or return it if the queue is full.
    pub fn try_push(&self, frame: Frame) -> Result<(), Frame> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) | Err(TrySendError::Closed(frame)) => Err(frame),
        }
    }

    /// Claim the consuming end. `None` while another consumer holds it.
    pub fn consumer(&self) -> Option<QueueConsumer> {
        let rx = Arc::clone(&self.rx).try_lock_owned().ok()?;
        Some(QueueConsumer { rx })
    }

    /// Frames currently waiting.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Exclusive consuming end of a [`FrameQueue`].
///
/// Dropping the consumer releases every frame still queued.
pub struct QueueConsumer {
    rx: OwnedMutexGuard<mpsc::Receiver<Frame>>,
}

impl QueueConsumer {
    /// Wait up to `timeout` for the oldest queued frame.
    pub async fn pop(&mut self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_pop(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Release every queued frame, returning how many were dropped.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while let Some(frame) = self.try_pop() {
            drop(frame);
            drained += 1;
        }
        drained
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        let drained = self.drain();
        if drained > 0 {
            debug!(drained, "released queued frames on consumer teardown");
        }
    }
}
