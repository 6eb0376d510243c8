use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// One captured JPEG image.
///
/// The payload is immutable once captured. A frame is never cloned: it moves
/// from the source through the capture filter and queue to the encoder, and
/// dropping it returns its buffer slot to the [`FramePool`] it was leased from.
#[derive(Debug)]
pub struct Frame {
    data: Bytes,
    captured_at_ms: i64,
    seq: u64,
    _slot: Option<OwnedSemaphorePermit>,
}

impl Frame {
    /// Create a frame that does not occupy a pool slot.
    pub fn new(data: Bytes, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            data,
            captured_at_ms,
            seq,
            _slot: None,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at_ms
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Give the pool slot back while keeping the image.
    ///
    /// Used before a frame is parked somewhere long-lived, such as a queue,
    /// so that buffering never holds the camera's buffers.
    pub fn into_unpooled(self) -> Frame {
        Frame {
            data: self.data,
            captured_at_ms: self.captured_at_ms,
            seq: self.seq,
            _slot: None,
        }
    }
}

/// Bounded set of frame buffers, modelling the driver-side buffers of a camera.
///
/// Every [`Frame`] leased from the pool holds one slot until it is dropped, so
/// a leaked frame shows up as a permanently missing slot.
#[derive(Debug, Clone)]
pub struct FramePool {
    slots: Arc<Semaphore>,
    capacity: usize,
    next_seq: Arc<AtomicU64>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wrap captured bytes in a frame, taking a free slot.
    pub fn lease(&self, data: Bytes, captured_at_ms: i64) -> Result<Frame, PoolExhausted> {
        let slot = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| PoolExhausted {
                capacity: self.capacity,
            })?;
        Ok(Frame {
            data,
            captured_at_ms,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            _slot: Some(slot),
        })
    }

    /// Slots not currently held by a live frame.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, thiserror::Error)]
#[error("all {capacity} frame buffers are in use")]
pub struct PoolExhausted {
    pub capacity: usize,
}
