use bytes::Bytes;
use camlink_common::frame::{Frame, FramePool};
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::{CaptureError, FrameSource, SourceError};

/// Camera stand-in that cycles through JPEG files at a fixed frame rate.
///
/// Frame `n` becomes current at `start + n * interval`. A caller that falls
/// behind gets whichever frame is current, not the ones it missed.
pub struct ReplaySource {
    frames: Vec<Bytes>,
    pool: FramePool,
    interval: Duration,
    started: Instant,
    last_tick: Option<u64>,
}

impl ReplaySource {
    pub fn load(dir: &Path, fps: f64, pool: FramePool) -> Result<Self, SourceError> {
        let entries =
            std::fs::read_dir(dir).map_err(|e| SourceError::ReadDir(dir.to_path_buf(), e))?;

        let mut paths: Vec<_> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
            })
            .collect();
        paths.sort();

        let mut frames = Vec::with_capacity(paths.len());
        for path in &paths {
            let data = std::fs::read(path).map_err(|e| SourceError::ReadFrame(path.clone(), e))?;
            frames.push(Bytes::from(data));
        }
        if frames.is_empty() {
            return Err(SourceError::Empty(dir.to_path_buf()));
        }

        info!(
            dir = %dir.display(),
            frames = frames.len(),
            fps,
            "loaded replay frames"
        );
        Ok(Self::from_frames(frames, fps, pool))
    }

    pub fn from_frames(frames: Vec<Bytes>, fps: f64, pool: FramePool) -> Self {
        Self {
            frames,
            pool,
            interval: Duration::from_secs_f64(1.0 / fps),
            started: Instant::now(),
            last_tick: None,
        }
    }

    fn current_tick(&self) -> u64 {
        (self.started.elapsed().as_nanos() / self.interval.as_nanos().max(1)) as u64
    }
}

/// Offset of frame `tick` from the start, saturating instead of wrapping.
fn tick_offset(interval: Duration, tick: u64) -> Duration {
    let nanos = interval.as_nanos().saturating_mul(u128::from(tick));
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
}

impl FrameSource for ReplaySource {
    async fn acquire(&mut self) -> Result<Frame, CaptureError> {
        let mut tick = self.current_tick();
        if self.last_tick.is_some_and(|last| tick <= last) {
            // Wait for the next frame to be "captured"
            tick = self.last_tick.map_or(tick, |last| last + 1);
            let due = self.started + tick_offset(self.interval, tick);
            tokio::time::sleep_until(due).await;
        }
        let index = (tick % self.frames.len() as u64) as usize;
        let frame = self
            .pool
            .lease(self.frames[index].clone(), Utc::now().timestamp_millis())?;
        self.last_tick = Some(tick);
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> Vec<Bytes> {
        (0..n).map(|i| Bytes::from(vec![i as u8; 4])).collect()
    }

    #[test]
    fn tick_offset_handles_ticks_past_u32() {
        let tick = u64::from(u32::MAX) + 10;
        assert_eq!(
            tick_offset(Duration::from_millis(1), tick),
            Duration::from_millis(tick)
        );
        assert_eq!(
            tick_offset(Duration::from_millis(50), 3),
            Duration::from_millis(150)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn paces_at_frame_rate() {
        let mut source = ReplaySource::from_frames(frames(3), 10.0, FramePool::new(4));
        let start = Instant::now();
        let a = source.acquire().await.unwrap();
        let b = source.acquire().await.unwrap();
        let c = source.acquire().await.unwrap();
        assert_eq!(a.data()[0], 0);
        assert_eq!(b.data()[0], 1);
        assert_eq!(c.data()[0], 2);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_caller_gets_latest_frame() {
        let mut source = ReplaySource::from_frames(frames(10), 10.0, FramePool::new(4));
        let first = source.acquire().await.unwrap();
        assert_eq!(first.data()[0], 0);

        tokio::time::sleep(Duration::from_millis(450)).await;
        let next = source.acquire().await.unwrap();
        assert_eq!(next.data()[0], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_is_unavailable() {
        let pool = FramePool::new(1);
        let mut source = ReplaySource::from_frames(frames(2), 10.0, pool.clone());
        let held = source.acquire().await.unwrap();
        assert!(matches!(
            source.acquire().await,
            Err(CaptureError::PoolExhausted(_))
        ));
        drop(held);
        assert!(source.acquire().await.is_ok());
    }

    #[test]
    fn empty_directory_rejected() {
        let dir = std::env::temp_dir().join(format!("camlink-replay-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let err = ReplaySource::load(&dir, 10.0, FramePool::new(1)).err().unwrap();
        assert!(matches!(err, SourceError::Empty(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn loads_only_jpeg_files_in_name_order() {
        let dir = std::env::temp_dir().join(format!("camlink-replay-load-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.jpg"), b"second").unwrap();
        std::fs::write(dir.join("a.JPEG"), b"first").unwrap();
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let source = ReplaySource::load(&dir, 10.0, FramePool::new(1)).unwrap();
        assert_eq!(source.frames.len(), 2);
        assert_eq!(source.frames[0].as_ref(), b"first");
        std::fs::remove_dir_all(&dir).ok();
    }
}
