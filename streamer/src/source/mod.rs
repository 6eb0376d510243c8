pub mod mjpeg;
pub mod replay;

use std::future::Future;
use std::path::PathBuf;

use camlink_common::config::{CaptureConfig, SourceKind};
use camlink_common::frame::{Frame, FramePool, PoolExhausted};
use tokio_util::sync::CancellationToken;

use mjpeg::MjpegSource;
use replay::ReplaySource;

/// Provider of camera frames.
///
/// `acquire` must hand out the newest completed frame rather than an older
/// buffered one. Failure is never fatal: callers back off briefly and retry.
/// Releasing a frame is dropping it.
pub trait FrameSource: Send + 'static {
    fn acquire(&mut self) -> impl Future<Output = Result<Frame, CaptureError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no new frame within {0:?}")]
    NoFrame(std::time::Duration),
    #[error("upstream camera is not connected")]
    UpstreamDown,
    #[error(transparent)]
    PoolExhausted(#[from] PoolExhausted),
}

impl CaptureError {
    /// Every frame buffer is held downstream, so the camera cannot capture.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, CaptureError::PoolExhausted(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read replay directory {0}: {1}")]
    ReadDir(PathBuf, std::io::Error),
    #[error("failed to read frame {0}: {1}")]
    ReadFrame(PathBuf, std::io::Error),
    #[error("no JPEG files found in {0}")]
    Empty(PathBuf),
}

/// The configured camera stand-in.
pub enum CameraSource {
    Mjpeg(MjpegSource),
    Replay(ReplaySource),
}

impl CameraSource {
    pub fn from_config(
        config: &CaptureConfig,
        pool: FramePool,
        cancel: CancellationToken,
    ) -> Result<Self, SourceError> {
        match config.source {
            SourceKind::Mjpeg => Ok(CameraSource::Mjpeg(MjpegSource::spawn(
                config.url.clone(),
                pool,
                config.acquire_timeout(),
                cancel,
            ))),
            SourceKind::Replay => Ok(CameraSource::Replay(ReplaySource::load(
                &config.replay_dir,
                config.replay_fps,
                pool,
            )?)),
        }
    }
}

impl FrameSource for CameraSource {
    async fn acquire(&mut self) -> Result<Frame, CaptureError> {
        match self {
            CameraSource::Mjpeg(source) => source.acquire().await,
            CameraSource::Replay(source) => source.acquire().await,
        }
    }
}
