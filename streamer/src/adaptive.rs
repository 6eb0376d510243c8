use camlink_common::config::AdaptiveConfig;
use std::time::Duration;

use crate::capture::FilterPolicy;
use crate::encoder::WriteStage;

/// What a session does after a transient write failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Sleep briefly, then carry on with the degraded policy.
    Backoff(Duration),
    /// Too many consecutive failures: pause for the cooldown, then call
    /// [`AdaptiveController::finish_cooldown`].
    Cooldown(Duration),
}

/// Error-driven quality controller for one stream session.
///
/// Driven only by the count of consecutive transient write errors:
///
/// - no errors: baseline skip modulus, full size ceiling, short frame delay;
/// - some errors: ceiling divided down, longer frame delay, backoff after each
///   failure, and a higher skip modulus once past the escalation threshold;
/// - `max_errors` reached: cooldown, after which the count resets to zero.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    errors: u32,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self { config, errors: 0 }
    }

    pub fn error_count(&self) -> u32 {
        self.errors
    }

    pub fn skip_modulus(&self) -> u32 {
        if self.errors > self.config.skip_escalation_errors {
            self.config.degraded_skip
        } else {
            self.config.baseline_skip
        }
    }

    pub fn size_ceiling(&self) -> usize {
        if self.errors > 0 {
            self.config.max_frame_bytes / self.config.ceiling_divisor.max(1)
        } else {
            self.config.max_frame_bytes
        }
    }

    pub fn policy(&self) -> FilterPolicy {
        FilterPolicy {
            skip_modulus: self.skip_modulus(),
            max_frame_bytes: self.size_ceiling(),
        }
    }

    pub fn inter_frame_delay(&self) -> Duration {
        if self.errors > 0 {
            Duration::from_millis(self.config.degraded_frame_delay_ms)
        } else {
            Duration::from_millis(self.config.base_frame_delay_ms)
        }
    }

    /// Record a fully sent frame and return the pause before the next one.
    ///
    /// The pause reflects the error count the frame was sent under, so the
    /// first frame after a failure is still paced conservatively.
    pub fn record_success(&mut self) -> Duration {
        let delay = self.inter_frame_delay();
        self.errors = 0;
        delay
    }

    pub fn record_failure(&mut self, stage: WriteStage) -> FailureAction {
        self.errors += 1;
        if self.errors >= self.config.max_errors {
            return FailureAction::Cooldown(Duration::from_millis(self.config.cooldown_ms));
        }
        let backoff_ms = match stage {
            WriteStage::Payload => self.config.payload_backoff_ms,
            WriteStage::Boundary | WriteStage::Header | WriteStage::KeepAlive => {
                self.config.header_backoff_ms
            }
        };
        FailureAction::Backoff(Duration::from_millis(backoff_ms))
    }

    /// Close the circuit after a cooldown pause.
    pub fn finish_cooldown(&mut self) {
        self.errors = 0;
    }
}
