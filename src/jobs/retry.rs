use std::time::Duration;

use worldgen_common::{FailureKind, GenerationResult};

/// What the controller does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Stop now; retrying cannot help.
    Fatal,
    /// Stop now and report `timed_out`.
    Timeout,
    Retry,
}

/// An attempt only counts when every primary and secondary artifact exists.
pub fn classify(result: &GenerationResult) -> AttemptOutcome {
    if result.success && result.all_artifacts_present() {
        return AttemptOutcome::Succeeded;
    }
    match result.failure {
        Some(FailureKind::Configuration) | Some(FailureKind::CriticalRuntime) => {
            AttemptOutcome::Fatal
        }
        Some(FailureKind::ReadinessTimeout) => AttemptOutcome::Timeout,
        Some(FailureKind::Launch) | Some(FailureKind::OutputValidation) | None => {
            AttemptOutcome::Retry
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Wait after failed attempt `attempt` (zero-based): `base * 2^attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt)
    }

    pub fn has_attempts_after(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}
