use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::job::GenerationStatus;

/// Why an attempt failed. Drives the retry decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Launch,
    ReadinessTimeout,
    CriticalRuntime,
    OutputValidation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Launch => "launch",
            Self::ReadinessTimeout => "readiness_timeout",
            Self::CriticalRuntime => "critical_runtime",
            Self::OutputValidation => "output_validation",
        }
    }

    /// Only transient launch and output failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Launch | Self::OutputValidation)
    }
}

/// Outcome of a single generation attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerationResult {
    pub success: bool,
    pub duration_seconds: f64,
    pub log_match: bool,
    pub files_stable: bool,
    pub files_found: BTreeMap<PathBuf, bool>,
    pub primary_present: bool,
    pub secondary_present: bool,
    pub timed_out: bool,
    pub error_message: Option<String>,
    pub failure: Option<FailureKind>,
    pub lines_written: u64,
    pub log_excerpt: Option<String>,
    pub engine_id: Option<String>,
}

impl GenerationResult {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            timed_out: kind == FailureKind::ReadinessTimeout,
            error_message: Some(message.into()),
            failure: Some(kind),
            ..Default::default()
        }
    }

    pub fn all_artifacts_present(&self) -> bool {
        self.primary_present && self.secondary_present
    }

    pub fn generation_status(&self) -> GenerationStatus {
        GenerationStatus {
            log_match: self.log_match,
            files_stable: self.files_stable,
            primary_present: self.primary_present,
            secondary_present: self.secondary_present,
            timed_out: self.timed_out,
            lines_written: self.lines_written,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::Launch.is_retryable());
        assert!(FailureKind::OutputValidation.is_retryable());
        assert!(!FailureKind::Configuration.is_retryable());
        assert!(!FailureKind::ReadinessTimeout.is_retryable());
        assert!(!FailureKind::CriticalRuntime.is_retryable());
    }

    #[test]
    fn test_failed_timeout_sets_timed_out() {
        let result = GenerationResult::failed(FailureKind::ReadinessTimeout, "no signal");
        assert!(result.timed_out);
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("no signal"));

        let result = GenerationResult::failed(FailureKind::Launch, "boom");
        assert!(!result.timed_out);
    }

    #[test]
    fn test_all_artifacts_requires_both_groups() {
        let mut result = GenerationResult {
            primary_present: true,
            ..Default::default()
        };
        assert!(!result.all_artifacts_present());
        result.secondary_present = true;
        assert!(result.all_artifacts_present());
    }
}
