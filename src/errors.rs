//! Typed error hierarchy for the worldgen orchestrator.
//!
//! - `GenerationError`: why a generation attempt failed, mapped to a `FailureKind`
//! - `RuntimeError`: compute runtime (container) operations
//! - `PoolError`: warm engine pool operations
//! - `StoreError`: job status persistence
//! - `JobError`: job controller entry points

use std::path::PathBuf;

use thiserror::Error;
use worldgen_common::{EngineState, EngineTransitionError, FailureKind, JobTransitionError};

/// Failure taxonomy for one generation attempt.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to launch compute unit: {0}")]
    Launch(String),

    #[error("Readiness not reached within {timeout_seconds}s")]
    ReadinessTimeout { timeout_seconds: u64 },

    #[error("Critical error in workload output ({pattern}): {line}")]
    CriticalRuntime { pattern: String, line: String },

    #[error("Expected artifacts missing: {}", .missing.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    OutputValidation { missing: Vec<PathBuf> },
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Launch(_) => FailureKind::Launch,
            Self::ReadinessTimeout { .. } => FailureKind::ReadinessTimeout,
            Self::CriticalRuntime { .. } => FailureKind::CriticalRuntime,
            Self::OutputValidation { .. } => FailureKind::OutputValidation,
        }
    }
}

/// Errors from the compute runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Compute unit or image not found: {target}")]
    NotFound { target: String },

    #[error("Conflict on {target}: {message}")]
    Conflict { target: String, message: String },

    #[error("Compute runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Runtime {operation} failed for {target}: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("Log stream failed: {0}")]
    LogStream(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from the warm engine pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Engine {id} not found")]
    EngineNotFound { id: String },

    #[error("Engine {id} is {state}, not ready")]
    EngineNotReady { id: String, state: EngineState },

    #[error("No warm engine available")]
    NoEngineAvailable,

    #[error("Engine {id} failed to start: {reason}")]
    StartupFailed { id: String, reason: String },

    #[error("Recycling engine {id} failed: {reason}")]
    RecycleFailed { id: String, reason: String },

    #[error(transparent)]
    Transition(#[from] EngineTransitionError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Engine workspace I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the job status store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Status store backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("Status store lock poisoned")]
    LockPoisoned,

    #[error("Failed to encode job record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the job controller.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Seed must not be empty")]
    EmptySeed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] JobTransitionError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_error_maps_to_failure_kind() {
        assert_eq!(
            GenerationError::Configuration("missing image".into()).kind(),
            FailureKind::Configuration
        );
        assert_eq!(
            GenerationError::Launch("refused".into()).kind(),
            FailureKind::Launch
        );
        assert_eq!(
            GenerationError::ReadinessTimeout { timeout_seconds: 900 }.kind(),
            FailureKind::ReadinessTimeout
        );
        assert_eq!(
            GenerationError::CriticalRuntime {
                pattern: "FATAL ERROR".into(),
                line: "FATAL ERROR: boom".into()
            }
            .kind(),
            FailureKind::CriticalRuntime
        );
        assert_eq!(
            GenerationError::OutputValidation { missing: vec![] }.kind(),
            FailureKind::OutputValidation
        );
    }

    #[test]
    fn output_validation_lists_missing_paths() {
        let err = GenerationError::OutputValidation {
            missing: vec![PathBuf::from("/data/a.db"), PathBuf::from("/data/a.fwl")],
        };
        let msg = err.to_string();
        assert!(msg.contains("/data/a.db"));
        assert!(msg.contains("/data/a.fwl"));
    }

    #[test]
    fn runtime_error_not_found_is_detectable() {
        let err = RuntimeError::NotFound {
            target: "worldgen-abc".into(),
        };
        assert!(err.is_not_found());
        assert!(!RuntimeError::Unavailable("socket".into()).is_not_found());
    }

    #[test]
    fn pool_error_converts_from_runtime_error() {
        let err: PoolError = RuntimeError::Unavailable("socket closed".into()).into();
        match &err {
            PoolError::Runtime(RuntimeError::Unavailable(msg)) => assert_eq!(msg, "socket closed"),
            _ => panic!("Expected PoolError::Runtime(Unavailable)"),
        }
    }

    #[test]
    fn pool_error_not_ready_names_state() {
        let err = PoolError::EngineNotReady {
            id: "e1".into(),
            state: EngineState::Generating,
        };
        assert!(err.to_string().contains("generating"));
    }

    #[test]
    fn job_error_wraps_store_error() {
        let err: JobError = StoreError::LockPoisoned.into();
        assert!(matches!(err, JobError::Store(StoreError::LockPoisoned)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GenerationError::Launch("x".into()));
        assert_std_error(&RuntimeError::LogStream("x".into()));
        assert_std_error(&PoolError::NoEngineAvailable);
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&JobError::EmptySeed);
    }
}
