use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Status only moves forward: pending -> running -> terminal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Running | Self::Succeeded | Self::Failed | Self::TimedOut
            ),
            Self::Running => next.is_terminal(),
            Self::Succeeded | Self::Failed | Self::TimedOut => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Validation,
    Generation,
    Export,
    Finalize,
    Cached,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Validation => "validation",
            Self::Generation => "generation",
            Self::Export => "export",
            Self::Finalize => "finalize",
            Self::Cached => "cached",
        }
    }
}

/// Readiness and artifact signals gathered during the last attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationStatus {
    pub log_match: bool,
    pub files_stable: bool,
    pub primary_present: bool,
    pub secondary_present: bool,
    pub timed_out: bool,
    pub lines_written: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid job transition for {job_id}: {from} -> {to}")]
pub struct JobTransitionError {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub seed: String,
    pub seed_hash: String,
    pub status: JobStatus,
    pub current_stage: JobStage,
    pub progress_percent: u8,
    #[serde(default)]
    pub force_regenerate: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub generation_status: GenerationStatus,
    pub error_message: Option<String>,
    pub log_excerpt: Option<String>,
    pub engine_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(seed: impl Into<String>, seed_hash: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seed: seed.into(),
            seed_hash: seed_hash.into(),
            status: JobStatus::Pending,
            current_stage: JobStage::Queued,
            progress_percent: 0,
            force_regenerate: false,
            attempts: 0,
            generation_status: GenerationStatus::default(),
            error_message: None,
            log_excerpt: None,
            engine_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_force_regenerate(mut self, force: bool) -> Self {
        self.force_regenerate = force;
        self
    }

    /// Move to `next`, stamping start/completion times.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(JobTransitionError {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            if next == JobStatus::Succeeded {
                self.progress_percent = 100;
            }
        }
        self.status = next;
        Ok(())
    }

    /// Raise progress; lower values are ignored.
    pub fn record_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if percent > self.progress_percent {
            self.progress_percent = percent;
            true
        } else {
            false
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
