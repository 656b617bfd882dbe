use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Starting,
    Ready,
    Generating,
    Exporting,
    Resetting,
    Error,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Exporting => "exporting",
            Self::Resetting => "resetting",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(&self, next: EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (_, Error) => *self != Error,
            (Starting, Ready) => true,
            (Ready, Generating) | (Ready, Resetting) => true,
            (Generating, Exporting) => true,
            (Exporting, Ready) | (Exporting, Resetting) => true,
            (Resetting, Ready) => true,
            _ => false,
        }
    }

    /// Engines in `Error` are on their way out and no longer count against the pool.
    pub fn is_live(&self) -> bool {
        *self != Self::Error
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Generating | Self::Exporting | Self::Resetting)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "generating" => Ok(Self::Generating),
            "exporting" => Ok(Self::Exporting),
            "resetting" => Ok(Self::Resetting),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid engine state: {}", s)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid engine transition for {engine_id}: {from} -> {to}")]
pub struct EngineTransitionError {
    pub engine_id: String,
    pub from: EngineState,
    pub to: EngineState,
}

/// A long-lived, pre-started workload instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Engine {
    pub id: String,
    pub state: EngineState,
    pub unit_name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub jobs_processed: u32,
    pub current_job_id: Option<String>,
    pub current_seed: Option<String>,
    pub health_status: String,
}

impl Engine {
    pub fn new(id: impl Into<String>, unit_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: EngineState::Starting,
            unit_name: unit_name.into(),
            created_at: now,
            last_used_at: now,
            jobs_processed: 0,
            current_job_id: None,
            current_seed: None,
            health_status: "unknown".to_string(),
        }
    }

    /// An engine found already running; it is registered as ready.
    pub fn discovered(
        id: impl Into<String>,
        unit_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            state: EngineState::Ready,
            created_at,
            last_used_at: created_at,
            health_status: "healthy".to_string(),
            ..Self::new(id, unit_name)
        }
    }

    pub fn transition(&mut self, next: EngineState) -> Result<(), EngineTransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineTransitionError {
                engine_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Claim a ready engine for a job.
    pub fn assign(
        &mut self,
        job_id: impl Into<String>,
        seed: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineTransitionError> {
        self.transition(EngineState::Generating)?;
        self.current_job_id = Some(job_id.into());
        self.current_seed = Some(seed.into());
        self.last_used_at = now;
        Ok(())
    }

    /// Count the finished job and pick the next state. An engine that has
    /// reached `max_jobs` must reset before it can serve again.
    pub fn complete_job(
        &mut self,
        max_jobs: u32,
        now: DateTime<Utc>,
    ) -> Result<EngineState, EngineTransitionError> {
        self.jobs_processed += 1;
        let next = if self.jobs_processed >= max_jobs {
            EngineState::Resetting
        } else {
            EngineState::Ready
        };
        self.transition(next)?;
        self.current_job_id = None;
        self.current_seed = None;
        self.last_used_at = now;
        Ok(next)
    }

    pub fn finish_reset(&mut self) -> Result<(), EngineTransitionError> {
        self.transition(EngineState::Ready)?;
        self.jobs_processed = 0;
        Ok(())
    }

    /// Mark failed. Idempotent.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = EngineState::Error;
        self.health_status = reason.into();
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_used_at
    }
}
