//! Compute-unit runtime abstraction.
//!
//! The orchestrator and warm pool only talk to [`ComputeRuntime`]. The Docker
//! implementation lives in [`docker`]; [`scripted`] replays timed log lines
//! and file writes for tests.

pub mod docker;
pub mod scripted;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use worldgen_common::{LaunchPlan, VolumeMount};

use crate::errors::RuntimeError;

pub use docker::DockerRuntime;
pub use scripted::{RuntimeCall, ScriptedRuntime, UnitScript};

/// Lines of workload output; an `Err` item ends the stream.
pub type LogStream = mpsc::Receiver<Result<String, RuntimeError>>;

/// A started compute unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitHandle {
    pub id: String,
    pub name: String,
}

/// What to start.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub labels: BTreeMap<String, String>,
    pub memory_limit_bytes: Option<i64>,
}

impl UnitSpec {
    pub fn from_plan(plan: &LaunchPlan, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: plan.image.clone(),
            env: plan.env.clone(),
            volumes: plan.volumes.clone(),
            labels: plan.labels.clone(),
            memory_limit_bytes: None,
        }
    }

    pub fn with_memory_limit(mut self, bytes: Option<i64>) -> Self {
        self.memory_limit_bytes = bytes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Running,
    Exited { exit_code: Option<i64> },
}

impl UnitStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Where a log stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCursor {
    /// Everything the unit has written.
    Start,
    /// Only lines written after the call.
    Now,
}

/// A unit found by label, running or not.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredUnit {
    pub handle: UnitHandle,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Start, observe and stop isolated workloads.
#[async_trait]
pub trait ComputeRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn start(&self, spec: &UnitSpec) -> Result<UnitHandle, RuntimeError>;

    /// Ask the unit to stop, killing it after `grace`.
    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Force-remove. Returns `NotFound` if nothing by that name exists.
    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    async fn logs(&self, name: &str, cursor: LogCursor) -> Result<LogStream, RuntimeError>;

    async fn status(&self, name: &str) -> Result<UnitStatus, RuntimeError>;

    /// Units carrying `key=value`, stopped ones included.
    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<DiscoveredUnit>, RuntimeError>;
}

/// Stop then remove, treating an already-gone unit as success.
pub async fn teardown(
    runtime: &dyn ComputeRuntime,
    name: &str,
    grace: Duration,
) -> Result<(), RuntimeError> {
    match runtime.stop(name, grace).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => tracing::warn!(unit = %name, error = %e, "stop failed; forcing removal"),
    }
    match runtime.remove(name).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
