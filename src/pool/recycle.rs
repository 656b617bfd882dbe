//! Strategies for switching a warm engine to a new seed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use worldgen_common::LaunchPlan;

use crate::config::RecycleStrategyKind;
use crate::errors::{PoolError, RuntimeError};
use crate::runtime::{ComputeRuntime, LogCursor, UnitSpec};

/// Env file the workload re-reads when asked to reconfigure.
pub const RELOAD_ENV_FILE: &str = "vwe_reload_env.txt";
/// Console commands the workload polls for.
pub const COMMANDS_FILE: &str = "vwe_commands.txt";
/// Engine-side export directory, mounted at the workload's world data path.
pub const ENGINE_EXPORT_DIR: &str = "world_data";

/// Everything a strategy needs to re-target one engine.
pub struct RecycleContext<'a> {
    pub runtime: &'a dyn ComputeRuntime,
    pub engine_id: &'a str,
    pub unit_name: &'a str,
    pub workdir: &'a Path,
    pub plan: &'a LaunchPlan,
    /// Labels that keep the unit recognisable as a pool member.
    pub engine_labels: &'a BTreeMap<String, String>,
    pub memory_limit_bytes: Option<i64>,
    pub stop_grace: Duration,
}

/// What the detector should follow for this job, and where outputs land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWatch {
    pub cursor: LogCursor,
    pub artifacts: Vec<PathBuf>,
    /// `(engine-side path, seed-side path)` copied by `collect`.
    pub transfers: Vec<(PathBuf, PathBuf)>,
}

#[async_trait]
pub trait RecycleStrategy: Send + Sync {
    fn kind(&self) -> RecycleStrategyKind;

    /// Point the engine at `ctx.plan`'s seed.
    async fn recycle(&self, ctx: &RecycleContext<'_>) -> Result<JobWatch, PoolError>;

    /// Move outputs into the seed directories once the job is done watching.
    async fn collect(&self, ctx: &RecycleContext<'_>, watch: &JobWatch) -> Result<(), PoolError> {
        for (from, to) in &watch.transfers {
            if !from.is_file() {
                continue;
            }
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(|source| PoolError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::copy(from, to).map_err(|source| PoolError::Io {
                path: from.clone(),
                source,
            })?;
            tracing::debug!(engine_id = %ctx.engine_id, from = %from.display(), to = %to.display(), "collected output");
        }
        Ok(())
    }
}

pub fn strategy_for(kind: RecycleStrategyKind) -> Box<dyn RecycleStrategy> {
    match kind {
        RecycleStrategyKind::FastRestart => Box::new(FastRestart),
        RecycleStrategyKind::LiveReconfigure => Box::new(LiveReconfigure),
    }
}

fn recycle_failed(ctx: &RecycleContext<'_>, reason: impl std::fmt::Display) -> PoolError {
    PoolError::RecycleFailed {
        id: ctx.engine_id.to_string(),
        reason: reason.to_string(),
    }
}

/// Stop the unit and start it again with the seed's environment and mounts.
pub struct FastRestart;

#[async_trait]
impl RecycleStrategy for FastRestart {
    fn kind(&self) -> RecycleStrategyKind {
        RecycleStrategyKind::FastRestart
    }

    async fn recycle(&self, ctx: &RecycleContext<'_>) -> Result<JobWatch, PoolError> {
        let gone = |r: Result<(), RuntimeError>| match r {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        };
        gone(ctx.runtime.stop(ctx.unit_name, ctx.stop_grace).await)
            .map_err(|e| recycle_failed(ctx, e))?;
        gone(ctx.runtime.remove(ctx.unit_name).await).map_err(|e| recycle_failed(ctx, e))?;

        let mut spec = UnitSpec::from_plan(ctx.plan, ctx.unit_name)
            .with_memory_limit(ctx.memory_limit_bytes);
        spec.labels = ctx.engine_labels.clone();
        spec.env
            .insert("VWE_WARM_ENGINE".to_string(), "false".to_string());

        ctx.runtime
            .start(&spec)
            .await
            .map_err(|e| recycle_failed(ctx, e))?;
        tracing::info!(engine_id = %ctx.engine_id, seed = %ctx.plan.seed, "engine restarted for seed");

        Ok(JobWatch {
            cursor: LogCursor::Start,
            artifacts: ctx.plan.expected_outputs.primary.clone(),
            transfers: Vec::new(),
        })
    }
}

/// Leave the unit running and hand it a reload file plus a load command.
pub struct LiveReconfigure;

impl LiveReconfigure {
    /// Where the running engine writes an output that `plan` expects under the seed dirs.
    fn engine_side(workdir: &Path, plan: &LaunchPlan, expected: &Path) -> PathBuf {
        let name = expected.file_name().map(PathBuf::from).unwrap_or_default();
        if plan.expected_outputs.primary.iter().any(|p| p == expected) {
            workdir.join("worlds_local").join(name)
        } else {
            workdir.join(ENGINE_EXPORT_DIR).join(name)
        }
    }
}

#[async_trait]
impl RecycleStrategy for LiveReconfigure {
    fn kind(&self) -> RecycleStrategyKind {
        RecycleStrategyKind::LiveReconfigure
    }

    async fn recycle(&self, ctx: &RecycleContext<'_>) -> Result<JobWatch, PoolError> {
        let status = ctx
            .runtime
            .status(ctx.unit_name)
            .await
            .map_err(|e| recycle_failed(ctx, e))?;
        if !status.is_running() {
            return Err(recycle_failed(ctx, "engine unit is not running"));
        }

        let env: String = ctx
            .plan
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect();
        let reload = ctx.workdir.join(RELOAD_ENV_FILE);
        std::fs::write(&reload, env).map_err(|source| PoolError::Io {
            path: reload.clone(),
            source,
        })?;
        let commands = ctx.workdir.join(COMMANDS_FILE);
        std::fs::write(&commands, format!("load_world {}\n", ctx.plan.seed)).map_err(
            |source| PoolError::Io {
                path: commands.clone(),
                source,
            },
        )?;
        tracing::info!(engine_id = %ctx.engine_id, seed = %ctx.plan.seed, "engine reconfigured in place");

        let transfers: Vec<(PathBuf, PathBuf)> = ctx
            .plan
            .expected_outputs
            .all()
            .map(|p| (Self::engine_side(ctx.workdir, ctx.plan, p), p.clone()))
            .collect();
        let artifacts = transfers
            .iter()
            .filter(|(_, seed_side)| ctx.plan.expected_outputs.primary.contains(seed_side))
            .map(|(engine_side, _)| engine_side.clone())
            .collect();

        Ok(JobWatch {
            cursor: LogCursor::Now,
            artifacts,
            transfers,
        })
    }
}

/// Remove per-job state from an engine workdir before it serves again.
pub fn clear_engine_workdir(workdir: &Path) -> std::io::Result<()> {
    let worlds = workdir.join("worlds_local");
    if worlds.is_dir() {
        std::fs::remove_dir_all(&worlds)?;
    }
    std::fs::create_dir_all(&worlds)?;
    for file in [RELOAD_ENV_FILE, COMMANDS_FILE] {
        match std::fs::remove_file(workdir.join(file)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
    }
    Ok(())
}
