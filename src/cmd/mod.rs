//! CLI command implementations.
//!
//! | Module     | Commands handled                 |
//! |------------|----------------------------------|
//! | `generate` | `Generate`, `Plan`, `Status`     |
//! | `pool`     | `Pool`                           |
//! | `config`   | `Config`                         |

pub mod config;
pub mod generate;
pub mod pool;

use std::sync::Arc;

use anyhow::{Context, Result};
use worldgen::config::Settings;
use worldgen::orchestrator::{Orchestrator, OrchestratorSettings};
use worldgen::runtime::DockerRuntime;

pub use config::cmd_config;
pub use generate::{cmd_generate, cmd_plan, cmd_status};
pub use pool::cmd_pool;

/// Orchestrator backed by the local Docker daemon.
pub(crate) fn docker_orchestrator(settings: &Settings) -> Result<Arc<Orchestrator>> {
    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    Ok(Arc::new(Orchestrator::new(
        Arc::new(runtime),
        OrchestratorSettings::from(settings),
    )))
}
