//! Seed commands: `worldgen generate`, `worldgen plan`, `worldgen status`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use worldgen::common::JobStatus;
use worldgen::config::Settings;
use worldgen::jobs::{JobController, JobRecords, store_from_settings};
use worldgen::plan::{PlanBuilder, SeedDirectories, seed_hash};
use worldgen::pool::{WarmEnginePool, spawn_maintenance};

use super::docker_orchestrator;

pub async fn cmd_generate(settings: &Settings, seed: &str, force: bool, no_pool: bool) -> Result<()> {
    let orchestrator = docker_orchestrator(settings)?;
    let store = store_from_settings(settings)?;
    let records = JobRecords::new(store, settings.jobs.status_ttl());
    let mut controller = JobController::new(settings, orchestrator.clone(), records);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut maintenance = None;
    if settings.pool.enabled && !no_pool {
        let pool = Arc::new(WarmEnginePool::new(orchestrator, settings));
        let adopted = pool.discover_existing().await?;
        tracing::info!(adopted, "warm pool ready");
        maintenance = Some(spawn_maintenance(pool.clone(), shutdown_rx));
        controller = controller.with_pool(pool);
    }

    let controller = Arc::new(controller);
    let (job, handle) = controller.submit_and_spawn(seed, force).await?;
    tracing::info!(job_id = %job.id, seed_hash = %job.seed_hash, "waiting for job");

    let job = tokio::select! {
        joined = handle => joined.context("Job task panicked")??,
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("Interrupted; job {} left in its last recorded state", job.id);
        }
    };

    shutdown_tx.send_replace(true);
    if let Some(task) = maintenance
        && let Err(e) = task.await
    {
        tracing::warn!(error = %e, "pool maintenance task ended abnormally");
    }

    println!("{}", serde_json::to_string_pretty(&job)?);
    if job.status != JobStatus::Succeeded {
        anyhow::bail!(
            "Job {} finished as {}: {}",
            job.id,
            job.status,
            job.error_message.as_deref().unwrap_or("no details")
        );
    }
    Ok(())
}

pub fn cmd_plan(settings: &Settings, seed: &str) -> Result<()> {
    let seed = seed.trim();
    if seed.is_empty() {
        anyhow::bail!("Seed must not be empty");
    }
    let hash = seed_hash(seed);
    let dirs = SeedDirectories::new(&settings.data_dir, &settings.host_data_dir(), &hash);
    let plan = PlanBuilder::from_settings(settings).build(seed, &hash, &dirs);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

pub async fn cmd_status(settings: &Settings, seed: &str) -> Result<()> {
    if settings.jobs.store_path.is_none() {
        anyhow::bail!("No status store configured; set jobs.store_path or WORLDGEN_STORE_PATH");
    }
    let store = store_from_settings(settings)?;
    let records = JobRecords::new(store, settings.jobs.status_ttl());
    match records.latest_for_seed(&seed_hash(seed)).await? {
        Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
        None => println!("No job recorded for seed '{}'", seed.trim()),
    }
    Ok(())
}
