use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use worldgen_common::{Engine, EngineState, GenerationResult, VolumeMount};

use super::recycle::{
    ENGINE_EXPORT_DIR, RecycleContext, RecycleStrategy, clear_engine_workdir, strategy_for,
};
use super::registry::{EngineEntry, EngineRegistry, PoolStatus};
use crate::config::{EnginePoolConfig, Settings};
use crate::errors::PoolError;
use crate::orchestrator::{Orchestrator, ProgressSink};
use crate::plan::{
    CONFIG_MOUNT, LABEL_CREATED, LABEL_ENGINE_ID, LABEL_TYPE, PLUGINS_MOUNT, PlanBuilder,
    SeedDirectories, TYPE_WARM_ENGINE, WORLD_DATA_MOUNT,
};
use crate::readiness::{CapturedLog, ReadinessDetector, StopReason};
use crate::runtime::{ComputeRuntime, LogCursor, UnitSpec};

/// Lines an idle engine prints once it can take work.
pub const ENGINE_READY_PATTERNS: &[&str] = &[
    "Game server connected",
    "DungeonDB Start",
    "Zonesystem Awake",
    "Server ready",
];

const ENGINES_DIR: &str = "engines";

/// Pool of long-lived workload units reused across jobs.
///
/// The registry is the only shared mutable state and is only touched under
/// its mutex. Runtime calls happen outside the lock.
pub struct WarmEnginePool {
    orchestrator: Arc<Orchestrator>,
    config: EnginePoolConfig,
    plans: PlanBuilder,
    data_dir: PathBuf,
    host_data_dir: PathBuf,
    plugins_dir: Option<PathBuf>,
    image: String,
    engine_env: BTreeMap<String, String>,
    strategy: Box<dyn RecycleStrategy>,
    registry: Mutex<EngineRegistry>,
}

impl WarmEnginePool {
    pub fn new(orchestrator: Arc<Orchestrator>, settings: &Settings) -> Self {
        let config = settings.pool.clone();
        let image = settings.engine_image().to_string();
        Self {
            plans: PlanBuilder::from_settings(settings)
                .with_timeout(config.job_timeout_seconds)
                .with_image(image.clone()),
            strategy: strategy_for(config.recycle_strategy),
            engine_env: engine_environment(settings),
            data_dir: settings.data_dir.clone(),
            host_data_dir: settings.host_data_dir(),
            plugins_dir: settings.plugins_dir.clone(),
            image,
            config,
            orchestrator,
            registry: Mutex::new(EngineRegistry::new()),
        }
    }

    pub fn with_strategy(mut self, strategy: Box<dyn RecycleStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &EnginePoolConfig {
        &self.config
    }

    fn runtime(&self) -> &dyn ComputeRuntime {
        self.orchestrator.runtime().as_ref()
    }

    fn unit_name(&self, id: &str) -> String {
        format!("{}-{}", self.config.name_prefix, id)
    }

    fn engine_workdir(&self, id: &str) -> PathBuf {
        self.data_dir.join(ENGINES_DIR).join(id)
    }

    fn host_engine_workdir(&self, id: &str) -> PathBuf {
        self.host_data_dir.join(ENGINES_DIR).join(id)
    }

    /// Start a new engine, or hand back the least recently used live one when
    /// the pool is full.
    pub async fn create_engine(&self, id: Option<String>) -> Result<String, PoolError> {
        let id = id.unwrap_or_else(new_engine_id);
        let unit_name = self.unit_name(&id);
        let (engine, workdir) = {
            let mut registry = self.registry.lock().await;
            if registry.live_count() >= self.config.max_pool_size {
                return match registry.lru_live() {
                    Some(entry) => {
                        tracing::info!(engine_id = %entry.engine.id, "pool full, reusing least recently used engine");
                        Ok(entry.engine.id.clone())
                    }
                    None => Err(PoolError::NoEngineAvailable),
                };
            }
            if registry.contains(&id) {
                return Ok(id);
            }
            let engine = Engine::new(&id, &unit_name);
            let workdir = self.engine_workdir(&id);
            registry.insert(EngineEntry {
                engine: engine.clone(),
                workdir: workdir.clone(),
            });
            (engine, workdir)
        };

        tracing::info!(engine_id = %id, unit = %unit_name, "starting warm engine");
        let started = Instant::now();
        if let Err(e) = self.start_engine_unit(&engine, &workdir).await {
            self.retire(&id, &e.to_string()).await;
            return Err(e);
        }

        let mut registry = self.registry.lock().await;
        let entry = registry.get_mut(&id)?;
        entry.engine.transition(EngineState::Ready)?;
        entry.engine.health_status = "healthy".to_string();
        tracing::info!(
            engine_id = %id,
            startup_secs = started.elapsed().as_secs_f64(),
            "warm engine ready"
        );
        Ok(id)
    }

    async fn start_engine_unit(&self, engine: &Engine, workdir: &Path) -> Result<(), PoolError> {
        for dir in [
            workdir.to_path_buf(),
            workdir.join("worlds_local"),
            workdir.join(ENGINE_EXPORT_DIR),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| PoolError::Io { path: dir, source })?;
        }

        let host_workdir = self.host_engine_workdir(&engine.id);
        let mut volumes = vec![
            VolumeMount::read_write(&host_workdir, CONFIG_MOUNT),
            VolumeMount::read_write(host_workdir.join(ENGINE_EXPORT_DIR), WORLD_DATA_MOUNT),
        ];
        if let Some(plugins) = &self.plugins_dir {
            volumes.push(VolumeMount::read_only(plugins, PLUGINS_MOUNT));
        }
        let spec = UnitSpec {
            name: engine.unit_name.clone(),
            image: self.image.clone(),
            env: self.engine_env.clone(),
            volumes,
            labels: engine_labels(engine),
            memory_limit_bytes: self.config.memory_limit_bytes(),
        };

        self.runtime()
            .start(&spec)
            .await
            .map_err(|e| PoolError::StartupFailed {
                id: engine.id.clone(),
                reason: e.to_string(),
            })?;
        self.wait_ready(&engine.id, &engine.unit_name).await
    }

    async fn wait_ready(&self, id: &str, unit_name: &str) -> Result<(), PoolError> {
        let startup_failed = |reason: String| PoolError::StartupFailed {
            id: id.to_string(),
            reason,
        };
        let patterns: Vec<String> = ENGINE_READY_PATTERNS.iter().map(|p| p.to_string()).collect();
        let mut detector = ReadinessDetector::startup(&patterns, self.config.startup_timeout())
            .map_err(|e| startup_failed(e.to_string()))?;
        let mut lines = self
            .runtime()
            .logs(unit_name, LogCursor::Start)
            .await
            .map_err(|e| startup_failed(e.to_string()))?;
        let mut log = CapturedLog::new();
        let detection = detector.watch(&mut lines, &mut log, |_| {}).await;
        match detection.reason {
            StopReason::Ready => Ok(()),
            StopReason::TimedOut => Err(startup_failed(format!(
                "not ready within {}s",
                self.config.startup_timeout_seconds
            ))),
            StopReason::CriticalError { line, .. } => Err(startup_failed(line)),
            other => Err(startup_failed(format!("{other:?}"))),
        }
    }

    /// Claim the least recently used ready engine for `job_id`, creating one
    /// when none is ready. The returned engine is already `Generating`.
    pub async fn acquire_engine(&self, job_id: &str, seed: &str) -> Result<String, PoolError> {
        if let Some(id) = self
            .registry
            .lock()
            .await
            .claim_lru_ready(job_id, seed, Utc::now())?
        {
            tracing::debug!(engine_id = %id, job_id, "acquired ready engine");
            return Ok(id);
        }

        let id = self.create_engine(None).await?;
        let mut registry = self.registry.lock().await;
        match registry.claim(&id, job_id, seed, Utc::now()) {
            Ok(()) => Ok(id),
            // The pool was full and the engine we got back is busy.
            Err(PoolError::EngineNotReady { .. }) => Err(PoolError::NoEngineAvailable),
            Err(e) => Err(e),
        }
    }

    /// Run one job on `engine_id`. A failed job or recycle retires the engine.
    pub async fn run_job(
        &self,
        engine_id: &str,
        seed: &str,
        seed_hash: &str,
        job_id: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<GenerationResult, PoolError> {
        let (unit_name, workdir, labels) = {
            let mut registry = self.registry.lock().await;
            let entry = registry.get_mut(engine_id)?;
            let engine = &mut entry.engine;
            match engine.state {
                EngineState::Ready => engine.assign(job_id, seed, Utc::now())?,
                EngineState::Generating if engine.current_job_id.as_deref() == Some(job_id) => {}
                state => {
                    return Err(PoolError::EngineNotReady {
                        id: engine_id.to_string(),
                        state,
                    });
                }
            }
            (engine.unit_name.clone(), entry.workdir.clone(), engine_labels(engine))
        };

        tracing::info!(engine_id, job_id, seed, strategy = %self.strategy.kind(), "running job on warm engine");
        let outcome = self
            .drive_job(engine_id, &unit_name, &workdir, &labels, seed, seed_hash, progress)
            .await;

        match outcome {
            Ok(mut result) if result.success => {
                result.engine_id = Some(engine_id.to_string());
                let next = {
                    let mut registry = self.registry.lock().await;
                    let engine = &mut registry.get_mut(engine_id)?.engine;
                    engine.complete_job(self.config.max_jobs_per_engine, Utc::now())?
                };
                // A failed reset retires the engine; the job result stands.
                if next == EngineState::Resetting
                    && let Err(e) = self.reset_engine(engine_id).await
                {
                    tracing::warn!(engine_id, error = %e, "engine reset failed after job");
                }
                Ok(result)
            }
            Ok(mut result) => {
                result.engine_id = Some(engine_id.to_string());
                let reason = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "job failed".to_string());
                self.retire(engine_id, &reason).await;
                Ok(result)
            }
            Err(e) => {
                self.retire(engine_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_job(
        &self,
        engine_id: &str,
        unit_name: &str,
        workdir: &Path,
        labels: &BTreeMap<String, String>,
        seed: &str,
        seed_hash: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<GenerationResult, PoolError> {
        let started = Instant::now();
        let dirs = SeedDirectories::new(&self.data_dir, &self.host_data_dir, seed_hash);
        dirs.create().map_err(|e| PoolError::RecycleFailed {
            id: engine_id.to_string(),
            reason: format!("{e:#}"),
        })?;
        let plan = self.plans.build(seed, seed_hash, &dirs);

        let ctx = RecycleContext {
            runtime: self.runtime(),
            engine_id,
            unit_name,
            workdir,
            plan: &plan,
            engine_labels: labels,
            memory_limit_bytes: self.config.memory_limit_bytes(),
            stop_grace: self.orchestrator.settings().force_stop,
        };
        let watch = self.strategy.recycle(&ctx).await?;

        self.registry
            .lock()
            .await
            .get_mut(engine_id)?
            .engine
            .transition(EngineState::Exporting)?;

        let mut log = CapturedLog::new();
        log.note(format!("engine {engine_id} serving seed {seed}"));
        let detection = match self
            .orchestrator
            .observe(
                unit_name,
                watch.cursor,
                &plan.readiness,
                watch.artifacts.clone(),
                &mut log,
                progress,
            )
            .await
        {
            Ok(detection) => detection,
            Err(e) => return Ok(GenerationResult::failed(e.kind(), e.to_string())),
        };

        self.strategy.collect(&ctx, &watch).await?;
        Ok(self
            .orchestrator
            .finalize(&plan, &dirs, &detection, log, started)
            .await)
    }

    /// Clear per-job state and restart the unit as an idle engine.
    async fn reset_engine(&self, engine_id: &str) -> Result<(), PoolError> {
        let (engine, workdir) = {
            let registry = self.registry.lock().await;
            let entry = registry.get(engine_id).ok_or_else(|| PoolError::EngineNotFound {
                id: engine_id.to_string(),
            })?;
            (entry.engine.clone(), entry.workdir.clone())
        };
        tracing::info!(engine_id, jobs = engine.jobs_processed, "resetting engine");

        let result = async {
            clear_engine_workdir(&workdir).map_err(|source| PoolError::Io {
                path: workdir.clone(),
                source,
            })?;
            crate::runtime::teardown(
                self.runtime(),
                &engine.unit_name,
                self.orchestrator.settings().graceful_stop,
            )
            .await?;
            self.start_engine_unit(&engine, &workdir).await
        }
        .await;

        match result {
            Ok(()) => {
                let mut registry = self.registry.lock().await;
                registry.get_mut(engine_id)?.engine.finish_reset()?;
                tracing::info!(engine_id, "engine reset complete");
                Ok(())
            }
            Err(e) => {
                self.retire(engine_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Mark the engine failed, drop it from the pool and tear down its unit.
    async fn retire(&self, engine_id: &str, reason: &str) {
        let removed = {
            let mut registry = self.registry.lock().await;
            if let Ok(entry) = registry.get_mut(engine_id) {
                entry.engine.fail(reason);
            }
            registry.remove(engine_id)
        };
        if let Some(entry) = removed {
            tracing::warn!(engine_id, reason, "engine retired");
            self.orchestrator.teardown(&entry.engine.unit_name).await;
        }
    }

    /// Re-register running pool units left by an earlier process.
    pub async fn discover_existing(&self) -> Result<usize, PoolError> {
        let units = self
            .runtime()
            .list_by_label(LABEL_TYPE, TYPE_WARM_ENGINE)
            .await?;
        let mut registry = self.registry.lock().await;
        let mut added = 0;
        for unit in units {
            if !unit.running {
                tracing::debug!(unit = %unit.handle.name, "skipping stopped pool unit");
                continue;
            }
            let Some(id) = unit.labels.get(LABEL_ENGINE_ID) else {
                tracing::warn!(unit = %unit.handle.name, "pool unit without engine id label");
                continue;
            };
            if registry.contains(id) {
                continue;
            }
            if registry.live_count() >= self.config.max_pool_size {
                tracing::warn!(unit = %unit.handle.name, "pool full, not adopting unit");
                continue;
            }
            let created = unit
                .labels
                .get(LABEL_CREATED)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .or(unit.created_at)
                .unwrap_or_else(Utc::now);
            registry.insert(EngineEntry {
                engine: Engine::discovered(id, &unit.handle.name, created),
                workdir: self.engine_workdir(id),
            });
            tracing::info!(engine_id = %id, unit = %unit.handle.name, "discovered existing engine");
            added += 1;
        }
        Ok(added)
    }

    pub async fn cleanup_expired(&self) -> Vec<String> {
        self.cleanup_expired_at(Utc::now()).await
    }

    /// Shut down ready engines idle for longer than the pool TTL at `now`.
    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let removed: Vec<EngineEntry> = {
            let mut registry = self.registry.lock().await;
            registry
                .expired(self.config.ttl(), now)
                .iter()
                .filter_map(|id| registry.remove(id))
                .collect()
        };
        for entry in &removed {
            tracing::info!(engine_id = %entry.engine.id, "engine expired");
            self.orchestrator.teardown(&entry.engine.unit_name).await;
        }
        removed.into_iter().map(|e| e.engine.id).collect()
    }

    /// Drop ready engines whose unit is no longer running.
    pub async fn check_health(&self) -> Vec<String> {
        let ready: Vec<(String, String)> = {
            let registry = self.registry.lock().await;
            registry
                .snapshot()
                .into_iter()
                .filter(|e| e.state == EngineState::Ready)
                .map(|e| (e.id, e.unit_name))
                .collect()
        };

        let mut removed = Vec::new();
        for (id, unit_name) in ready {
            let healthy = match self.runtime().status(&unit_name).await {
                Ok(status) => status.is_running(),
                Err(e) if e.is_not_found() => false,
                Err(e) => {
                    tracing::warn!(engine_id = %id, error = %e, "health check failed");
                    continue;
                }
            };
            if healthy {
                continue;
            }
            let still_ready = {
                let mut registry = self.registry.lock().await;
                match registry.get_mut(&id) {
                    Ok(entry) if entry.engine.state == EngineState::Ready => {
                        entry.engine.fail("unit not running");
                        true
                    }
                    _ => false,
                }
            };
            if still_ready {
                self.retire(&id, "unit not running").await;
                removed.push(id);
            }
        }
        removed
    }

    pub async fn status(&self) -> PoolStatus {
        let registry = self.registry.lock().await;
        PoolStatus {
            pool_size: registry.live_count(),
            max_pool_size: self.config.max_pool_size,
            engines: registry.snapshot(),
        }
    }

    /// Stop and remove an idle engine. Engines serving a job are left alone.
    pub async fn shutdown_engine(&self, engine_id: &str) -> Result<(), PoolError> {
        let entry = {
            let mut registry = self.registry.lock().await;
            let not_found = || PoolError::EngineNotFound {
                id: engine_id.to_string(),
            };
            let state = registry.get(engine_id).ok_or_else(not_found)?.engine.state;
            if !matches!(state, EngineState::Ready | EngineState::Error) {
                return Err(PoolError::EngineNotReady {
                    id: engine_id.to_string(),
                    state,
                });
            }
            registry.remove(engine_id).ok_or_else(not_found)?
        };
        tracing::info!(engine_id, "shutting down engine");
        self.orchestrator.teardown(&entry.engine.unit_name).await;
        Ok(())
    }

    pub async fn shutdown_all(&self) -> usize {
        let ids = self.registry.lock().await.ids();
        let mut stopped = 0;
        for id in ids {
            match self.shutdown_engine(&id).await {
                Ok(()) => stopped += 1,
                Err(e) => tracing::info!(engine_id = %id, reason = %e, "engine not shut down"),
            }
        }
        stopped
    }
}

/// Run health checks and TTL cleanup until `shutdown` flips or its sender drops.
pub fn spawn_maintenance(
    pool: Arc<WarmEnginePool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(pool.config.health_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let unhealthy = pool.check_health().await;
                    let expired = pool.cleanup_expired().await;
                    if !unhealthy.is_empty() || !expired.is_empty() {
                        tracing::info!(?unhealthy, ?expired, "pool maintenance removed engines");
                    }
                }
            }
        }
        tracing::debug!("pool maintenance stopped");
    })
}

fn new_engine_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

fn engine_labels(engine: &Engine) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_TYPE.to_string(), TYPE_WARM_ENGINE.to_string()),
        (LABEL_ENGINE_ID.to_string(), engine.id.clone()),
        (LABEL_CREATED.to_string(), engine.created_at.to_rfc3339()),
    ])
}

fn engine_environment(settings: &Settings) -> BTreeMap<String, String> {
    [
        ("TZ", "UTC".to_string()),
        ("VWE_WARM_ENGINE", "true".to_string()),
        ("BEPINEX", "1".to_string()),
        ("SERVER_PUBLIC", "0".to_string()),
        ("UPDATE_ON_START", "0".to_string()),
        ("WORLD_NAME", "WarmEngine".to_string()),
        ("SERVER_NAME", format!("{} Warm Engine", settings.server_name)),
        ("SERVER_PASS", settings.server_password.clone()),
        ("VWE_AUTOSAVE_ENABLED", "true".to_string()),
        ("VWE_DATAEXPORT_ENABLED", "true".to_string()),
        ("VWE_DATAEXPORT_DIR", WORLD_DATA_MOUNT.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
