use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use worldgen_common::{
    FailureKind, GenerationResult, GenerationStatus, Job, JobStage, JobStatus, LaunchPlan,
};

use super::retry::{AttemptOutcome, RetryPolicy, classify};
use super::store::JobRecords;
use crate::config::Settings;
use crate::errors::{JobError, StoreError};
use crate::orchestrator::{Orchestrator, validate_outputs};
use crate::plan::{PlanBuilder, SeedDirectories, persist_plan, seed_hash};
use crate::pool::WarmEnginePool;

/// Accepts jobs, runs attempts with retry, and owns job status.
pub struct JobController {
    plans: PlanBuilder,
    orchestrator: Arc<Orchestrator>,
    pool: Option<Arc<WarmEnginePool>>,
    records: JobRecords,
    policy: RetryPolicy,
    single_flight: bool,
    data_dir: PathBuf,
    host_data_dir: PathBuf,
    workers: Semaphore,
    submissions: Mutex<()>,
}

impl JobController {
    pub fn new(settings: &Settings, orchestrator: Arc<Orchestrator>, records: JobRecords) -> Self {
        Self {
            plans: PlanBuilder::from_settings(settings),
            orchestrator,
            pool: None,
            records,
            policy: RetryPolicy::new(
                settings.jobs.max_retries,
                std::time::Duration::from_secs(settings.jobs.retry_base_delay_seconds),
            ),
            single_flight: settings.jobs.single_flight,
            data_dir: settings.data_dir.clone(),
            host_data_dir: settings.host_data_dir(),
            workers: Semaphore::new(settings.jobs.worker_concurrency.max(1)),
            submissions: Mutex::new(()),
        }
    }

    pub fn with_pool(mut self, pool: Arc<WarmEnginePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn records(&self) -> &JobRecords {
        &self.records
    }

    /// Record a pending job for `seed`. With single-flight on, an unfinished
    /// job for the same seed is returned instead.
    pub async fn submit_job(&self, seed: &str, force_regenerate: bool) -> Result<Job, JobError> {
        let seed = seed.trim();
        if seed.is_empty() {
            return Err(JobError::EmptySeed);
        }
        let hash = seed_hash(seed);

        let _guard = self.submissions.lock().await;
        if self.single_flight
            && let Some(existing) = self.records.latest_for_seed(&hash).await?
            && !existing.is_terminal()
        {
            tracing::info!(job_id = %existing.id, seed_hash = %hash, "reusing in-flight job");
            return Ok(existing);
        }

        let job = Job::new(seed, &hash).with_force_regenerate(force_regenerate);
        self.records.save(&job).await?;
        tracing::info!(job_id = %job.id, seed_hash = %hash, force_regenerate, "job submitted");
        Ok(job)
    }

    /// Submit and run on a background task.
    pub async fn submit_and_spawn(
        self: &Arc<Self>,
        seed: &str,
        force_regenerate: bool,
    ) -> Result<(Job, JoinHandle<Result<Job, JobError>>), JobError> {
        let job = self.submit_job(seed, force_regenerate).await?;
        let controller = Arc::clone(self);
        let job_id = job.id.clone();
        let handle = tokio::spawn(async move { controller.run(&job_id).await });
        Ok((job, handle))
    }

    pub async fn get_status(&self, seed_hash: &str) -> Result<Option<Job>, JobError> {
        Ok(self.records.latest_for_seed(seed_hash).await?)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, JobError> {
        Ok(self.records.load(job_id).await?)
    }

    /// Drive a pending job to a terminal status.
    pub async fn run(&self, job_id: &str) -> Result<Job, JobError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|e| JobError::Other(anyhow::anyhow!("worker pool closed: {e}")))?;

        let mut job = self
            .records
            .load(job_id)
            .await?
            .ok_or_else(|| JobError::NotFound {
                id: job_id.to_string(),
            })?;
        if job.is_terminal() {
            return Ok(job);
        }
        if job.status == JobStatus::Pending {
            job.transition(JobStatus::Running)?;
        }
        job.current_stage = JobStage::Validation;
        self.records.save(&job).await?;

        let dirs = SeedDirectories::new(&self.data_dir, &self.host_data_dir, &job.seed_hash);
        if let Err(e) = dirs.create() {
            self.finish(&mut job, JobStatus::Failed, Some(format!("{e:#}")), None)
                .await?;
            return Ok(job);
        }
        let plan = self.plans.build(&job.seed, &job.seed_hash, &dirs);
        if let Err(e) = persist_plan(&plan, &dirs.extracted) {
            tracing::warn!(job_id = %job.id, error = %e, "could not write plan file");
        }

        if !job.force_regenerate {
            let existing = validate_outputs(&plan.expected_outputs);
            if existing.all_present() {
                tracing::info!(job_id = %job.id, "artifacts already present, skipping generation");
                job.current_stage = JobStage::Cached;
                job.generation_status = GenerationStatus {
                    primary_present: true,
                    secondary_present: true,
                    ..Default::default()
                };
                self.finish(&mut job, JobStatus::Succeeded, None, None).await?;
                return Ok(job);
            }
        }

        if let Err(e) = self.orchestrator.validate_configuration(&plan).await {
            if e.kind() == FailureKind::Configuration {
                tracing::error!(job_id = %job.id, error = %e, "configuration invalid");
                self.finish(&mut job, JobStatus::Failed, Some(e.to_string()), None)
                    .await?;
                return Ok(job);
            }
            tracing::warn!(job_id = %job.id, error = %e, "pre-flight check inconclusive");
        }

        job.current_stage = JobStage::Generation;
        self.records.save(&job).await?;

        for attempt in 0..self.policy.max_attempts {
            job.attempts = attempt + 1;
            self.records.save(&job).await?;
            tracing::info!(job_id = %job.id, attempt = job.attempts, "starting attempt");

            let result = self.attempt(&mut job, &plan, &dirs).await;
            job.generation_status = result.generation_status();
            job.engine_id = result.engine_id.clone();

            match classify(&result) {
                AttemptOutcome::Succeeded => {
                    job.current_stage = JobStage::Finalize;
                    self.finish(&mut job, JobStatus::Succeeded, None, None).await?;
                    tracing::info!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        duration_secs = result.duration_seconds,
                        "job succeeded"
                    );
                    return Ok(job);
                }
                AttemptOutcome::Fatal => {
                    return self.fail(job, JobStatus::Failed, &result).await;
                }
                AttemptOutcome::Timeout => {
                    return self.fail(job, JobStatus::TimedOut, &result).await;
                }
                AttemptOutcome::Retry if self.policy.has_attempts_after(attempt) => {
                    let delay = self.policy.delay_after(attempt);
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        error = result.error_message.as_deref().unwrap_or("artifacts incomplete"),
                        delay_secs = delay.as_secs(),
                        "attempt failed, retrying"
                    );
                    job.error_message = result.error_message.clone();
                    self.records.save(&job).await?;
                    tokio::time::sleep(delay).await;
                }
                AttemptOutcome::Retry => {
                    return self.fail(job, JobStatus::Failed, &result).await;
                }
            }
        }
        // `max_attempts` is at least one, so the loop always returns.
        Err(JobError::Other(anyhow::anyhow!("no attempt was made for job {}", job.id)))
    }

    /// One attempt, preferring a warm engine. Progress is persisted as it rises.
    async fn attempt(&self, job: &mut Job, plan: &LaunchPlan, dirs: &SeedDirectories) -> GenerationResult {
        let (tx, mut rx) = watch::channel(job.progress_percent);
        let records = self.records.clone();
        let mut tracked = job.clone();
        let progress_task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let value = *rx.borrow_and_update();
                if tracked.record_progress(value)
                    && let Err(e) = records.save(&tracked).await
                {
                    tracing::debug!(error = %e, "progress write failed");
                }
            }
        });

        let result = self.attempt_inner(job, plan, dirs, &tx).await;
        let last = *tx.borrow();
        drop(tx);
        if let Err(e) = progress_task.await {
            tracing::debug!(error = %e, "progress task ended abnormally");
        }
        job.record_progress(last);
        result
    }

    async fn attempt_inner(
        &self,
        job: &Job,
        plan: &LaunchPlan,
        dirs: &SeedDirectories,
        progress: &watch::Sender<u8>,
    ) -> GenerationResult {
        if let Some(pool) = &self.pool {
            match pool.acquire_engine(&job.id, &job.seed).await {
                Ok(engine_id) => {
                    return match pool
                        .run_job(&engine_id, &job.seed, &job.seed_hash, &job.id, Some(progress))
                        .await
                    {
                        Ok(result) => result,
                        Err(e) => {
                            let mut result =
                                GenerationResult::failed(FailureKind::Launch, e.to_string());
                            result.engine_id = Some(engine_id);
                            result
                        }
                    };
                }
                Err(e) => {
                    tracing::info!(job_id = %job.id, reason = %e, "no warm engine, launching cold");
                }
            }
        }
        self.orchestrator.generate(plan, dirs, Some(progress)).await
    }

    async fn fail(
        &self,
        mut job: Job,
        status: JobStatus,
        result: &GenerationResult,
    ) -> Result<Job, JobError> {
        let message = result
            .error_message
            .clone()
            .unwrap_or_else(|| "expected artifacts missing".to_string());
        tracing::error!(
            job_id = %job.id,
            status = %status,
            attempts = job.attempts,
            error = %message,
            "job did not succeed"
        );
        self.finish(&mut job, status, Some(message), result.log_excerpt.clone())
            .await?;
        Ok(job)
    }

    async fn finish(
        &self,
        job: &mut Job,
        status: JobStatus,
        error: Option<String>,
        excerpt: Option<String>,
    ) -> Result<(), StoreError> {
        if let Err(e) = job.transition(status) {
            // Terminal already; keep what was recorded.
            tracing::warn!(error = %e, "ignoring late status change");
            return Ok(());
        }
        job.error_message = error;
        job.log_excerpt = excerpt;
        self.records.save(job).await
    }
}
