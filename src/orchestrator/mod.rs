//! Compute Unit Orchestrator: one generation attempt on a fresh unit.
//!
//! `launch` starts a uniquely named unit from a plan, `run_to_completion`
//! watches it through readiness, shutdown and artifact validation, and
//! `teardown` removes it. Warm-pool jobs reuse `observe` and `finalize`
//! without the launch and shutdown steps.

pub mod artifacts;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use worldgen_common::{FailureKind, GenerationResult, LaunchPlan, ReadinessSpec};

use crate::config::Settings;
use crate::errors::GenerationError;
use crate::plan::{LABEL_SEED_HASH, SeedDirectories, persist_plan};
use crate::readiness::{
    CapturedLog, Detection, DetectorEvent, ReadinessDetector, ReadinessMatcher, StopReason,
    resolve_present,
};
use crate::runtime::{ComputeRuntime, LogCursor, UnitHandle, UnitSpec};

pub use artifacts::{ArtifactReport, OwnershipReport, fix_ownership, validate_outputs};

/// Progress reported to whoever tracks the job. Values only increase.
pub type ProgressSink = watch::Sender<u8>;

/// Timing and environment knobs for attempts.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub graceful_stop: Duration,
    pub force_stop: Duration,
    pub post_shutdown_settle: Duration,
    pub host_uid: Option<u32>,
    pub host_gid: Option<u32>,
    pub plugins_dir: Option<PathBuf>,
    pub required_plugins: Vec<String>,
}

impl From<&Settings> for OrchestratorSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.readiness.poll_interval(),
            graceful_stop: settings.readiness.graceful_stop(),
            force_stop: settings.readiness.force_stop(),
            post_shutdown_settle: settings.readiness.post_shutdown_settle(),
            host_uid: settings.host_uid,
            host_gid: settings.host_gid,
            plugins_dir: settings.plugins_dir.clone(),
            required_plugins: settings.required_plugins.clone(),
        }
    }
}

pub struct Orchestrator {
    runtime: Arc<dyn ComputeRuntime>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ComputeRuntime>, settings: OrchestratorSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn runtime(&self) -> &Arc<dyn ComputeRuntime> {
        &self.runtime
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Checks that make retrying pointless when they fail.
    pub async fn validate_configuration(&self, plan: &LaunchPlan) -> Result<(), GenerationError> {
        ReadinessMatcher::new(&plan.readiness.log_patterns)?;

        for volume in &plan.volumes {
            if !volume.host_path.is_absolute() {
                return Err(GenerationError::Configuration(format!(
                    "mount source must be absolute: {}",
                    volume.host_path.display()
                )));
            }
        }

        match self.runtime.image_exists(&plan.image).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(GenerationError::Configuration(format!(
                    "image {} is not available",
                    plan.image
                )));
            }
            Err(e) => return Err(GenerationError::Launch(format!("image check failed: {e}"))),
        }

        if let Some(dir) = &self.settings.plugins_dir {
            if !dir.is_dir() {
                return Err(GenerationError::Configuration(format!(
                    "plugins directory {} does not exist",
                    dir.display()
                )));
            }
            let missing: Vec<&str> = self
                .settings
                .required_plugins
                .iter()
                .filter(|p| !dir.join(p).is_file())
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(GenerationError::Configuration(format!(
                    "missing required plugins in {}: {}",
                    dir.display(),
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Start a unit for `plan`, clearing leftovers from earlier attempts first.
    pub async fn launch(&self, plan: &LaunchPlan) -> Result<UnitHandle, GenerationError> {
        self.remove_stale(plan).await;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", plan.unit_name, &suffix[..6]);
        let spec = UnitSpec::from_plan(plan, name);

        let unit = self
            .runtime
            .start(&spec)
            .await
            .map_err(|e| GenerationError::Launch(e.to_string()))?;
        tracing::info!(unit = %unit.name, seed_hash = %plan.seed_hash, "compute unit launched");
        Ok(unit)
    }

    async fn remove_stale(&self, plan: &LaunchPlan) {
        match self.runtime.remove(&plan.unit_name).await {
            Ok(()) => tracing::info!(unit = %plan.unit_name, "removed stale unit"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(unit = %plan.unit_name, error = %e, "stale unit removal failed"),
        }
        let stale = match self
            .runtime
            .list_by_label(LABEL_SEED_HASH, &plan.seed_hash)
            .await
        {
            Ok(units) => units,
            Err(e) => {
                tracing::warn!(error = %e, "listing stale units failed");
                return;
            }
        };
        for unit in stale {
            tracing::info!(unit = %unit.handle.name, "removing leftover unit for seed");
            if let Err(e) = crate::runtime::teardown(
                self.runtime.as_ref(),
                &unit.handle.name,
                self.settings.force_stop,
            )
            .await
            {
                tracing::warn!(unit = %unit.handle.name, error = %e, "leftover removal failed");
            }
        }
    }

    /// Watch a freshly launched unit to a terminal result. Never panics or
    /// returns an error; every failure is folded into the result.
    pub async fn run_to_completion(
        &self,
        unit: &UnitHandle,
        plan: &LaunchPlan,
        dirs: &SeedDirectories,
        progress: Option<&ProgressSink>,
    ) -> GenerationResult {
        let started = Instant::now();
        let mut log = CapturedLog::new();
        log.note(format!("watching unit {}", unit.name));

        let detection = match self
            .observe(
                &unit.name,
                LogCursor::Start,
                &plan.readiness,
                plan.expected_outputs.primary.clone(),
                &mut log,
                progress,
            )
            .await
        {
            Ok(detection) => detection,
            Err(e) => {
                log.note(e.to_string());
                if let Err(stop) = self.runtime.stop(&unit.name, self.settings.force_stop).await {
                    tracing::warn!(unit = %unit.name, error = %stop, "stop failed");
                }
                return self.failed_early(e, dirs, &log, started);
            }
        };

        match &detection.reason {
            StopReason::CriticalError { .. } | StopReason::TimedOut => {
                log.note("stopping unit");
                if let Err(e) = self.runtime.stop(&unit.name, self.settings.force_stop).await {
                    tracing::warn!(unit = %unit.name, error = %e, "stop failed");
                }
            }
            _ => {
                log.note("requesting graceful shutdown so the world is saved");
                if let Err(e) = self.runtime.stop(&unit.name, self.settings.graceful_stop).await {
                    tracing::warn!(unit = %unit.name, error = %e, "graceful stop failed");
                }
            }
        }

        self.finalize(plan, dirs, &detection, log, started).await
    }

    /// Run the readiness detector against a unit's log stream.
    pub async fn observe(
        &self,
        unit_name: &str,
        cursor: LogCursor,
        readiness: &ReadinessSpec,
        watch_paths: Vec<PathBuf>,
        log: &mut CapturedLog,
        progress: Option<&ProgressSink>,
    ) -> Result<Detection, GenerationError> {
        let mut detector =
            ReadinessDetector::new(readiness, watch_paths, self.settings.poll_interval)?;
        let mut lines = self
            .runtime
            .logs(unit_name, cursor)
            .await
            .map_err(|e| GenerationError::Launch(format!("cannot follow logs of {unit_name}: {e}")))?;

        let detection = detector
            .watch(&mut lines, log, |event| {
                if let (DetectorEvent::Progress(p), Some(sink)) = (&event, progress) {
                    report_progress(sink, *p);
                }
            })
            .await;
        tracing::debug!(unit = %unit_name, reason = ?detection.reason, "detector finished");
        Ok(detection)
    }

    /// Validate artifacts, fix ownership, persist the log and build the result.
    pub async fn finalize(
        &self,
        plan: &LaunchPlan,
        dirs: &SeedDirectories,
        detection: &Detection,
        mut log: CapturedLog,
        started: Instant,
    ) -> GenerationResult {
        let aborted = matches!(
            detection.reason,
            StopReason::CriticalError { .. } | StopReason::TimedOut | StopReason::StreamFailed { .. }
        );

        if !aborted
            && !self.settings.post_shutdown_settle.is_zero()
            && let Some(db) = plan.expected_outputs.primary.first()
            && resolve_present(db).is_none()
        {
            log.note(format!(
                "world database not found yet; waiting {}s",
                self.settings.post_shutdown_settle.as_secs()
            ));
            tokio::time::sleep(self.settings.post_shutdown_settle).await;
        }

        let report = validate_outputs(&plan.expected_outputs);

        if let (Some(uid), Some(gid)) = (self.settings.host_uid, self.settings.host_gid) {
            let ownership = fix_ownership(&dirs.root, uid, gid);
            log.note(format!(
                "ownership set to {uid}:{gid} on {} entries ({} failed)",
                ownership.changed, ownership.failed
            ));
        }

        let mut result = GenerationResult {
            duration_seconds: started.elapsed().as_secs_f64(),
            log_match: detection.log_match,
            files_stable: detection.files_stable,
            primary_present: report.primary_present,
            secondary_present: report.secondary_present,
            files_found: report.files_found.clone(),
            lines_written: log.lines_written(),
            ..Default::default()
        };

        let failure = match &detection.reason {
            StopReason::CriticalError { pattern, line } => Some(GenerationError::CriticalRuntime {
                pattern: pattern.clone(),
                line: line.clone(),
            }),
            StopReason::TimedOut => Some(GenerationError::ReadinessTimeout {
                timeout_seconds: plan.readiness.timeout_seconds,
            }),
            StopReason::StreamFailed { message } => {
                Some(GenerationError::Launch(format!("log stream failed: {message}")))
            }
            _ if !report.primary_present => Some(GenerationError::OutputValidation {
                missing: report
                    .missing
                    .iter()
                    .filter(|p| plan.expected_outputs.primary.contains(p))
                    .cloned()
                    .collect(),
            }),
            _ => None,
        };

        match failure {
            Some(error) => {
                result.timed_out = error.kind() == FailureKind::ReadinessTimeout;
                result.failure = Some(error.kind());
                result.error_message = Some(error.to_string());
                result.log_excerpt = log.excerpt();
                log.note(format!("attempt failed: {error}"));
                tracing::warn!(seed_hash = %plan.seed_hash, kind = error.kind().as_str(), error = %error, "generation attempt failed");
            }
            None => {
                result.success = true;
                log.note("attempt succeeded");
                tracing::info!(
                    seed_hash = %plan.seed_hash,
                    duration_secs = result.duration_seconds,
                    secondary_present = result.secondary_present,
                    "generation attempt succeeded"
                );
            }
        }

        self.persist_attempt(plan, dirs, &log);
        result
    }

    /// Remove the unit; a unit that is already gone is fine.
    pub async fn teardown(&self, unit_name: &str) {
        if let Err(e) =
            crate::runtime::teardown(self.runtime.as_ref(), unit_name, self.settings.force_stop).await
        {
            tracing::warn!(unit = %unit_name, error = %e, "teardown failed");
        }
    }

    /// Launch, run and tear down one cold attempt.
    pub async fn generate(
        &self,
        plan: &LaunchPlan,
        dirs: &SeedDirectories,
        progress: Option<&ProgressSink>,
    ) -> GenerationResult {
        let started = Instant::now();
        let unit = match self.launch(plan).await {
            Ok(unit) => unit,
            Err(e) => {
                let mut log = CapturedLog::new();
                log.note(e.to_string());
                return self.failed_early(e, dirs, &log, started);
            }
        };
        let result = self.run_to_completion(&unit, plan, dirs, progress).await;
        self.teardown(&unit.name).await;
        result
    }

    fn failed_early(
        &self,
        error: GenerationError,
        dirs: &SeedDirectories,
        log: &CapturedLog,
        started: Instant,
    ) -> GenerationResult {
        if let Err(e) = log.persist(&dirs.extracted) {
            tracing::warn!(error = %e, "could not write attempt log");
        }
        let mut result = GenerationResult::failed(error.kind(), error.to_string());
        result.duration_seconds = started.elapsed().as_secs_f64();
        result.log_excerpt = log.excerpt();
        result
    }

    fn persist_attempt(&self, plan: &LaunchPlan, dirs: &SeedDirectories, log: &CapturedLog) {
        if let Err(e) = persist_plan(plan, &dirs.extracted) {
            tracing::warn!(error = %e, "could not write plan file");
        }
        if let Err(e) = log.persist(&dirs.extracted) {
            tracing::warn!(error = %e, "could not write attempt log");
        }
    }
}

fn report_progress(sink: &ProgressSink, value: u8) {
    sink.send_if_modified(|current| {
        if value > *current {
            *current = value;
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanBuilder, seed_hash};
    use crate::readiness::LOG_FILE;
    use crate::runtime::{RuntimeCall, ScriptedRuntime, UnitScript};
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        runtime: Arc<ScriptedRuntime>,
        orchestrator: Orchestrator,
        plan: LaunchPlan,
        dirs: SeedDirectories,
    }

    fn fixture(seed: &str) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.data_dir = tmp.path().to_path_buf();
        let hash = seed_hash(seed);
        let dirs = SeedDirectories::new(tmp.path(), tmp.path(), &hash);
        dirs.create().unwrap();
        let plan = PlanBuilder::from_settings(&settings).build(seed, &hash, &dirs);
        let runtime = Arc::new(ScriptedRuntime::new());
        let orchestrator = Orchestrator::new(runtime.clone(), OrchestratorSettings::from(&settings));
        Fixture {
            _tmp: tmp,
            runtime,
            orchestrator,
            plan,
            dirs,
        }
    }

    fn all_outputs(plan: &LaunchPlan) -> Vec<PathBuf> {
        plan.expected_outputs.all().cloned().collect()
    }

    fn write_script(plan: &LaunchPlan, at: u64) -> UnitScript {
        all_outputs(plan)
            .into_iter()
            .fold(UnitScript::new(), |script, path| {
                script.file(Duration::from_secs(at), path, "data")
            })
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_ready_then_files_succeeds() {
        let f = fixture("TestSeed123");
        f.runtime.push_script(
            write_script(&f.plan, 12).line(Duration::from_secs(5), "Game server connected"),
        );
        let result = f.orchestrator.generate(&f.plan, &f.dirs, None).await;
        assert!(result.success, "{:?}", result.error_message);
        assert!(result.log_match);
        assert!(result.primary_present);
        assert!(result.secondary_present);
        assert!(!result.timed_out);
        assert!(f.dirs.extracted.join(LOG_FILE).is_file());
        assert!(f.dirs.extracted.join(crate::plan::PLAN_FILE).is_file());
        assert!(f.runtime.running_units().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let f = fixture("quiet");
        f.runtime.push_script(UnitScript::new().line(Duration::from_secs(1), "booting"));
        let begin = Instant::now();
        let result = f.orchestrator.generate(&f.plan, &f.dirs, None).await;
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.failure, Some(FailureKind::ReadinessTimeout));
        assert!(begin.elapsed() >= Duration::from_secs(900));
        assert!(begin.elapsed() < Duration::from_secs(920));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_error_fails_fast() {
        let f = fixture("broken");
        f.runtime.push_script(
            UnitScript::new().line(Duration::from_secs(2), "Bind: address already in use"),
        );
        let begin = Instant::now();
        let result = f.orchestrator.generate(&f.plan, &f.dirs, None).await;
        assert_eq!(result.failure, Some(FailureKind::CriticalRuntime));
        assert!(!result.timed_out);
        assert!(begin.elapsed() < Duration::from_secs(3));
        assert!(result.error_message.unwrap().contains("address already in use"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_hint_saves_on_graceful_stop() {
        let f = fixture("hinted");
        let mut script = UnitScript::new()
            .line(Duration::from_secs(3), "Zonesystem Start")
            .line(Duration::from_secs(6), "Generated 3000 locations");
        for path in all_outputs(&f.plan) {
            script = script.file_on_stop(path, "saved");
        }
        f.runtime.push_script(script);
        let result = f.orchestrator.generate(&f.plan, &f.dirs, None).await;
        assert!(result.success, "{:?}", result.error_message);
        assert!(result.all_artifacts_present());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_without_outputs_is_output_validation() {
        let f = fixture("crashy");
        f.runtime.push_script(
            UnitScript::new()
                .line(Duration::from_secs(1), "Zonesystem Start")
                .exit_after(Duration::from_secs(2), 1),
        );
        let result = f.orchestrator.generate(&f.plan, &f.dirs, None).await;
        assert_eq!(result.failure, Some(FailureKind::OutputValidation));
        let message = result.error_message.unwrap();
        assert!(message.contains("crashy.db"));
        assert!(!message.contains("biomes.json"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_failure_is_retryable_launch_failure() {
        let f = fixture("flaky");
        f.runtime.push_script(UnitScript::new().stream_error_after(Duration::from_secs(3)));
        let result = f.orchestrator.generate(&f.plan, &f.dirs, None).await;
        assert_eq!(result.failure, Some(FailureKind::Launch));
        assert!(!result.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failure_is_reported() {
        let f = fixture("nolaunch");
        f.runtime
            .fail_next_start(crate::errors::RuntimeError::Unavailable("daemon down".into()));
        let result = f.orchestrator.generate(&f.plan, &f.dirs, None).await;
        assert_eq!(result.failure, Some(FailureKind::Launch));
        assert!(result.error_message.unwrap().contains("daemon down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_uses_unique_names_and_removes_stale() {
        let f = fixture("twice");
        let a = f.orchestrator.launch(&f.plan).await.unwrap();
        let b = f.orchestrator.launch(&f.plan).await.unwrap();
        assert_ne!(a.name, b.name);
        assert!(a.name.starts_with(&f.plan.unit_name));
        // The first unit carried the seed label and was cleared by the second launch.
        assert!(f.runtime.calls().contains(&RuntimeCall::Remove(a.name.clone())));
        assert_eq!(f.runtime.running_units(), vec![b.name]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_removes_stopped_leftover_for_seed() {
        let f = fixture("leftover");
        f.runtime.insert_running(
            "worldgen-leftover-old",
            BTreeMap::from([(LABEL_SEED_HASH.to_string(), f.plan.seed_hash.clone())]),
            chrono::Utc::now(),
        );
        f.runtime
            .stop("worldgen-leftover-old", Duration::ZERO)
            .await
            .unwrap();

        let unit = f.orchestrator.launch(&f.plan).await.unwrap();
        assert!(f
            .runtime
            .calls()
            .contains(&RuntimeCall::Remove("worldgen-leftover-old".into())));
        let left: Vec<String> = f
            .runtime
            .list_by_label(LABEL_SEED_HASH, &f.plan.seed_hash)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.handle.name)
            .collect();
        assert_eq!(left, vec![unit.name]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_leaves_no_unit_for_seed() {
        let f = fixture("halfstarted");
        f.runtime.fail_next_start_after_create(crate::errors::RuntimeError::Unavailable(
            "no memory".into(),
        ));
        let result = f.orchestrator.generate(&f.plan, &f.dirs, None).await;
        assert_eq!(result.failure, Some(FailureKind::Launch));
        assert!(f
            .runtime
            .list_by_label(LABEL_SEED_HASH, &f.plan.seed_hash)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_forwarded() {
        let f = fixture("progress");
        f.runtime.push_script(
            write_script(&f.plan, 4)
                .line(Duration::from_secs(1), "progress: 40%")
                .line(Duration::from_secs(2), "Validating")
                .line(Duration::from_secs(3), "Game server connected"),
        );
        let (tx, rx) = watch::channel(0u8);
        f.orchestrator.generate(&f.plan, &f.dirs, Some(&tx)).await;
        assert_eq!(*rx.borrow(), 75);
    }

    #[tokio::test]
    async fn test_validate_configuration_checks_image_and_plugins() {
        let f = fixture("cfg");
        f.orchestrator.validate_configuration(&f.plan).await.unwrap();

        f.runtime.mark_image_missing(f.plan.image.clone());
        let err = f.orchestrator.validate_configuration(&f.plan).await.unwrap_err();
        assert!(matches!(err, GenerationError::Configuration(_)));

        let plugins = tempfile::tempdir().unwrap();
        std::fs::write(plugins.path().join("VWE_AutoSave.dll"), b"").unwrap();
        let mut settings = Settings::default();
        settings.plugins_dir = Some(plugins.path().to_path_buf());
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedRuntime::new()),
            OrchestratorSettings::from(&settings),
        );
        let err = orchestrator.validate_configuration(&f.plan).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("VWE_DataExporter.dll"));
        assert!(!message.contains("VWE_AutoSave.dll"));
    }

    #[tokio::test]
    async fn test_validate_rejects_relative_mounts() {
        let mut f = fixture("rel");
        f.plan.volumes[0].host_path = Path::new("data/seeds").to_path_buf();
        let err = f.orchestrator.validate_configuration(&f.plan).await.unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }
}
