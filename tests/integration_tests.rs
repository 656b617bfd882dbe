//! Integration tests for worldgen
//!
//! CLI commands that need no container runtime run through the real binary;
//! full job scenarios run against the scripted runtime.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn worldgen(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("worldgen");
    cmd.current_dir(dir.path())
        .env_remove("WORLDGEN_CONFIG")
        .env_remove("WORLDGEN_DATA_DIR")
        .env_remove("WORLDGEN_IMAGE")
        .env_remove("WORLDGEN_STORE_PATH")
        .env_remove("RUST_LOG");
    cmd
}

// =============================================================================
// CLI
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        worldgen(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("generate"))
            .stdout(predicate::str::contains("pool"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        worldgen(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_plan_prints_deterministic_plan() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        let run = || {
            worldgen(&dir)
                .args(["plan", "TestSeed123", "--data-dir"])
                .arg(&data)
                .assert()
                .success()
                .get_output()
                .stdout
                .clone()
        };
        let first = run();
        assert_eq!(first, run());

        let plan: serde_json::Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(plan["seed"], "TestSeed123");
        assert_eq!(plan["env"]["WORLD_NAME"], "TestSeed123");
        assert!(plan["unit_name"].as_str().unwrap().starts_with("worldgen-"));
        // Planning never touches the filesystem.
        assert!(!data.exists());
    }

    #[test]
    fn test_plan_rejects_empty_seed() {
        let dir = TempDir::new().unwrap();
        worldgen(&dir)
            .args(["plan", "   "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("must not be empty"));
    }

    #[test]
    fn test_config_show_reflects_file_and_flags() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("worldgen.toml"),
            "image = \"custom/image:1\"\n\n[pool]\nmax_pool_size = 5\n",
        )
        .unwrap();
        worldgen(&dir)
            .args(["config", "show", "--data-dir", "/srv/worldgen"])
            .assert()
            .success()
            .stdout(predicate::str::contains("custom/image:1"))
            .stdout(predicate::str::contains("max_pool_size = 5"))
            .stdout(predicate::str::contains("/srv/worldgen"));
    }

    #[test]
    fn test_config_validate_defaults() {
        let dir = TempDir::new().unwrap();
        worldgen(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[readiness]\nlog_patterns = [\"(unclosed\"]\n").unwrap();
        worldgen(&dir)
            .args(["config", "validate", "--config"])
            .arg(&path)
            .assert()
            .failure()
            .stdout(predicate::str::contains("Invalid readiness pattern"));
    }

    #[test]
    fn test_malformed_config_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("worldgen.toml"), "this is = = not toml").unwrap();
        worldgen(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("worldgen.toml"));
    }
}

// =============================================================================
// Job scenarios
// =============================================================================

mod scenarios {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::time::Instant;
    use worldgen::common::{EngineState, JobStatus};
    use worldgen::config::Settings;
    use worldgen::jobs::{JobController, JobRecords, MemoryStatusStore};
    use worldgen::orchestrator::{Orchestrator, OrchestratorSettings};
    use worldgen::plan::{PLAN_FILE, SeedDirectories, seed_hash};
    use worldgen::pool::WarmEnginePool;
    use worldgen::readiness::LOG_FILE;
    use worldgen::runtime::{ScriptedRuntime, UnitScript};

    struct Harness {
        tmp: TempDir,
        settings: Settings,
        runtime: Arc<ScriptedRuntime>,
        orchestrator: Arc<Orchestrator>,
    }

    impl Harness {
        fn new(configure: impl FnOnce(&mut Settings)) -> Self {
            let tmp = TempDir::new().unwrap();
            let mut settings = Settings::default();
            settings.data_dir = tmp.path().to_path_buf();
            configure(&mut settings);
            let runtime = Arc::new(ScriptedRuntime::new());
            let orchestrator = Arc::new(Orchestrator::new(
                runtime.clone(),
                OrchestratorSettings::from(&settings),
            ));
            Self {
                tmp,
                settings,
                runtime,
                orchestrator,
            }
        }

        fn controller(&self) -> JobController {
            let records = JobRecords::new(
                Arc::new(MemoryStatusStore::new()),
                self.settings.jobs.status_ttl(),
            );
            JobController::new(&self.settings, self.orchestrator.clone(), records)
        }

        fn dirs(&self, seed: &str) -> SeedDirectories {
            SeedDirectories::new(self.tmp.path(), self.tmp.path(), &seed_hash(seed))
        }

        fn outputs(&self, seed: &str) -> Vec<PathBuf> {
            let dirs = self.dirs(seed);
            vec![
                dirs.worlds_local.join(format!("{seed}.db")),
                dirs.worlds_local.join(format!("{seed}.fwl")),
                dirs.extracted.join("biomes.json"),
                dirs.extracted.join("heightmap.npy"),
            ]
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_job_generates_world() {
        let h = Harness::new(|_| {});
        let script = h
            .outputs("TestSeed123")
            .into_iter()
            .fold(UnitScript::new(), |s, p| s.file(Duration::from_secs(20), p, "world"))
            .line(Duration::from_secs(5), "Zonesystem Start")
            .line(Duration::from_secs(10), "Game server connected")
            .line(Duration::from_secs(21), "Generated 3612 locations");
        h.runtime.push_script(script);

        let controller = h.controller();
        let job = controller.submit_job("TestSeed123", false).await.unwrap();
        let done = controller.run(&job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Succeeded, "{:?}", done.error_message);
        assert!(done.generation_status.log_match);
        assert!(!done.generation_status.timed_out);
        let dirs = h.dirs("TestSeed123");
        assert!(dirs.extracted.join(PLAN_FILE).is_file());
        assert!(dirs.extracted.join(LOG_FILE).is_file());
        assert!(h.runtime.running_units().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_workload_times_out_without_retry() {
        let h = Harness::new(|_| {});
        h.runtime
            .set_default_script(UnitScript::new().line(Duration::from_secs(1), "booting"));
        let controller = h.controller();
        let job = controller.submit_job("Silent", false).await.unwrap();

        let begin = Instant::now();
        let done = controller.run(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::TimedOut);
        assert!(done.generation_status.timed_out);
        assert!(begin.elapsed() >= Duration::from_secs(900));
        assert_eq!(h.runtime.start_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_error_fails_fast_without_retry() {
        let h = Harness::new(|_| {});
        h.runtime.set_default_script(
            UnitScript::new().line(Duration::from_secs(2), "FATAL ERROR: out of memory"),
        );
        let controller = h.controller();
        let job = controller.submit_job("Crashy", false).await.unwrap();

        let begin = Instant::now();
        let done = controller.run(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(begin.elapsed() < Duration::from_secs(60));
        assert_eq!(h.runtime.start_count(), 1);
        assert!(done.error_message.unwrap().contains("FATAL ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_never_exceeds_capacity() {
        let h = Harness::new(|s| {
            s.pool.enabled = true;
            s.pool.max_pool_size = 2;
        });
        h.runtime.set_default_script(
            UnitScript::new().line(Duration::from_secs(1), "Game server connected"),
        );
        let pool = WarmEnginePool::new(h.orchestrator.clone(), &h.settings);

        let a = pool.create_engine(None).await.unwrap();
        let b = pool.create_engine(None).await.unwrap();
        let c = pool.create_engine(None).await.unwrap();
        assert_ne!(a, b);
        assert!(c == a || c == b);

        let status = pool.status().await;
        assert_eq!(status.pool_size, 2);
        assert_eq!(status.count_in(EngineState::Ready), 2);

        assert_eq!(pool.shutdown_all().await, 2);
        assert!(h.runtime.running_units().is_empty());
    }
}
