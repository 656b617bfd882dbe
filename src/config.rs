//! Layered configuration for the worldgen orchestrator.
//!
//! Settings resolve in order: built-in defaults, then `worldgen.toml`
//! (path from `--config` or `WORLDGEN_CONFIG`), then `WORLDGEN_*`
//! environment variables, then CLI flags applied by the caller.
//!
//! # Configuration File Format
//!
//! ```toml
//! data_dir = "/data"
//! image = "worldgen/valheim-bepinex:latest"
//! plugins_dir = "/opt/worldgen/plugins"
//!
//! [readiness]
//! stable_seconds = 10
//! timeout_seconds = 900
//!
//! [jobs]
//! max_retries = 3
//! retry_base_delay_seconds = 10
//!
//! [pool]
//! enabled = true
//! max_pool_size = 3
//! recycle_strategy = "fast_restart"
//!
//! [logging]
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::readiness::patterns::DEFAULT_READINESS_PATTERNS;

pub const CONFIG_ENV: &str = "WORLDGEN_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "worldgen.toml";

/// Plugins the workload image cannot export world data without.
pub const DEFAULT_REQUIRED_PLUGINS: &[&str] = &[
    "VWE_DataExporter.dll",
    "VWE_AutoSave.dll",
    "Newtonsoft.Json.dll",
];

/// How a warm engine switches to a new seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecycleStrategyKind {
    /// Restart the engine's unit with the new seed's configuration.
    #[default]
    FastRestart,
    /// Hand the running engine a reload file and keep it up.
    LiveReconfigure,
}

impl std::fmt::Display for RecycleStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecycleStrategyKind::FastRestart => write!(f, "fast_restart"),
            RecycleStrategyKind::LiveReconfigure => write!(f, "live_reconfigure"),
        }
    }
}

impl std::str::FromStr for RecycleStrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fast_restart" => Ok(RecycleStrategyKind::FastRestart),
            "live_reconfigure" => Ok(RecycleStrategyKind::LiveReconfigure),
            _ => anyhow::bail!(
                "Invalid recycle strategy '{}'. Valid values: fast_restart, live_reconfigure",
                s
            ),
        }
    }
}

/// Readiness detection and shutdown timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Case-insensitive log patterns that declare readiness
    #[serde(default = "default_log_patterns")]
    pub log_patterns: Vec<String>,
    /// Seconds artifact mtimes must stay unchanged
    #[serde(default = "default_stable_seconds")]
    pub stable_seconds: u64,
    /// Wall-clock deadline for a cold attempt
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Grace period for the save-on-shutdown hook
    #[serde(default = "default_graceful_stop_seconds")]
    pub graceful_stop_seconds: u64,
    #[serde(default = "default_force_stop_seconds")]
    pub force_stop_seconds: u64,
    /// Extra wait when the world database is missing right after shutdown
    #[serde(default = "default_post_shutdown_settle_seconds")]
    pub post_shutdown_settle_seconds: u64,
}

fn default_log_patterns() -> Vec<String> {
    DEFAULT_READINESS_PATTERNS
        .iter()
        .map(|p| p.to_string())
        .collect()
}

fn default_stable_seconds() -> u64 {
    10
}

fn default_timeout_seconds() -> u64 {
    900
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_graceful_stop_seconds() -> u64 {
    10
}

fn default_force_stop_seconds() -> u64 {
    5
}

fn default_post_shutdown_settle_seconds() -> u64 {
    5
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            log_patterns: default_log_patterns(),
            stable_seconds: default_stable_seconds(),
            timeout_seconds: default_timeout_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            graceful_stop_seconds: default_graceful_stop_seconds(),
            force_stop_seconds: default_force_stop_seconds(),
            post_shutdown_settle_seconds: default_post_shutdown_settle_seconds(),
        }
    }
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn graceful_stop(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_seconds)
    }

    pub fn force_stop(&self) -> Duration {
        Duration::from_secs(self.force_stop_seconds)
    }

    pub fn post_shutdown_settle(&self) -> Duration {
        Duration::from_secs(self.post_shutdown_settle_seconds)
    }
}

/// Job controller retry and persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles on each further retry
    #[serde(default = "default_retry_base_delay_seconds")]
    pub retry_base_delay_seconds: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Reuse an in-flight job for the same seed instead of starting another
    #[serde(default)]
    pub single_flight: bool,
    #[serde(default = "default_status_ttl_seconds")]
    pub status_ttl_seconds: u64,
    /// SQLite file for job status; in-memory when unset
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_seconds() -> u64 {
    10
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_status_ttl_seconds() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_seconds: default_retry_base_delay_seconds(),
            worker_concurrency: default_worker_concurrency(),
            single_flight: false,
            status_ttl_seconds: default_status_ttl_seconds(),
            store_path: None,
        }
    }
}

impl JobsConfig {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_seconds)
    }
}

/// Warm engine pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePoolConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Idle minutes before a ready engine is retired
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,
    #[serde(default = "default_startup_timeout_seconds")]
    pub startup_timeout_seconds: u64,
    /// Readiness deadline for a job on a warm engine
    #[serde(default = "default_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
    /// Jobs an engine serves before it is reset
    #[serde(default = "default_max_jobs_per_engine")]
    pub max_jobs_per_engine: u32,
    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,
    /// Engine image; falls back to the top-level image
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Docker-style memory limit, e.g. "4g"
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default)]
    pub recycle_strategy: RecycleStrategyKind,
}

fn default_max_pool_size() -> usize {
    3
}

fn default_ttl_minutes() -> u64 {
    120
}

fn default_startup_timeout_seconds() -> u64 {
    120
}

fn default_job_timeout_seconds() -> u64 {
    300
}

fn default_max_jobs_per_engine() -> u32 {
    10
}

fn default_health_check_interval_seconds() -> u64 {
    30
}

fn default_name_prefix() -> String {
    "worldgen-engine".to_string()
}

fn default_memory_limit() -> String {
    "4g".to_string()
}

impl Default for EnginePoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_pool_size: default_max_pool_size(),
            ttl_minutes: default_ttl_minutes(),
            startup_timeout_seconds: default_startup_timeout_seconds(),
            job_timeout_seconds: default_job_timeout_seconds(),
            max_jobs_per_engine: default_max_jobs_per_engine(),
            health_check_interval_seconds: default_health_check_interval_seconds(),
            image: None,
            name_prefix: default_name_prefix(),
            memory_limit: default_memory_limit(),
            recycle_strategy: RecycleStrategyKind::default(),
        }
    }
}

impl EnginePoolConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.ttl_minutes as i64)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds.max(1))
    }

    pub fn memory_limit_bytes(&self) -> Option<i64> {
        parse_memory_limit(&self.memory_limit)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Also write logs to this file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Complete worldgen configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root of per-seed output directories, as seen by this process
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Same directory as seen by the container runtime's host
    #[serde(default)]
    pub host_data_dir: Option<PathBuf>,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_server_password")]
    pub server_password: String,
    /// Owner applied to generated files
    #[serde(default)]
    pub host_uid: Option<u32>,
    #[serde(default)]
    pub host_gid: Option<u32>,
    /// Host directory with workload plugins, mounted read-only
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,
    #[serde(default = "default_required_plugins")]
    pub required_plugins: Vec<String>,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub pool: EnginePoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_image() -> String {
    "worldgen/valheim-bepinex:latest".to_string()
}

fn default_server_name() -> String {
    "WorldgenServer".to_string()
}

fn default_server_password() -> String {
    "worldgen".to_string()
}

fn default_required_plugins() -> Vec<String> {
    DEFAULT_REQUIRED_PLUGINS
        .iter()
        .map(|p| p.to_string())
        .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            host_data_dir: None,
            image: default_image(),
            server_name: default_server_name(),
            server_password: default_server_password(),
            host_uid: None,
            host_gid: None,
            plugins_dir: None,
            required_plugins: default_required_plugins(),
            readiness: ReadinessConfig::default(),
            jobs: JobsConfig::default(),
            pool: EnginePoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Settings {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse worldgen.toml")
    }

    /// Load from an explicit path, `WORLDGEN_CONFIG`, or `./worldgen.toml`,
    /// falling back to defaults when none exists. Environment overrides are
    /// applied on top.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut settings = match explicit {
            Some(path) => Self::load(path)?,
            None => match std::env::var(CONFIG_ENV) {
                Ok(path) => Self::load(Path::new(&path))?,
                Err(_) => Self::load_or_default(Path::new("."))?,
            },
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Load `worldgen.toml` from `dir`, or defaults if it doesn't exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(DEFAULT_CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `WORLDGEN_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WORLDGEN_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WORLDGEN_HOST_DATA_DIR") {
            self.host_data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("WORLDGEN_IMAGE") {
            self.image = v;
        }
        if let Some(v) = lookup("WORLDGEN_SERVER_NAME") {
            self.server_name = v;
        }
        if let Some(v) = lookup("WORLDGEN_SERVER_PASSWORD") {
            self.server_password = v;
        }
        if let Some(v) = lookup("WORLDGEN_HOST_UID") {
            self.host_uid = Some(parse_env("WORLDGEN_HOST_UID", &v)?);
        }
        if let Some(v) = lookup("WORLDGEN_HOST_GID") {
            self.host_gid = Some(parse_env("WORLDGEN_HOST_GID", &v)?);
        }
        if let Some(v) = lookup("WORLDGEN_PLUGINS_DIR") {
            self.plugins_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("WORLDGEN_TIMEOUT_SECONDS") {
            self.readiness.timeout_seconds = parse_env("WORLDGEN_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("WORLDGEN_STABLE_SECONDS") {
            self.readiness.stable_seconds = parse_env("WORLDGEN_STABLE_SECONDS", &v)?;
        }
        if let Some(v) = lookup("WORLDGEN_MAX_RETRIES") {
            self.jobs.max_retries = parse_env("WORLDGEN_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("WORLDGEN_STORE_PATH") {
            self.jobs.store_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("WORLDGEN_POOL_ENABLED") {
            self.pool.enabled = parse_bool(&v);
        }
        if let Some(v) = lookup("WORLDGEN_POOL_MAX_SIZE") {
            self.pool.max_pool_size = parse_env("WORLDGEN_POOL_MAX_SIZE", &v)?;
        }
        if let Some(v) = lookup("WORLDGEN_RECYCLE_STRATEGY") {
            self.pool.recycle_strategy = v.parse()?;
        }
        if let Some(v) = lookup("WORLDGEN_LOG_JSON") {
            self.logging.json = parse_bool(&v);
        }
        Ok(())
    }

    /// Host-side view of `data_dir` for bind mounts.
    pub fn host_data_dir(&self) -> PathBuf {
        self.host_data_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.clone())
    }

    pub fn engine_image(&self) -> &str {
        self.pool.image.as_deref().unwrap_or(&self.image)
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize settings")
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.image.trim().is_empty() {
            warnings.push("image must not be empty".to_string());
        }
        for pattern in &self.readiness.log_patterns {
            if let Err(e) = regex::RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
            {
                warnings.push(format!("Invalid readiness pattern '{}': {}", pattern, e));
            }
        }
        if self.readiness.log_patterns.is_empty() {
            warnings.push(
                "readiness.log_patterns is empty; readiness relies on file stability only"
                    .to_string(),
            );
        }
        if self.readiness.timeout_seconds == 0 {
            warnings.push("readiness.timeout_seconds must be greater than 0".to_string());
        }
        if self.readiness.stable_seconds >= self.readiness.timeout_seconds {
            warnings.push(format!(
                "readiness.stable_seconds ({}) is not below timeout_seconds ({})",
                self.readiness.stable_seconds, self.readiness.timeout_seconds
            ));
        }
        if self.jobs.worker_concurrency == 0 {
            warnings.push("jobs.worker_concurrency must be at least 1".to_string());
        }
        if self.jobs.max_retries == 0 {
            warnings.push("jobs.max_retries must be at least 1".to_string());
        }
        if self.pool.enabled {
            if self.pool.max_pool_size == 0 {
                warnings.push("pool.max_pool_size must be at least 1".to_string());
            }
            if self.pool.max_jobs_per_engine == 0 {
                warnings.push("pool.max_jobs_per_engine must be at least 1".to_string());
            }
        }
        if self.pool.memory_limit_bytes().is_none() {
            warnings.push(format!(
                "Invalid pool.memory_limit '{}': expected e.g. '4g' or '512m'",
                self.pool.memory_limit
            ));
        }
        if let Some(dir) = &self.plugins_dir
            && !dir.is_dir()
        {
            warnings.push(format!("plugins_dir {} does not exist", dir.display()));
        }

        warnings
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: '{}'", key, value))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parse a Docker-style memory size ("4g", "512m", "1024k", "2048") into bytes.
pub fn parse_memory_limit(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'k' => (&value[..value.len() - 1], 1024),
        'b' => (&value[..value.len() - 1], 1),
        c if c.is_ascii_digit() => (value.as_str(), 1),
        _ => return None,
    };
    let amount: i64 = digits.parse().ok()?;
    if amount <= 0 {
        return None;
    }
    amount.checked_mul(multiplier)
}
