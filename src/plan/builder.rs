use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use worldgen_common::{ExpectedOutputs, LaunchPlan, ReadinessSpec, VolumeMount};

use super::{
    CONFIG_MOUNT, LABEL_SEED_HASH, LABEL_TYPE, PLUGINS_MOUNT, SeedDirectories, TYPE_COLD,
    WORLD_DATA_MOUNT,
};
use crate::config::Settings;

const MAX_SEED_CHARS: usize = 256;
const DEFAULT_OWNER_ID: u32 = 1000;

/// Asks the game server to save before it exits.
const SAVE_ON_SHUTDOWN_HOOK: &str = "echo 'save' | nc -U /tmp/valheim-console 2>/dev/null || supervisorctl signal USR1 valheim-server || true";

/// Stable identifier for a seed: SHA-256 hex of the trimmed seed, capped at 256 chars.
pub fn seed_hash(seed: &str) -> String {
    let normalized: String = seed.trim().chars().take(MAX_SEED_CHARS).collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Inputs the builder needs, lifted out of [`Settings`].
#[derive(Debug, Clone)]
pub struct PlanBuilderConfig {
    pub image: String,
    pub server_name: String,
    pub server_password: String,
    pub host_uid: Option<u32>,
    pub host_gid: Option<u32>,
    pub plugins_dir: Option<std::path::PathBuf>,
    pub log_patterns: Vec<String>,
    pub stable_seconds: u64,
    pub timeout_seconds: u64,
}

impl From<&Settings> for PlanBuilderConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            image: settings.image.clone(),
            server_name: settings.server_name.clone(),
            server_password: settings.server_password.clone(),
            host_uid: settings.host_uid,
            host_gid: settings.host_gid,
            plugins_dir: settings.plugins_dir.clone(),
            log_patterns: settings.readiness.log_patterns.clone(),
            stable_seconds: settings.readiness.stable_seconds,
            timeout_seconds: settings.readiness.timeout_seconds,
        }
    }
}

/// Builds deterministic launch plans.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    config: PlanBuilderConfig,
}

impl PlanBuilder {
    pub fn new(config: PlanBuilderConfig) -> Self {
        Self { config }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(PlanBuilderConfig::from(settings))
    }

    /// Override the readiness deadline (warm-pool jobs use a shorter one).
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.config.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    /// Same inputs always produce the same plan.
    pub fn build(&self, seed: &str, seed_hash: &str, dirs: &SeedDirectories) -> LaunchPlan {
        let cfg = &self.config;
        let seed = seed.trim();

        let mut env = BTreeMap::new();
        env.insert("WORLD_NAME".to_string(), seed.to_string());
        env.insert("WORLD_SEED".to_string(), seed.to_string());
        env.insert("SERVER_NAME".to_string(), cfg.server_name.clone());
        env.insert("SERVER_PASS".to_string(), cfg.server_password.clone());
        env.insert("SERVER_PUBLIC".to_string(), "0".to_string());
        env.insert("TZ".to_string(), "UTC".to_string());
        env.insert("UPDATE_ON_START".to_string(), "1".to_string());
        env.insert("BEPINEX".to_string(), "1".to_string());
        env.insert(
            "PUID".to_string(),
            cfg.host_uid.unwrap_or(DEFAULT_OWNER_ID).to_string(),
        );
        env.insert(
            "PGID".to_string(),
            cfg.host_gid.unwrap_or(DEFAULT_OWNER_ID).to_string(),
        );
        env.insert("VWE_SEED_HASH".to_string(), seed_hash.to_string());
        env.insert("VWE_DATAEXPORT_ENABLED".to_string(), "true".to_string());
        env.insert("VWE_DATAEXPORT_FORMAT".to_string(), "both".to_string());
        env.insert(
            "VWE_DATAEXPORT_DIR".to_string(),
            WORLD_DATA_MOUNT.to_string(),
        );
        env.insert("VWE_AUTOSAVE_ENABLED".to_string(), "true".to_string());
        env.insert("VWE_AUTOSAVE_DELAY".to_string(), "2".to_string());
        env.insert(
            "PRE_SERVER_SHUTDOWN_HOOK".to_string(),
            SAVE_ON_SHUTDOWN_HOOK.to_string(),
        );

        let mut volumes = vec![
            VolumeMount::read_write(&dirs.host_root, CONFIG_MOUNT),
            VolumeMount::read_write(dirs.host_extracted(), WORLD_DATA_MOUNT),
        ];
        if let Some(plugins) = &cfg.plugins_dir {
            volumes.push(VolumeMount::read_only(plugins, PLUGINS_MOUNT));
        }

        let labels = BTreeMap::from([
            (LABEL_TYPE.to_string(), TYPE_COLD.to_string()),
            (LABEL_SEED_HASH.to_string(), seed_hash.to_string()),
        ]);

        let expected_outputs = ExpectedOutputs {
            primary: vec![
                dirs.worlds_local.join(format!("{seed}.db")),
                dirs.worlds_local.join(format!("{seed}.fwl")),
            ],
            secondary: vec![
                dirs.extracted.join("biomes.json"),
                dirs.extracted.join("heightmap.npy"),
            ],
        };

        LaunchPlan {
            seed: seed.to_string(),
            seed_hash: seed_hash.to_string(),
            unit_name: unit_base_name(seed_hash),
            image: cfg.image.clone(),
            env,
            volumes,
            labels,
            readiness: ReadinessSpec {
                log_patterns: cfg.log_patterns.clone(),
                stable_seconds: cfg.stable_seconds,
                timeout_seconds: cfg.timeout_seconds,
            },
            expected_outputs,
        }
    }
}

/// `worldgen-<first 12 hex chars>`.
pub fn unit_base_name(seed_hash: &str) -> String {
    let short: String = seed_hash.chars().take(12).collect();
    format!("worldgen-{short}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn builder() -> PlanBuilder {
        PlanBuilder::from_settings(&Settings::default())
    }

    fn dirs(hash: &str) -> SeedDirectories {
        SeedDirectories::new(Path::new("/data"), Path::new("/host/data"), hash)
    }

    #[test]
    fn test_seed_hash_is_sha256_hex() {
        // sha256("abc")
        assert_eq!(
            seed_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_seed_hash_trims_and_truncates() {
        assert_eq!(seed_hash("  abc \n"), seed_hash("abc"));
        let long = "x".repeat(300);
        assert_eq!(seed_hash(&long), seed_hash(&"x".repeat(256)));
        assert_ne!(seed_hash(&"x".repeat(255)), seed_hash(&"x".repeat(256)));
    }

    #[test]
    fn test_build_is_deterministic() {
        let hash = seed_hash("TestSeed123");
        let a = builder().build("TestSeed123", &hash, &dirs(&hash));
        let b = builder().build("TestSeed123", &hash, &dirs(&hash));
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_build_env_and_outputs() {
        let hash = seed_hash("TestSeed123");
        let plan = builder().build("TestSeed123", &hash, &dirs(&hash));

        assert_eq!(plan.env["WORLD_NAME"], "TestSeed123");
        assert_eq!(plan.env["WORLD_SEED"], "TestSeed123");
        assert_eq!(plan.env["VWE_SEED_HASH"], hash);
        assert_eq!(plan.env["PUID"], "1000");
        assert!(plan.env.contains_key("PRE_SERVER_SHUTDOWN_HOOK"));

        let root = PathBuf::from("/data/seeds").join(&hash);
        assert_eq!(
            plan.expected_outputs.primary,
            vec![
                root.join("worlds_local/TestSeed123.db"),
                root.join("worlds_local/TestSeed123.fwl"),
            ]
        );
        assert_eq!(
            plan.expected_outputs.secondary,
            vec![
                root.join("extracted/biomes.json"),
                root.join("extracted/heightmap.npy"),
            ]
        );
    }

    #[test]
    fn test_volumes_use_host_paths() {
        let hash = seed_hash("s");
        let plan = builder().build("s", &hash, &dirs(&hash));
        assert_eq!(
            plan.volumes[0].host_path,
            PathBuf::from("/host/data/seeds").join(&hash)
        );
        assert_eq!(plan.volumes[0].container_path, CONFIG_MOUNT);
        assert_eq!(plan.volumes[1].container_path, WORLD_DATA_MOUNT);
        assert_eq!(plan.volumes.len(), 2);
    }

    #[test]
    fn test_plugins_mounted_read_only() {
        let mut settings = Settings::default();
        settings.plugins_dir = Some(PathBuf::from("/opt/plugins"));
        let hash = seed_hash("s");
        let plan = PlanBuilder::from_settings(&settings).build("s", &hash, &dirs(&hash));
        let plugins = plan.volumes.last().unwrap();
        assert_eq!(plugins.bind_spec(), "/opt/plugins:/config/bepinex/plugins:ro");
    }

    #[test]
    fn test_unit_name_and_labels() {
        let hash = seed_hash("TestSeed123");
        let plan = builder().build("TestSeed123", &hash, &dirs(&hash));
        assert_eq!(plan.unit_name, format!("worldgen-{}", &hash[..12]));
        assert_eq!(plan.labels[LABEL_SEED_HASH], hash);
        assert_eq!(plan.labels[LABEL_TYPE], TYPE_COLD);
    }

    #[test]
    fn test_with_timeout_overrides_readiness() {
        let hash = seed_hash("s");
        let plan = builder().with_timeout(300).build("s", &hash, &dirs(&hash));
        assert_eq!(plan.readiness.timeout_seconds, 300);
        assert_eq!(plan.readiness.stable_seconds, 10);
        assert_eq!(plan.readiness.log_patterns.len(), 5);
    }
}
