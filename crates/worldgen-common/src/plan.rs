use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    /// Path as seen by the container runtime's host.
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
}

impl VolumeMount {
    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode: MountMode::ReadWrite,
        }
    }

    pub fn read_only(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode: MountMode::ReadOnly,
        }
    }

    /// `host:container:mode` bind string.
    pub fn bind_spec(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode.as_str()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadinessSpec {
    /// Case-insensitive patterns, checked in order; first match wins.
    pub log_patterns: Vec<String>,
    pub stable_seconds: u64,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpectedOutputs {
    /// Required; each may also be satisfied by its `.old` backup.
    pub primary: Vec<PathBuf>,
    pub secondary: Vec<PathBuf>,
}

impl ExpectedOutputs {
    pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
        self.primary.iter().chain(self.secondary.iter())
    }
}

/// Everything needed to start one world-generation workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchPlan {
    pub seed: String,
    pub seed_hash: String,
    /// Base compute-unit name; a unique suffix is appended per launch.
    pub unit_name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub labels: BTreeMap<String, String>,
    pub readiness: ReadinessSpec,
    pub expected_outputs: ExpectedOutputs,
}

impl LaunchPlan {
    pub fn env_pairs(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn binds(&self) -> Vec<String> {
        self.volumes.iter().map(VolumeMount::bind_spec).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_spec_formats_mode() {
        let rw = VolumeMount::read_write("/data/seeds/abc", "/config");
        assert_eq!(rw.bind_spec(), "/data/seeds/abc:/config:rw");
        let ro = VolumeMount::read_only("/plugins", "/config/bepinex/plugins");
        assert_eq!(ro.bind_spec(), "/plugins:/config/bepinex/plugins:ro");
    }

    #[test]
    fn test_expected_outputs_all_chains_primary_first() {
        let outputs = ExpectedOutputs {
            primary: vec![PathBuf::from("a.db")],
            secondary: vec![PathBuf::from("b.json")],
        };
        let all: Vec<_> = outputs.all().collect();
        assert_eq!(all, vec![&PathBuf::from("a.db"), &PathBuf::from("b.json")]);
    }

    #[test]
    fn test_env_pairs_sorted_by_key() {
        let plan = LaunchPlan {
            seed: "s".into(),
            seed_hash: "h".into(),
            unit_name: "u".into(),
            image: "img".into(),
            env: BTreeMap::from([
                ("WORLD_SEED".to_string(), "s".to_string()),
                ("A".to_string(), "1".to_string()),
            ]),
            volumes: vec![],
            labels: BTreeMap::new(),
            readiness: ReadinessSpec {
                log_patterns: vec![],
                stable_seconds: 10,
                timeout_seconds: 900,
            },
            expected_outputs: ExpectedOutputs::default(),
        };
        assert_eq!(plan.env_pairs(), vec!["A=1", "WORLD_SEED=s"]);
    }
}
