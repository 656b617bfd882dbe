use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use worldgen_common::LaunchPlan;

pub const PLAN_FILE: &str = "worldgen_plan.json";

/// Per-seed directory tree under `<data_dir>/seeds/<hash>`.
///
/// Every path exists twice: once as this process sees it (`root`, `raw`, ...)
/// and once as the container runtime's host sees it (`host_root`, ...), for
/// deployments where the orchestrator itself runs in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedDirectories {
    pub seed_hash: String,
    pub root: PathBuf,
    pub raw: PathBuf,
    pub extracted: PathBuf,
    pub processed: PathBuf,
    pub renders: PathBuf,
    pub worlds_local: PathBuf,
    pub host_root: PathBuf,
}

impl SeedDirectories {
    pub fn new(data_dir: &Path, host_data_dir: &Path, seed_hash: &str) -> Self {
        let root = data_dir.join("seeds").join(seed_hash);
        Self {
            seed_hash: seed_hash.to_string(),
            raw: root.join("raw"),
            extracted: root.join("extracted"),
            processed: root.join("processed"),
            renders: root.join("renders"),
            worlds_local: root.join("worlds_local"),
            host_root: host_data_dir.join("seeds").join(seed_hash),
            root,
        }
    }

    pub fn host_extracted(&self) -> PathBuf {
        self.host_root.join("extracted")
    }

    /// Create every directory in the tree.
    pub fn create(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.raw,
            &self.extracted,
            &self.processed,
            &self.renders,
            &self.worlds_local,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Write the plan as pretty JSON into `dir` for post-mortem inspection.
pub fn persist_plan(plan: &LaunchPlan, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(PLAN_FILE);
    let json = serde_json::to_string_pretty(plan).context("Failed to serialize launch plan")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
    Ok(path)
}
