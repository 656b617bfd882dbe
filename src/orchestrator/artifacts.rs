//! Artifact validation and ownership repair.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use worldgen_common::ExpectedOutputs;

use crate::readiness::stability::resolve_present;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactReport {
    /// Expected path -> satisfied (primary outputs accept their `.old` backup).
    pub files_found: BTreeMap<PathBuf, bool>,
    pub primary_present: bool,
    pub secondary_present: bool,
    pub missing: Vec<PathBuf>,
}

impl ArtifactReport {
    pub fn all_present(&self) -> bool {
        self.primary_present && self.secondary_present
    }
}

pub fn validate_outputs(outputs: &ExpectedOutputs) -> ArtifactReport {
    let mut report = ArtifactReport {
        primary_present: true,
        secondary_present: true,
        ..Default::default()
    };
    for path in &outputs.primary {
        let found = resolve_present(path).is_some();
        report.primary_present &= found;
        record(&mut report, path, found);
    }
    for path in &outputs.secondary {
        let found = path.is_file();
        report.secondary_present &= found;
        record(&mut report, path, found);
    }
    report
}

fn record(report: &mut ArtifactReport, path: &Path, found: bool) {
    report.files_found.insert(path.to_path_buf(), found);
    if !found {
        report.missing.push(path.to_path_buf());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnershipReport {
    pub changed: usize,
    pub failed: usize,
}

/// Chown everything under `root` (directories, then files, then `root`
/// itself). Failures are counted and skipped.
pub fn fix_ownership(root: &Path, uid: u32, gid: u32) -> OwnershipReport {
    let mut report = OwnershipReport::default();
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    for entry in WalkDir::new(root).min_depth(1) {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => dirs.push(entry.into_path()),
            Ok(entry) => files.push(entry.into_path()),
            Err(e) => {
                tracing::debug!(root = %root.display(), error = %e, "walk failed");
                report.failed += 1;
            }
        }
    }

    for path in dirs.iter().chain(files.iter()).map(PathBuf::as_path).chain([root]) {
        match std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
            Ok(()) => report.changed += 1,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "chown failed");
                report.failed += 1;
            }
        }
    }
    report
}
