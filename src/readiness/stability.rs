//! Artifact presence and mtime stability.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Suffix the workload uses for its previous save.
pub const BACKUP_SUFFIX: &str = ".old";

pub fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(BACKUP_SUFFIX);
    PathBuf::from(os)
}

/// The file satisfying `path`: itself if present, else its `.old` backup.
pub fn resolve_present(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let backup = backup_path(path);
    backup.is_file().then_some(backup)
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Newest mtime across `paths`, or `None` if any is unresolved.
pub fn newest_mtime(paths: &[PathBuf]) -> Option<SystemTime> {
    let mut newest: Option<SystemTime> = None;
    for path in paths {
        let resolved = resolve_present(path)?;
        let mtime = modified(&resolved)?;
        newest = Some(newest.map_or(mtime, |n| n.max(mtime)));
    }
    newest
}

/// True when every path resolves and none changed within `window` of `now`.
pub fn files_stable(paths: &[PathBuf], window: Duration, now: SystemTime) -> bool {
    if paths.is_empty() {
        return false;
    }
    match newest_mtime(paths) {
        // A future mtime (clock skew) counts as just written.
        Some(newest) => now
            .duration_since(newest)
            .is_ok_and(|age| age >= window),
        None => false,
    }
}

/// Tracks stability across polls; any newer write restarts the window from
/// that write's mtime.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    paths: Vec<PathBuf>,
    window: Duration,
    last_newest: Option<SystemTime>,
}

impl StabilityTracker {
    pub fn new(paths: Vec<PathBuf>, window: Duration) -> Self {
        Self {
            paths,
            window,
            last_newest: None,
        }
    }

    pub fn poll(&mut self, now: SystemTime) -> bool {
        let Some(newest) = newest_mtime(&self.paths) else {
            self.last_newest = None;
            return false;
        };
        if self.last_newest.is_some_and(|prev| newest > prev) {
            tracing::debug!("artifact rewritten, stability window restarted");
        }
        self.last_newest = Some(newest);
        now.duration_since(newest)
            .is_ok_and(|age| age >= self.window)
    }

    pub fn all_present(&self) -> bool {
        self.paths.iter().all(|p| resolve_present(p).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};
    use tempfile::tempdir;

    fn touch(path: &Path, mtime: SystemTime) {
        std::fs::write(path, b"x").unwrap();
        let file = File::options().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_modified(mtime)).unwrap();
    }

    #[test]
    fn test_backup_path_appends_suffix() {
        assert_eq!(
            backup_path(Path::new("/w/seed.db")),
            PathBuf::from("/w/seed.db.old")
        );
    }

    #[test]
    fn test_resolve_prefers_primary() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("seed.db");
        let old = dir.path().join("seed.db.old");
        std::fs::write(&old, b"old").unwrap();
        assert_eq!(resolve_present(&db), Some(old.clone()));
        std::fs::write(&db, b"new").unwrap();
        assert_eq!(resolve_present(&db), Some(db));
    }

    #[test]
    fn test_missing_file_is_not_stable() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("a.fwl");
        let now = SystemTime::now();
        touch(&a, now - Duration::from_secs(60));
        assert!(!files_stable(&[a, b], Duration::from_secs(10), now));
    }

    #[test]
    fn test_stable_after_window() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let b = dir.path().join("a.fwl");
        let written = SystemTime::now() - Duration::from_secs(100);
        touch(&a, written);
        touch(&b, written + Duration::from_secs(2));
        let paths = vec![a, b];
        assert!(!files_stable(&paths, Duration::from_secs(10), written + Duration::from_secs(11)));
        assert!(files_stable(&paths, Duration::from_secs(10), written + Duration::from_secs(12)));
    }

    #[test]
    fn test_backup_satisfies_stability() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let now = SystemTime::now();
        touch(&backup_path(&a), now - Duration::from_secs(30));
        assert!(files_stable(&[a], Duration::from_secs(10), now));
    }

    #[test]
    fn test_empty_set_is_never_stable() {
        assert!(!files_stable(&[], Duration::ZERO, SystemTime::now()));
    }

    #[test]
    fn test_tracker_rearms_on_new_write() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let base = SystemTime::now() - Duration::from_secs(1000);
        touch(&a, base);
        let mut tracker = StabilityTracker::new(vec![a.clone()], Duration::from_secs(10));
        assert!(tracker.poll(base + Duration::from_secs(20)));

        // Rewritten: the window restarts from the new mtime.
        touch(&a, base + Duration::from_secs(15));
        assert!(!tracker.poll(base + Duration::from_secs(20)));
        assert!(tracker.poll(base + Duration::from_secs(25)));
    }

    #[test]
    fn test_tracker_settles_on_first_poll_after_quiet_rewrite() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.db");
        let base = SystemTime::now() - Duration::from_secs(1000);
        touch(&a, base);
        let mut tracker = StabilityTracker::new(vec![a.clone()], Duration::from_secs(10));
        assert!(!tracker.poll(base + Duration::from_secs(5)));

        // Rewritten, then quiet for longer than the window before the next poll.
        touch(&a, base + Duration::from_secs(6));
        assert!(tracker.poll(base + Duration::from_secs(30)));
    }
}
