//! Captured workload output for the per-attempt artifact log.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const LOG_FILE: &str = "worldgen_logs.txt";

const EXCERPT_LINES: usize = 40;

const NOISE_PATTERNS: &[&str] = &[
    "ERROR: Shader",
    "WARNING: Shader",
    "The shader",
    "The image effect",
    "DllNotFoundException: party",
    "PlayFab.Party",
    "SteamInternal_SetMinidumpSteamID",
    "[S_API FAIL]",
    "AsyncResourceUpload failed",
    "The referenced script on this Behaviour",
    "OnGUI function detected",
    "Unloading",
    "Total:",
    "UnloadTime:",
    "HDR Render Texture not supported",
    "Unable to load player prefs",
    "Failed to open plugin:",
    "DLL Not Found:",
];

/// Lines kept even if they also look like noise.
const KEEP_PATTERNS: &[&str] = &[
    "[VWE]",
    "VWE_",
    "BepInEx",
    "Game server connected",
    "Zonesystem",
    "Worldgenerator",
    "Console:",
    "World save",
    "Export",
    "worldgen:",
];

/// Workload output plus orchestrator notes, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct CapturedLog {
    lines: Vec<String>,
    workload_lines: u64,
}

impl CapturedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
        self.workload_lines += 1;
    }

    /// Orchestrator-side event, prefixed so it survives filtering.
    pub fn note(&mut self, message: impl AsRef<str>) {
        self.lines.push(format!("worldgen: {}", message.as_ref()));
    }

    pub fn lines_written(&self) -> u64 {
        self.workload_lines
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Last lines of filtered output, for error reports.
    pub fn excerpt(&self) -> Option<String> {
        let kept: Vec<&str> = self
            .lines
            .iter()
            .map(String::as_str)
            .filter(|l| keep_line(l))
            .collect();
        if kept.is_empty() {
            return None;
        }
        let start = kept.len().saturating_sub(EXCERPT_LINES);
        Some(kept[start..].join("\n"))
    }

    /// Write noise-filtered output to `<dir>/worldgen_logs.txt`.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(LOG_FILE);
        let text = filter_noise(self.lines.iter().map(String::as_str));
        std::fs::write(&path, text)
            .with_context(|| format!("Failed to write log file: {}", path.display()))?;
        Ok(path)
    }
}

fn keep_line(line: &str) -> bool {
    if KEEP_PATTERNS.iter().any(|k| line.contains(k)) {
        return true;
    }
    !line.trim().is_empty() && !NOISE_PATTERNS.iter().any(|n| line.contains(n))
}

/// Drop blank lines and known engine noise; workload-relevant lines always stay.
pub fn filter_noise<'a>(lines: impl IntoIterator<Item = &'a str>) -> String {
    lines
        .into_iter()
        .filter(|l| keep_line(l))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_filter_drops_noise_keeps_relevant() {
        let text = filter_noise([
            "WARNING: Shader Unsupported: 'Hidden/Blit'",
            "[S_API FAIL] SteamAPI_Init() failed",
            "",
            "Zonesystem Start 1234",
            "[VWE] The shader cache warmed",
            "Loading world",
        ]);
        assert_eq!(
            text,
            "Zonesystem Start 1234\n[VWE] The shader cache warmed\nLoading world"
        );
    }

    #[test]
    fn test_notes_do_not_count_as_lines_written() {
        let mut log = CapturedLog::new();
        log.push_line("a");
        log.note("graceful shutdown requested");
        log.push_line("b");
        assert_eq!(log.lines_written(), 2);
        assert_eq!(log.lines().len(), 3);
        assert_eq!(log.lines()[1], "worldgen: graceful shutdown requested");
    }

    #[test]
    fn test_excerpt_is_tail_of_filtered_output() {
        let mut log = CapturedLog::new();
        for i in 0..100 {
            log.push_line(format!("line {i}"));
            log.push_line("ERROR: Shader broken");
        }
        let excerpt = log.excerpt().unwrap();
        assert_eq!(excerpt.lines().count(), EXCERPT_LINES);
        assert!(excerpt.ends_with("line 99"));
        assert!(!excerpt.contains("Shader"));
        assert!(CapturedLog::new().excerpt().is_none());
    }

    #[test]
    fn test_persist_writes_filtered_file() {
        let dir = tempdir().unwrap();
        let mut log = CapturedLog::new();
        log.push_line("The image effect Foo is not supported");
        log.push_line("Game server connected");
        let path = log.persist(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(LOG_FILE));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "Game server connected");
    }
}
