//! Line classification for workload output.
//!
//! Recognises:
//! - readiness patterns (configurable, case-insensitive, first match wins)
//! - critical error substrings that abort an attempt
//! - completion hints that justify an early graceful shutdown
//! - progress percentages and install-stage markers

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::errors::GenerationError;

pub const DEFAULT_READINESS_PATTERNS: &[&str] = &[
    "Game server connected",
    "Zonesystem Start",
    "Export complete",
    "Saving world",
    "World saved",
];

/// Substrings that mean the workload cannot recover. Matched case-insensitively.
pub const CRITICAL_ERROR_PATTERNS: &[&str] = &[
    "FATAL ERROR",
    "CRITICAL ERROR",
    "Failed to start",
    "Permission denied",
    "Bind: address already in use",
    "Cannot assign requested address",
    "SteamCMD failed",
    "Valheim server failed",
    "BepInEx failed",
];

/// World generation has finished even if no readiness pattern fired.
pub const COMPLETION_HINTS: &[&str] = &["Failed to place all", "Generated", "ALL EXPORTS COMPLETE"];

/// Percentages are clamped into this band; the ends are reserved for
/// stage markers and artifact stability.
pub const PROGRESS_FLOOR: u8 = 5;
pub const PROGRESS_CEILING: u8 = 90;
pub const PROGRESS_VALIDATING: u8 = 75;
pub const PROGRESS_INSTALLED: u8 = 90;
pub const PROGRESS_FILES_STABLE: u8 = 95;

static PERCENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%").unwrap());

static INSTALLED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Success! App .*installed").unwrap());

static CRITICAL_LOWER: LazyLock<Vec<(String, &'static str)>> = LazyLock::new(|| {
    CRITICAL_ERROR_PATTERNS
        .iter()
        .map(|p| (p.to_lowercase(), *p))
        .collect()
});

/// Compiled readiness patterns.
#[derive(Debug, Clone)]
pub struct ReadinessMatcher {
    patterns: Vec<Regex>,
}

impl ReadinessMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, GenerationError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p.as_ref())
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        GenerationError::Configuration(format!(
                            "invalid readiness pattern '{}': {}",
                            p.as_ref(),
                            e
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Source of the first pattern matching `line`.
    pub fn first_match(&self, line: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|re| re.is_match(line))
            .map(|re| re.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// The critical pattern found in `line`, if any.
pub fn critical_error(line: &str) -> Option<&'static str> {
    let lower = line.to_lowercase();
    CRITICAL_LOWER
        .iter()
        .find(|(needle, _)| lower.contains(needle.as_str()))
        .map(|(_, original)| *original)
}

pub fn is_completion_hint(line: &str) -> bool {
    COMPLETION_HINTS.iter().any(|hint| line.contains(hint))
}

/// Progress suggested by a single line, before monotonic filtering.
pub fn progress_hint(line: &str) -> Option<u8> {
    if INSTALLED_REGEX.is_match(line) {
        return Some(PROGRESS_INSTALLED);
    }
    if line.to_ascii_lowercase().contains("validating") {
        return Some(PROGRESS_VALIDATING);
    }
    PERCENT_REGEX
        .captures(line)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .map(|pct| pct.clamp(PROGRESS_FLOOR as u16, PROGRESS_CEILING as u16) as u8)
}

/// Keeps reported progress from ever going backwards.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    current: u8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new value when `candidate` raises progress.
    pub fn observe(&mut self, candidate: u8) -> Option<u8> {
        let candidate = candidate.min(100);
        if candidate > self.current {
            self.current = candidate;
            Some(candidate)
        } else {
            None
        }
    }

    pub fn current(&self) -> u8 {
        self.current
    }
}
