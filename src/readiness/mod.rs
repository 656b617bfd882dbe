//! Readiness detection for generation workloads.
//!
//! A workload is ready when a configured log pattern appears or when every
//! primary artifact exists with an mtime unchanged for the stability window,
//! whichever comes first before the deadline.

pub mod capture;
pub mod detector;
pub mod patterns;
pub mod stability;

pub use capture::{CapturedLog, LOG_FILE, filter_noise};
pub use detector::{
    Detection, DetectorEvent, DetectorMode, DetectorState, ReadinessDetector, ReadySignal,
    StopReason,
};
pub use patterns::{ProgressTracker, ReadinessMatcher};
pub use stability::{StabilityTracker, files_stable, resolve_present};
