//! Readiness state machine over a log stream and a set of artifact paths.
//!
//! ```text
//! WAITING ──log match / files stable──▶ READY
//!    │ ──deadline────────────────────▶ TIMED_OUT
//!    └ ──critical line───────────────▶ CRITICAL_ERROR
//! ```
//!
//! The verdict never leaves a terminal state. In generation mode the watch
//! keeps running after READY until the artifacts settle, a completion hint
//! arrives, the stream ends or the deadline passes, so callers can collect
//! outputs that land after the first readiness signal.

use std::path::PathBuf;
use std::pin::pin;
use std::time::{Duration, SystemTime};

use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use worldgen_common::ReadinessSpec;

use super::capture::CapturedLog;
use super::patterns::{
    PROGRESS_FILES_STABLE, ProgressTracker, ReadinessMatcher, critical_error, is_completion_hint,
    progress_hint,
};
use super::stability::StabilityTracker;
use crate::errors::GenerationError;
use crate::runtime::LogStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Waiting,
    Ready,
    TimedOut,
    CriticalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMode {
    /// Watch a generation run through to settled artifacts.
    Generation,
    /// Return as soon as the unit reports ready; completion hints are ignored.
    Startup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySignal {
    LogMatch { pattern: String },
    FilesStable,
}

/// Emitted while watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorEvent {
    Ready { via: ReadySignal, elapsed: Duration },
    Progress(u8),
    CompletionHint,
}

/// Why the watch returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Ready and every watched artifact is stable.
    FilesStable,
    /// Ready by log match in startup mode.
    Ready,
    CompletionHint,
    /// Deadline passed before any readiness signal.
    TimedOut,
    /// Deadline passed after readiness but before artifacts settled.
    DeadlineAfterReady,
    CriticalError { pattern: String, line: String },
    StreamClosed,
    StreamFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub reason: StopReason,
    pub state: DetectorState,
    pub log_match: bool,
    pub files_stable: bool,
    pub ready_after: Option<Duration>,
    pub elapsed: Duration,
    pub progress: u8,
}

impl Detection {
    pub fn is_ready(&self) -> bool {
        self.state == DetectorState::Ready
    }
}

pub struct ReadinessDetector {
    matcher: ReadinessMatcher,
    stability: StabilityTracker,
    progress: ProgressTracker,
    timeout: Duration,
    poll_interval: Duration,
    mode: DetectorMode,
    state: DetectorState,
    log_match: bool,
    files_stable: bool,
    ready_after: Option<Duration>,
}

impl ReadinessDetector {
    /// Watch `artifacts` (primary outputs) against `spec`.
    pub fn new(
        spec: &ReadinessSpec,
        artifacts: Vec<PathBuf>,
        poll_interval: Duration,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            matcher: ReadinessMatcher::new(&spec.log_patterns)?,
            stability: StabilityTracker::new(artifacts, Duration::from_secs(spec.stable_seconds)),
            progress: ProgressTracker::new(),
            timeout: Duration::from_secs(spec.timeout_seconds),
            poll_interval,
            mode: DetectorMode::Generation,
            state: DetectorState::Waiting,
            log_match: false,
            files_stable: false,
            ready_after: None,
        })
    }

    /// Log-only detector that returns on the first readiness line.
    pub fn startup(patterns: &[String], timeout: Duration) -> Result<Self, GenerationError> {
        let spec = ReadinessSpec {
            log_patterns: patterns.to_vec(),
            stable_seconds: 0,
            timeout_seconds: 0,
        };
        let mut detector = Self::new(&spec, Vec::new(), Duration::from_secs(1))?;
        detector.timeout = timeout;
        detector.mode = DetectorMode::Startup;
        Ok(detector)
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    /// Consume `lines` until a stop condition, recording every line in `log`.
    pub async fn watch<F>(
        &mut self,
        lines: &mut LogStream,
        log: &mut CapturedLog,
        mut on_event: F,
    ) -> Detection
    where
        F: FnMut(DetectorEvent),
    {
        let started = Instant::now();
        let mut deadline = pin!(sleep_until(started + self.timeout));
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut deadline => {
                    break if self.state == DetectorState::Waiting {
                        self.state = DetectorState::TimedOut;
                        log.note(format!("readiness timed out after {}s", self.timeout.as_secs()));
                        StopReason::TimedOut
                    } else {
                        log.note("deadline reached before artifacts settled");
                        StopReason::DeadlineAfterReady
                    };
                }
                item = lines.recv() => match item {
                    Some(Ok(line)) => {
                        if let Some(reason) = self.on_line(line, log, started, &mut on_event) {
                            break reason;
                        }
                    }
                    Some(Err(e)) => {
                        log.note(format!("log stream failed: {e}"));
                        break StopReason::StreamFailed { message: e.to_string() };
                    }
                    None => {
                        log.note("log stream closed");
                        break StopReason::StreamClosed;
                    }
                },
                _ = ticker.tick(), if self.mode == DetectorMode::Generation => {
                    if self.stability.poll(SystemTime::now()) {
                        self.files_stable = true;
                        self.declare_ready(ReadySignal::FilesStable, started, log, &mut on_event);
                        if let Some(p) = self.progress.observe(PROGRESS_FILES_STABLE) {
                            on_event(DetectorEvent::Progress(p));
                        }
                        break StopReason::FilesStable;
                    }
                }
            }
        };

        Detection {
            reason,
            state: self.state,
            log_match: self.log_match,
            files_stable: self.files_stable,
            ready_after: self.ready_after,
            elapsed: started.elapsed(),
            progress: self.progress.current(),
        }
    }

    fn on_line<F>(
        &mut self,
        line: String,
        log: &mut CapturedLog,
        started: Instant,
        on_event: &mut F,
    ) -> Option<StopReason>
    where
        F: FnMut(DetectorEvent),
    {
        if let Some(pattern) = critical_error(&line) {
            if self.state == DetectorState::Waiting {
                self.state = DetectorState::CriticalError;
            }
            log.push_line(line.clone());
            log.note(format!("critical error detected: {pattern}"));
            return Some(StopReason::CriticalError {
                pattern: pattern.to_string(),
                line,
            });
        }

        if !self.log_match
            && let Some(pattern) = self.matcher.first_match(&line).map(str::to_string)
        {
            self.log_match = true;
            self.declare_ready(ReadySignal::LogMatch { pattern }, started, log, on_event);
        }

        if let Some(hint) = progress_hint(&line)
            && let Some(p) = self.progress.observe(hint)
        {
            on_event(DetectorEvent::Progress(p));
        }

        let completion = self.mode == DetectorMode::Generation && is_completion_hint(&line);
        log.push_line(line);

        if self.mode == DetectorMode::Startup && self.state == DetectorState::Ready {
            return Some(StopReason::Ready);
        }
        if completion {
            log.note("generation completion hint observed");
            on_event(DetectorEvent::CompletionHint);
            return Some(StopReason::CompletionHint);
        }
        None
    }

    fn declare_ready<F>(
        &mut self,
        via: ReadySignal,
        started: Instant,
        log: &mut CapturedLog,
        on_event: &mut F,
    ) where
        F: FnMut(DetectorEvent),
    {
        if self.state != DetectorState::Waiting {
            return;
        }
        let elapsed = started.elapsed();
        self.state = DetectorState::Ready;
        self.ready_after = Some(elapsed);
        log.note(format!("ready after {:.1}s via {:?}", elapsed.as_secs_f64(), via));
        tracing::info!(elapsed_secs = elapsed.as_secs_f64(), signal = ?via, "workload ready");
        on_event(DetectorEvent::Ready { via, elapsed });
    }
}
