//! In-memory [`ComputeRuntime`] that replays a timed script per unit.
//!
//! Each started unit takes the next queued [`UnitScript`] (or the default
//! one). Log lines, file writes, stream errors and self-exit happen at fixed
//! offsets from the unit's start, measured on the tokio clock so tests can
//! run with paused time.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};

use super::{ComputeRuntime, DiscoveredUnit, LogCursor, LogStream, UnitHandle, UnitSpec, UnitStatus};
use crate::errors::RuntimeError;

/// Timed behaviour of one unit.
#[derive(Debug, Clone, Default)]
pub struct UnitScript {
    lines: Vec<(Duration, String)>,
    files: Vec<(Duration, PathBuf, Vec<u8>)>,
    files_on_stop: Vec<(PathBuf, Vec<u8>)>,
    exit_after: Option<Duration>,
    exit_code: i64,
    stream_error_after: Option<Duration>,
}

impl UnitScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(mut self, at: Duration, text: impl Into<String>) -> Self {
        self.lines.push((at, text.into()));
        self
    }

    pub fn file(mut self, at: Duration, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((at, path.into(), contents.into()));
        self
    }

    /// Written when the unit is stopped gracefully, like a save-on-shutdown hook.
    pub fn file_on_stop(mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.files_on_stop.push((path.into(), contents.into()));
        self
    }

    pub fn exit_after(mut self, at: Duration, exit_code: i64) -> Self {
        self.exit_after = Some(at);
        self.exit_code = exit_code;
        self
    }

    pub fn stream_error_after(mut self, at: Duration) -> Self {
        self.stream_error_after = Some(at);
        self
    }
}

/// A call made against the runtime, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(String),
    Stop(String),
    Remove(String),
    Logs(String),
}

struct UnitState {
    handle: UnitHandle,
    labels: BTreeMap<String, String>,
    script: UnitScript,
    started: Instant,
    created_at: DateTime<Utc>,
    stopped: bool,
    stop_tx: watch::Sender<bool>,
}

impl UnitState {
    fn exited_on_its_own(&self) -> bool {
        self.script
            .exit_after
            .is_some_and(|at| Instant::now() >= self.started + at)
    }

    fn is_running(&self) -> bool {
        !self.stopped && !self.exited_on_its_own()
    }
}

#[derive(Default)]
struct Inner {
    units: HashMap<String, UnitState>,
    scripts: VecDeque<UnitScript>,
    default_script: UnitScript,
    start_failures: VecDeque<StartFailure>,
    missing_images: HashSet<String>,
    calls: Vec<RuntimeCall>,
    next_id: u64,
}

struct StartFailure {
    error: RuntimeError,
    after_create: bool,
}

#[derive(Default)]
pub struct ScriptedRuntime {
    inner: Mutex<Inner>,
}

enum ScriptEvent {
    Line(String),
    StreamError,
    Exit,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a script for the next started unit.
    pub fn push_script(&self, script: UnitScript) {
        self.inner().scripts.push_back(script);
    }

    /// Script used once the queue is empty.
    pub fn set_default_script(&self, script: UnitScript) {
        self.inner().default_script = script;
    }

    /// Fail the next start before anything is created.
    pub fn fail_next_start(&self, error: RuntimeError) {
        self.inner().start_failures.push_back(StartFailure {
            error,
            after_create: false,
        });
    }

    /// Fail the next start after the unit was created, so the runtime has
    /// to discard it.
    pub fn fail_next_start_after_create(&self, error: RuntimeError) {
        self.inner().start_failures.push_back(StartFailure {
            error,
            after_create: true,
        });
    }

    pub fn mark_image_missing(&self, image: impl Into<String>) {
        self.inner().missing_images.insert(image.into());
    }

    /// Register a unit that was started outside this process.
    pub fn insert_running(
        &self,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
        created_at: DateTime<Utc>,
    ) {
        let name = name.into();
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = format!("scripted-{}", inner.next_id);
        let (stop_tx, _) = watch::channel(false);
        inner.units.insert(
            name.clone(),
            UnitState {
                handle: UnitHandle { id, name },
                labels,
                script: UnitScript::default(),
                started: Instant::now(),
                created_at,
                stopped: false,
                stop_tx,
            },
        );
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.inner().calls.clone()
    }

    pub fn start_count(&self) -> usize {
        self.inner()
            .calls
            .iter()
            .filter(|c| matches!(c, RuntimeCall::Start(_)))
            .count()
    }

    /// Names of units that exist and are still running.
    pub fn running_units(&self) -> Vec<String> {
        let inner = self.inner();
        let mut names: Vec<String> = inner
            .units
            .values()
            .filter(|u| u.is_running())
            .map(|u| u.handle.name.clone())
            .collect();
        names.sort();
        names
    }

    fn spawn_file_writer(
        started: Instant,
        script: &UnitScript,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut files = script.files.clone();
        if files.is_empty() {
            return;
        }
        files.sort_by_key(|(at, _, _)| *at);
        let exit_after = script.exit_after;
        tokio::spawn(async move {
            for (at, path, contents) in files {
                if exit_after.is_some_and(|exit| at > exit) {
                    break;
                }
                tokio::select! {
                    _ = sleep_until(started + at) => {}
                    _ = stop_rx.changed() => return,
                }
                write_file(&path, &contents);
            }
        });
    }
}

fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(path, contents) {
        tracing::warn!(path = %path.display(), error = %e, "scripted file write failed");
    }
}

#[async_trait]
impl ComputeRuntime for ScriptedRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(!self.inner().missing_images.contains(image))
    }

    async fn start(&self, spec: &UnitSpec) -> Result<UnitHandle, RuntimeError> {
        let mut inner = self.inner();
        inner.calls.push(RuntimeCall::Start(spec.name.clone()));
        let failure = inner.start_failures.pop_front();
        if let Some(StartFailure {
            error,
            after_create: false,
        }) = failure
        {
            return Err(error);
        }
        if inner.units.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict {
                target: spec.name.clone(),
                message: "name already in use".to_string(),
            });
        }
        if let Some(StartFailure { error, .. }) = failure {
            inner.calls.push(RuntimeCall::Remove(spec.name.clone()));
            return Err(error);
        }
        let script = match inner.scripts.pop_front() {
            Some(script) => script,
            None => inner.default_script.clone(),
        };
        inner.next_id += 1;
        let handle = UnitHandle {
            id: format!("scripted-{}", inner.next_id),
            name: spec.name.clone(),
        };
        let started = Instant::now();
        let (stop_tx, stop_rx) = watch::channel(false);
        Self::spawn_file_writer(started, &script, stop_rx);
        inner.units.insert(
            spec.name.clone(),
            UnitState {
                handle: handle.clone(),
                labels: spec.labels.clone(),
                script,
                started,
                created_at: Utc::now(),
                stopped: false,
                stop_tx,
            },
        );
        Ok(handle)
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let mut inner = self.inner();
        inner.calls.push(RuntimeCall::Stop(name.to_string()));
        let unit = inner.units.get_mut(name).ok_or_else(|| RuntimeError::NotFound {
            target: name.to_string(),
        })?;
        if !unit.stopped && !unit.exited_on_its_own() && !grace.is_zero() {
            for (path, contents) in &unit.script.files_on_stop {
                write_file(path, contents);
            }
        }
        unit.stopped = true;
        let _ = unit.stop_tx.send(true);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner();
        inner.calls.push(RuntimeCall::Remove(name.to_string()));
        match inner.units.remove(name) {
            Some(unit) => {
                let _ = unit.stop_tx.send(true);
                Ok(())
            }
            None => Err(RuntimeError::NotFound {
                target: name.to_string(),
            }),
        }
    }

    async fn logs(&self, name: &str, cursor: LogCursor) -> Result<LogStream, RuntimeError> {
        let mut inner = self.inner();
        inner.calls.push(RuntimeCall::Logs(name.to_string()));
        let unit = inner.units.get(name).ok_or_else(|| RuntimeError::NotFound {
            target: name.to_string(),
        })?;

        let from = match cursor {
            LogCursor::Start => None,
            LogCursor::Now => Some(Instant::now()),
        };
        let started = unit.started;
        let mut stop_rx = unit.stop_tx.subscribe();
        let already_stopped = unit.stopped;

        let mut events: Vec<(Duration, ScriptEvent)> = unit
            .script
            .lines
            .iter()
            .map(|(at, text)| (*at, ScriptEvent::Line(text.clone())))
            .collect();
        if let Some(at) = unit.script.stream_error_after {
            events.push((at, ScriptEvent::StreamError));
        }
        if let Some(at) = unit.script.exit_after {
            events.push((at, ScriptEvent::Exit));
        }
        events.sort_by_key(|(at, _)| *at);
        drop(inner);

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            if already_stopped {
                return;
            }
            for (at, event) in events {
                let when = started + at;
                if matches!(event, ScriptEvent::Line(_)) && from.is_some_and(|f| when <= f) {
                    continue;
                }
                tokio::select! {
                    _ = sleep_until(when) => {}
                    _ = stop_rx.changed() => return,
                }
                match event {
                    ScriptEvent::Line(text) => {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    ScriptEvent::StreamError => {
                        let _ = tx
                            .send(Err(RuntimeError::LogStream(
                                "connection reset by runtime".to_string(),
                            )))
                            .await;
                        return;
                    }
                    ScriptEvent::Exit => return,
                }
            }
            // Follow mode: hold the stream open until the unit stops.
            while !*stop_rx.borrow() {
                if stop_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn status(&self, name: &str) -> Result<UnitStatus, RuntimeError> {
        let inner = self.inner();
        let unit = inner.units.get(name).ok_or_else(|| RuntimeError::NotFound {
            target: name.to_string(),
        })?;
        if unit.is_running() {
            Ok(UnitStatus::Running)
        } else if unit.stopped {
            Ok(UnitStatus::Exited { exit_code: Some(0) })
        } else {
            Ok(UnitStatus::Exited {
                exit_code: Some(unit.script.exit_code),
            })
        }
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<DiscoveredUnit>, RuntimeError> {
        let inner = self.inner();
        let mut found: Vec<DiscoveredUnit> = inner
            .units
            .values()
            .filter(|u| u.labels.get(key).is_some_and(|v| v == value))
            .map(|u| DiscoveredUnit {
                handle: u.handle.clone(),
                labels: u.labels.clone(),
                created_at: Some(u.created_at),
                running: u.is_running(),
            })
            .collect();
        found.sort_by(|a, b| a.handle.name.cmp(&b.handle.name));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> UnitSpec {
        UnitSpec {
            name: name.to_string(),
            image: "img".to_string(),
            env: BTreeMap::new(),
            volumes: vec![],
            labels: BTreeMap::from([("worldgen.type".to_string(), "warm-engine".to_string())]),
            memory_limit_bytes: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lines_arrive_on_schedule() {
        let runtime = ScriptedRuntime::new();
        runtime.push_script(
            UnitScript::new()
                .line(Duration::from_secs(1), "one")
                .line(Duration::from_secs(3), "two"),
        );
        runtime.start(&spec("u")).await.unwrap();
        let mut logs = runtime.logs("u", LogCursor::Start).await.unwrap();
        let begin = Instant::now();
        assert_eq!(logs.recv().await.unwrap().unwrap(), "one");
        assert_eq!(begin.elapsed(), Duration::from_secs(1));
        assert_eq!(logs.recv().await.unwrap().unwrap(), "two");
        assert_eq!(begin.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_stream() {
        let runtime = ScriptedRuntime::new();
        runtime.start(&spec("u")).await.unwrap();
        let mut logs = runtime.logs("u", LogCursor::Start).await.unwrap();
        runtime.stop("u", Duration::from_secs(10)).await.unwrap();
        assert!(logs.recv().await.is_none());
        assert_eq!(
            runtime.status("u").await.unwrap(),
            UnitStatus::Exited { exit_code: Some(0) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_now_skips_history() {
        let runtime = ScriptedRuntime::new();
        runtime.push_script(
            UnitScript::new()
                .line(Duration::from_secs(1), "old")
                .line(Duration::from_secs(5), "new"),
        );
        runtime.start(&spec("u")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut logs = runtime.logs("u", LogCursor::Now).await.unwrap();
        assert_eq!(logs.recv().await.unwrap().unwrap(), "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_after_ends_stream_and_reports_code() {
        let runtime = ScriptedRuntime::new();
        runtime.push_script(UnitScript::new().exit_after(Duration::from_secs(2), 1));
        runtime.start(&spec("u")).await.unwrap();
        let mut logs = runtime.logs("u", LogCursor::Start).await.unwrap();
        assert!(logs.recv().await.is_none());
        assert_eq!(
            runtime.status("u").await.unwrap(),
            UnitStatus::Exited { exit_code: Some(1) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_files_written_on_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worlds_local/a.db");
        let runtime = ScriptedRuntime::new();
        runtime.push_script(UnitScript::new().file(Duration::from_secs(4), &path, "db"));
        runtime.start(&spec("u")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!path.exists());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "db");
    }

    #[tokio::test]
    async fn test_start_failure_and_conflict() {
        let runtime = ScriptedRuntime::new();
        runtime.fail_next_start(RuntimeError::Unavailable("daemon down".into()));
        assert!(matches!(
            runtime.start(&spec("u")).await,
            Err(RuntimeError::Unavailable(_))
        ));
        runtime.start(&spec("u")).await.unwrap();
        assert!(matches!(
            runtime.start(&spec("u")).await,
            Err(RuntimeError::Conflict { .. })
        ));
        assert_eq!(runtime.start_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_start_after_create_leaves_no_unit() {
        let runtime = ScriptedRuntime::new();
        runtime.fail_next_start_after_create(RuntimeError::Unavailable("no memory".into()));
        assert!(matches!(
            runtime.start(&spec("u")).await,
            Err(RuntimeError::Unavailable(_))
        ));
        assert_eq!(
            runtime.calls(),
            vec![RuntimeCall::Start("u".into()), RuntimeCall::Remove("u".into())]
        );
        assert!(runtime.list_by_label("worldgen.type", "warm-engine").await.unwrap().is_empty());
        // The name is free again.
        runtime.start(&spec("u")).await.unwrap();
        assert_eq!(runtime.running_units(), vec!["u"]);
    }

    #[tokio::test]
    async fn test_list_by_label_includes_stopped_units() {
        let runtime = ScriptedRuntime::new();
        runtime.start(&spec("a")).await.unwrap();
        runtime.start(&spec("b")).await.unwrap();
        runtime.stop("b", Duration::ZERO).await.unwrap();
        let found = runtime.list_by_label("worldgen.type", "warm-engine").await.unwrap();
        let states: Vec<(&str, bool)> = found
            .iter()
            .map(|u| (u.handle.name.as_str(), u.running))
            .collect();
        assert_eq!(states, vec![("a", true), ("b", false)]);
        assert!(runtime.list_by_label("worldgen.type", "other").await.unwrap().is_empty());
    }
}
