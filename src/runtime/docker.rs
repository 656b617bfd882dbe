use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    Docker,
    errors::Error as BollardError,
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
        LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
        StopContainerOptionsBuilder,
    },
};
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use super::{ComputeRuntime, DiscoveredUnit, LogCursor, LogStream, UnitHandle, UnitSpec, UnitStatus};
use crate::errors::RuntimeError;

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// [`ComputeRuntime`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ComputeRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(classify("inspect_image", image, e)),
        }
    }

    async fn start(&self, spec: &UnitSpec) -> Result<UnitHandle, RuntimeError> {
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            labels: Some(
                spec.labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            ),
            host_config: Some(HostConfig {
                binds: Some(spec.volumes.iter().map(|v| v.bind_spec()).collect()),
                memory: spec.memory_limit_bytes,
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| classify("create_container", &spec.name, e))?;

        if let Err(e) = self
            .docker
            .start_container(&spec.name, None::<StartContainerOptions>)
            .await
        {
            // Created but never started; the name would block the next launch.
            if let Err(remove) = self.remove(&spec.name).await {
                tracing::warn!(unit = %spec.name, error = %remove, "removing unstarted container failed");
            }
            return Err(classify("start_container", &spec.name, e));
        }

        tracing::debug!(unit = %spec.name, id = %created.id, "container started");
        Ok(UnitHandle {
            id: created.id,
            name: spec.name.clone(),
        })
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        let grace_secs = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptionsBuilder::new().t(grace_secs).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(classify("stop_container", name, e)),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                name,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await
            .map_err(|e| classify("remove_container", name, e))
    }

    async fn logs(&self, name: &str, cursor: LogCursor) -> Result<LogStream, RuntimeError> {
        // Surface a missing container as NotFound before spawning the reader.
        self.status(name).await?;

        let since = match cursor {
            LogCursor::Start => 0,
            LogCursor::Now => i32::try_from(Utc::now().timestamp()).unwrap_or(i32::MAX),
        };
        let options = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .since(since)
            .build();

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let docker = self.docker.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut stream = Box::pin(docker.logs(&name, Some(options)));
            let mut splitter = LineSplitter::default();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(output) => {
                        let chunk = String::from_utf8_lossy(&output.into_bytes()).into_owned();
                        for line in splitter.push(&chunk) {
                            if tx.send(Ok(line)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(RuntimeError::LogStream(e.to_string()))).await;
                        return;
                    }
                }
            }
            if let Some(rest) = splitter.finish() {
                let _ = tx.send(Ok(rest)).await;
            }
        });
        Ok(rx)
    }

    async fn status(&self, name: &str) -> Result<UnitStatus, RuntimeError> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify("inspect_container", name, e))?;
        let state = info.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            Ok(UnitStatus::Running)
        } else {
            Ok(UnitStatus::Exited {
                exit_code: state.exit_code,
            })
        }
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<DiscoveredUnit>, RuntimeError> {
        let filters: HashMap<String, Vec<String>> =
            HashMap::from([("label".to_string(), vec![format!("{key}={value}")])]);
        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(|e| classify("list_containers", key, e))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let labels: BTreeMap<String, String> =
                    summary.labels.unwrap_or_default().into_iter().collect();
                let created_at = summary
                    .created
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
                let running = summary
                    .state
                    .as_ref()
                    .is_some_and(|state| state.to_string() == "running");
                Some(DiscoveredUnit {
                    handle: UnitHandle { id, name },
                    labels,
                    created_at,
                    running,
                })
            })
            .collect())
    }
}

fn status_code(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn classify(operation: &'static str, target: &str, error: BollardError) -> RuntimeError {
    match status_code(&error) {
        Some(404) => RuntimeError::NotFound {
            target: target.to_string(),
        },
        Some(409) => RuntimeError::Conflict {
            target: target.to_string(),
            message: error.to_string(),
        },
        _ => RuntimeError::Operation {
            operation,
            target: target.to_string(),
            message: error.to_string(),
        },
    }
}

/// Reassembles lines from arbitrarily chunked log output.
#[derive(Debug, Default)]
struct LineSplitter {
    buf: String,
}

impl LineSplitter {
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let rest = self.buf.trim_end_matches('\r');
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_joins_partial_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push("Game server ").is_empty());
        assert_eq!(
            splitter.push("connected\r\nZonesystem"),
            vec!["Game server connected"]
        );
        assert_eq!(splitter.push(" Start\n\n"), vec!["Zonesystem Start", ""]);
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_flushes_trailing_line() {
        let mut splitter = LineSplitter::default();
        splitter.push("no newline");
        assert_eq!(splitter.finish().as_deref(), Some("no newline"));
    }

    #[test]
    fn test_classify_maps_status_codes() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(classify("inspect_container", "x", not_found).is_not_found());

        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".into(),
        };
        assert!(matches!(
            classify("create_container", "x", conflict),
            RuntimeError::Conflict { .. }
        ));

        let other = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "daemon".into(),
        };
        match classify("start_container", "x", other) {
            RuntimeError::Operation { operation, .. } => assert_eq!(operation, "start_container"),
            e => panic!("unexpected {e:?}"),
        }
    }
}
