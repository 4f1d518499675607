use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerInspectResponse, ContainerStateStatusEnum, HostConfig,
};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};

use crate::error::OrchestratorError;
use crate::{Orchestrator, SandboxHandle, SandboxSpec};

const WORKER_LABEL: &str = "sandpool.worker";
const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// OCI runtime for the sandbox container, e.g. `runsc` for gVisor.
    pub runtime: Option<String>,
    pub network: Option<String>,
    pub ready_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            network: None,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Connects to the local Docker daemon with platform defaults.
pub fn build_orchestrator(config: DockerConfig) -> Result<Arc<dyn Orchestrator>, OrchestratorError> {
    let docker = Docker::connect_with_local_defaults().map_err(OrchestratorError::Connect)?;
    tracing::info!(runtime = ?config.runtime, network = ?config.network, "using docker orchestrator");
    Ok(Arc::new(DockerOrchestrator::with_client(docker, config)))
}

/// Runs each sandbox as an auto-removing container on the Docker daemon.
pub struct DockerOrchestrator {
    docker: Docker,
    config: DockerConfig,
}

impl std::fmt::Debug for DockerOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// What one readiness poll learned about a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Running,
    Starting,
    /// Exited, dying or already removed by auto-remove.
    Stopped,
}

impl DockerOrchestrator {
    pub fn with_client(docker: Docker, config: DockerConfig) -> Self {
        Self { docker, config }
    }

    fn container_body(&self, spec: &SandboxSpec) -> ContainerCreateBody {
        let env = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(HashMap::from([(WORKER_LABEL.to_owned(), "true".to_owned())])),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                runtime: self.config.runtime.clone(),
                network_mode: self.config.network.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn wait_until_running(&self, name: &str, container_id: &str) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let mut last_error = None;
        loop {
            let inspected = self
                .docker
                .inspect_container(container_id, None::<InspectContainerOptions>)
                .await;
            match readiness(inspected) {
                Ok(Readiness::Running) => return Ok(()),
                Ok(Readiness::Starting) => {}
                Ok(Readiness::Stopped) => {
                    return Err(OrchestratorError::Exited {
                        name: name.to_owned(),
                    });
                }
                Err(err) => {
                    tracing::debug!(sandbox = %name, error = %err, "inspect failed; still polling");
                    last_error = Some(err);
                }
            }
            if started.elapsed() >= self.config.ready_timeout {
                return Err(match last_error {
                    Some(source) => OrchestratorError::Docker {
                        operation: "inspect_container",
                        name: name.to_owned(),
                        source,
                    },
                    None => OrchestratorError::NotReady {
                        name: name.to_owned(),
                        timeout: self.config.ready_timeout,
                    },
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), OrchestratorError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone, e.g. the worker exited and auto-remove won the race.
            Err(err) if is_not_found(&err) => Ok(()),
            Err(source) => Err(OrchestratorError::Docker {
                operation: "remove_container",
                name: container_id.to_owned(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn create_sandbox(&self, spec: SandboxSpec) -> Result<SandboxHandle, OrchestratorError> {
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };
        let created = self
            .docker
            .create_container(Some(options), self.container_body(&spec))
            .await
            .map_err(|source| OrchestratorError::Docker {
                operation: "create_container",
                name: spec.name.clone(),
                source,
            })?;
        let handle = SandboxHandle::new(created.id);
        tracing::debug!(sandbox = %handle, name = %spec.name, image = %spec.image, "container created");

        let started = self
            .docker
            .start_container(handle.id(), None::<StartContainerOptions>)
            .await
            .map_err(|source| OrchestratorError::Docker {
                operation: "start_container",
                name: spec.name.clone(),
                source,
            });
        let ready = match started {
            Ok(()) => self.wait_until_running(&spec.name, handle.id()).await,
            Err(err) => Err(err),
        };
        if let Err(err) = ready {
            if let Err(remove_err) = self.remove(handle.id()).await {
                tracing::warn!(sandbox = %handle, error = %remove_err, "failed to remove unready sandbox");
            }
            return Err(err);
        }
        Ok(handle)
    }

    async fn delete_sandbox(
        &self,
        handle: &SandboxHandle,
        grace: Duration,
    ) -> Result<(), OrchestratorError> {
        if !grace.is_zero() {
            let options = StopContainerOptions {
                t: Some(grace.as_secs().max(1) as i32),
                signal: None,
            };
            if let Err(err) = self.docker.stop_container(handle.id(), Some(options)).await {
                tracing::debug!(sandbox = %handle, error = %err, "graceful stop failed");
            }
        }
        self.remove(handle.id()).await
    }
}

fn readiness(
    inspected: Result<ContainerInspectResponse, BollardError>,
) -> Result<Readiness, BollardError> {
    let inspect = match inspected {
        Ok(inspect) => inspect,
        Err(err) if is_not_found(&err) => return Ok(Readiness::Stopped),
        Err(err) => return Err(err),
    };
    let Some(state) = inspect.state else {
        return Ok(Readiness::Starting);
    };
    if state.running == Some(true) {
        return Ok(Readiness::Running);
    }
    Ok(match state.status {
        Some(
            ContainerStateStatusEnum::EXITED
            | ContainerStateStatusEnum::DEAD
            | ContainerStateStatusEnum::REMOVING,
        ) => Readiness::Stopped,
        _ => Readiness::Starting,
    })
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use bollard::models::ContainerState;

    use super::*;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            name: "sandpool-python-abc".to_owned(),
            image: "sandpool/worker-python:latest".to_owned(),
            env: vec![
                ("WORKER_ID".to_owned(), "abc".to_owned()),
                ("BROKER_URL".to_owned(), "amqp://rabbitmq:5672".to_owned()),
            ],
        }
    }

    fn orchestrator(config: DockerConfig) -> DockerOrchestrator {
        // The client connects lazily, so no daemon is needed to build request bodies.
        let docker = Docker::connect_with_local_defaults().unwrap();
        DockerOrchestrator::with_client(docker, config)
    }

    fn server_error(status_code: u16) -> BollardError {
        BollardError::DockerResponseServerError {
            status_code,
            message: "daemon says no".to_owned(),
        }
    }

    fn inspected(running: bool, status: ContainerStateStatusEnum) -> ContainerInspectResponse {
        ContainerInspectResponse {
            state: Some(ContainerState {
                running: Some(running),
                status: Some(status),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn container_body_carries_image_env_and_auto_remove() {
        let body = orchestrator(DockerConfig::default()).container_body(&spec());
        assert_eq!(body.image.as_deref(), Some("sandpool/worker-python:latest"));
        let env = body.env.unwrap();
        assert!(env.contains(&"WORKER_ID=abc".to_owned()));
        assert_eq!(body.labels.unwrap()[WORKER_LABEL], "true");
        let host = body.host_config.unwrap();
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.runtime, None);
        assert_eq!(host.network_mode, None);
    }

    #[test]
    fn container_body_includes_runtime_and_network() {
        let body = orchestrator(DockerConfig {
            runtime: Some("runsc".to_owned()),
            network: Some("sandbox-net".to_owned()),
            ready_timeout: Duration::from_secs(1),
        })
        .container_body(&spec());
        let host = body.host_config.unwrap();
        assert_eq!(host.runtime.as_deref(), Some("runsc"));
        assert_eq!(host.network_mode.as_deref(), Some("sandbox-net"));
    }

    #[test]
    fn running_container_is_ready() {
        let state = readiness(Ok(inspected(true, ContainerStateStatusEnum::RUNNING)));
        assert_eq!(state.unwrap(), Readiness::Running);
    }

    #[test]
    fn created_container_is_still_starting() {
        let state = readiness(Ok(inspected(false, ContainerStateStatusEnum::CREATED)));
        assert_eq!(state.unwrap(), Readiness::Starting);
        let state = readiness(Ok(ContainerInspectResponse::default()));
        assert_eq!(state.unwrap(), Readiness::Starting);
    }

    #[test]
    fn exited_or_missing_container_is_stopped() {
        let state = readiness(Ok(inspected(false, ContainerStateStatusEnum::EXITED)));
        assert_eq!(state.unwrap(), Readiness::Stopped);
        let state = readiness(Ok(inspected(false, ContainerStateStatusEnum::DEAD)));
        assert_eq!(state.unwrap(), Readiness::Stopped);
        assert_eq!(readiness(Err(server_error(404))).unwrap(), Readiness::Stopped);
    }

    #[test]
    fn daemon_errors_are_not_treated_as_exits() {
        let err = readiness(Err(server_error(500))).unwrap_err();
        assert!(matches!(
            err,
            BollardError::DockerResponseServerError {
                status_code: 500,
                ..
            }
        ));
        assert!(readiness(Err(server_error(403))).is_err());
    }

    #[test]
    fn only_404_counts_as_not_found() {
        assert!(is_not_found(&server_error(404)));
        assert!(!is_not_found(&server_error(409)));
        assert!(!is_not_found(&server_error(500)));
    }
}
