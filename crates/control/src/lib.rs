pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod launcher;
pub mod pool;
pub mod pools;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod stats;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;

use error::OrchestratorError;
use protocol::{Language, WorkerId};

pub const ENV_WORKER_ID: &str = "WORKER_ID";
pub const ENV_WORKER_LANGUAGE: &str = "WORKER_LANGUAGE";
pub const ENV_BROKER_URL: &str = "BROKER_URL";
pub const ENV_RESULT_UPLOAD_URL: &str = "RESULT_UPLOAD_URL";
pub const ENV_OUTBOUND_PROXY: &str = "OUTBOUND_PROXY";
pub const ENV_EXECUTION_TIMEOUT_SECS: &str = "EXECUTION_TIMEOUT_SECS";

/// Settings every sandbox receives through its environment.
#[derive(Debug, Clone)]
pub struct SandboxWorkerConfig {
    pub broker_url: String,
    pub result_upload_url: String,
    pub outbound_proxy: Option<String>,
    pub execution_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SandboxLaunchConfig {
    pub image: String,
    pub worker: SandboxWorkerConfig,
}

impl SandboxLaunchConfig {
    pub fn sandbox_spec(&self, language: Language, worker_id: &WorkerId) -> SandboxSpec {
        let mut env = vec![
            (ENV_WORKER_ID.to_owned(), worker_id.to_string()),
            (ENV_WORKER_LANGUAGE.to_owned(), language.to_string()),
            (ENV_BROKER_URL.to_owned(), self.worker.broker_url.clone()),
            (
                ENV_RESULT_UPLOAD_URL.to_owned(),
                self.worker.result_upload_url.clone(),
            ),
            (
                ENV_EXECUTION_TIMEOUT_SECS.to_owned(),
                self.worker.execution_timeout.as_secs().max(1).to_string(),
            ),
        ];
        if let Some(proxy) = &self.worker.outbound_proxy {
            env.push((ENV_OUTBOUND_PROXY.to_owned(), proxy.clone()));
        }
        SandboxSpec {
            name: format!("sandpool-{language}-{worker_id}"),
            image: self.image.clone(),
            env,
        }
    }
}

/// Everything the orchestrator needs to start one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
}

impl SandboxSpec {
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// Opaque reference to a sandbox, as returned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle(String);

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    /// Starts a sandbox and returns once it is running.
    async fn create_sandbox(&self, spec: SandboxSpec) -> Result<SandboxHandle, OrchestratorError>;

    async fn delete_sandbox(
        &self,
        handle: &SandboxHandle,
        grace: Duration,
    ) -> Result<(), OrchestratorError>;
}
