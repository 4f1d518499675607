#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use control::broker::{Broker, Envelope, MemoryBroker};
use control::error::OrchestratorError;
use control::pool::{PoolConfig, WorkerPool};
use control::protocol::{JobMessage, Language, ResultMessage, WorkerId, job_queue_name};
use control::{
    ENV_WORKER_ID, Orchestrator, SandboxHandle, SandboxLaunchConfig, SandboxSpec,
    SandboxWorkerConfig,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Orchestrator whose "sandboxes" are tasks answering one job from the
/// in-memory broker.
///
/// The job code drives the reply:
/// - `sleep:<ms>` waits before answering
/// - `fail` answers with `success: false`
/// - `garbage` answers with a body that is not JSON
/// - `silent` never answers
/// - anything else answers `ran: <code>`
pub struct FakeOrchestrator {
    broker: MemoryBroker,
    fail_on: Mutex<HashSet<usize>>,
    linger: bool,
    attempts: AtomicUsize,
    created: AtomicUsize,
    deleted: AtomicUsize,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    sandboxes: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl FakeOrchestrator {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            fail_on: Mutex::new(HashSet::new()),
            linger: false,
            attempts: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Makes the `index`-th creation attempt (zero based) fail.
    pub fn fail_on(self, index: usize) -> Self {
        self.fail_on.lock().insert(index);
        self
    }

    /// Keeps sandbox tasks running after deletion so late replies still arrive.
    pub fn lingering(mut self) -> Self {
        self.linger = true;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.sandboxes.lock().len()
    }

    /// Highest number of jobs that were ever running at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn create_sandbox(&self, spec: SandboxSpec) -> Result<SandboxHandle, OrchestratorError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.lock().contains(&attempt) {
            return Err(OrchestratorError::Rejected(format!(
                "injected failure on attempt {attempt}"
            )));
        }
        let worker_id = spec
            .env_var(ENV_WORKER_ID)
            .map(WorkerId::from)
            .ok_or_else(|| OrchestratorError::Rejected("missing WORKER_ID".to_owned()))?;
        let mut jobs = self
            .broker
            .consume(&job_queue_name(&worker_id))
            .await
            .map_err(|err| OrchestratorError::Rejected(err.to_string()))?;

        let broker = self.broker.clone();
        let active = Arc::clone(&self.active);
        let max_active = Arc::clone(&self.max_active);
        let task = tokio::spawn(async move {
            let Some(job) = jobs.recv().await else {
                return;
            };
            let running = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(running, Ordering::SeqCst);
            let reply = answer(&job).await;
            active.fetch_sub(1, Ordering::SeqCst);
            if let (Some(reply), Some(reply_to)) = (reply, job.reply_to.clone()) {
                let mut envelope = Envelope::new(reply);
                if let Some(correlation_id) = job.correlation_id {
                    envelope = envelope.with_correlation_id(correlation_id);
                }
                let _ = broker.publish(&reply_to, envelope).await;
            }
        });

        let handle = SandboxHandle::new(spec.name);
        self.sandboxes.lock().insert(handle.id().to_owned(), task);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn delete_sandbox(
        &self,
        handle: &SandboxHandle,
        _grace: Duration,
    ) -> Result<(), OrchestratorError> {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.sandboxes.lock().remove(handle.id())
            && !self.linger
        {
            task.abort();
        }
        Ok(())
    }
}

async fn answer(job: &Envelope) -> Option<Vec<u8>> {
    let code = serde_json::from_slice::<JobMessage>(&job.body)
        .map(|job| job.code)
        .unwrap_or_default();
    let result = match code.as_str() {
        "silent" => return None,
        "garbage" => return Some(b"not json".to_vec()),
        "fail" => ResultMessage {
            success: false,
            error: "boom".to_owned(),
            ..ResultMessage::default()
        },
        other => {
            if let Some(ms) = other.strip_prefix("sleep:").and_then(|ms| ms.parse().ok()) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            ResultMessage {
                success: true,
                output: format!("ran: {other}"),
                version: "test-1.0".to_owned(),
                ..ResultMessage::default()
            }
        }
    };
    serde_json::to_vec(&result).ok()
}

pub fn pool_config(language: Language, capacity: usize) -> PoolConfig {
    PoolConfig {
        language,
        capacity,
        launch: SandboxLaunchConfig {
            image: format!("sandpool/worker-{language}:test"),
            worker: SandboxWorkerConfig {
                broker_url: "memory://local".to_owned(),
                result_upload_url: "http://file-service.test".to_owned(),
                outbound_proxy: None,
                execution_timeout: Duration::from_secs(5),
            },
        },
    }
}

pub struct Harness {
    pub broker: MemoryBroker,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub pool: WorkerPool,
}

pub async fn start_pool(capacity: usize) -> Harness {
    let broker = MemoryBroker::new();
    let orchestrator = Arc::new(FakeOrchestrator::new(broker.clone()));
    start_pool_with(broker, orchestrator, capacity).await
}

pub async fn start_pool_with(
    broker: MemoryBroker,
    orchestrator: Arc<FakeOrchestrator>,
    capacity: usize,
) -> Harness {
    let pool = WorkerPool::new(
        pool_config(Language::Python, capacity),
        Arc::new(broker.clone()),
        orchestrator.clone(),
    )
    .await
    .expect("pool bootstrap");
    Harness {
        broker,
        orchestrator,
        pool,
    }
}

/// Polls `condition` until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
