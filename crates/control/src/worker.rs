use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::SandboxHandle;
use crate::broker::Envelope;
use crate::error::{BrokerError, OrchestratorError, ProvisionError};
use crate::pool::PoolShared;
use crate::protocol::{JobMessage, Language, ResultMessage, WorkerId, job_queue_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Registered,
    SandboxReady,
    Pooled,
    Leased,
    Completed,
    TimedOut,
    Cleaning,
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Registered => "registered",
            Self::SandboxReady => "sandbox_ready",
            Self::Pooled => "pooled",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Cleaning => "cleaning",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// One leasable execution slot: a sandbox, its job queue and its reply channel.
///
/// A `Worker` is owned by exactly one place at a time, either the pool's
/// ready queue or the caller that leased it. [`Worker::cleanup`] consumes it.
pub struct Worker {
    id: WorkerId,
    language: Language,
    sandbox: SandboxHandle,
    job_queue: String,
    replies: mpsc::Receiver<ResultMessage>,
    state: WorkerState,
    shared: Arc<PoolShared>,
}

impl Worker {
    pub(crate) async fn provision(shared: &Arc<PoolShared>) -> Result<Self, ProvisionError> {
        let id = WorkerId::generate();
        let language = shared.language;
        tracing::debug!(%language, worker_id = %id, state = %WorkerState::Created, "provisioning worker");

        // The reply channel exists before the sandbox does, so an early reply always has a home.
        let replies = shared.registry.register(&id);
        tracing::trace!(worker_id = %id, state = %WorkerState::Registered, "reply channel registered");

        let job_queue = job_queue_name(&id);
        if let Err(err) = shared.broker.declare_queue(&job_queue).await {
            shared.registry.remove(id.as_str());
            return Err(err.into());
        }

        let spec = shared.launch.sandbox_spec(language, &id);
        let sandbox = match shared.orchestrator.create_sandbox(spec).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                shared.registry.remove(id.as_str());
                if let Err(queue_err) = shared.broker.delete_queue(&job_queue).await {
                    tracing::debug!(worker_id = %id, error = %queue_err, "job queue removal failed");
                }
                return Err(err.into());
            }
        };
        let state = WorkerState::SandboxReady;
        shared.stats.record_provisioned();
        tracing::info!(%language, worker_id = %id, %sandbox, %state, "worker provisioned");

        Ok(Self {
            id,
            language,
            sandbox,
            job_queue,
            replies,
            state,
            shared: Arc::clone(shared),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: WorkerState) {
        self.state = state;
    }

    /// Sends `job` to this worker's queue. Replies come back on [`Worker::subscribe`].
    pub async fn publish(&mut self, job: &JobMessage) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(job)?;
        let envelope = Envelope::new(body)
            .with_correlation_id(self.id.as_str())
            .with_reply_to(self.shared.reply_queue.as_str());
        self.shared.broker.publish(&self.job_queue, envelope).await?;
        tracing::debug!(
            language = %self.language,
            worker_id = %self.id,
            request_id = job.request_id.as_deref().unwrap_or(""),
            "job published"
        );
        Ok(())
    }

    pub fn subscribe(&mut self) -> &mut mpsc::Receiver<ResultMessage> {
        &mut self.replies
    }

    /// Waits up to `deadline` for the reply and records the outcome.
    pub async fn await_reply(&mut self, deadline: Duration) -> Option<ResultMessage> {
        match tokio::time::timeout(deadline, self.replies.recv()).await {
            Ok(Some(reply)) => {
                self.state = WorkerState::Completed;
                self.shared.stats.record_completed();
                Some(reply)
            }
            Ok(None) | Err(_) => {
                self.state = WorkerState::TimedOut;
                self.shared.stats.record_timed_out();
                None
            }
        }
    }

    /// Force-deletes the sandbox and drops the registry entry.
    ///
    /// The registry entry is removed even when sandbox deletion fails, so a
    /// late reply for this worker is always dropped by the router.
    pub async fn cleanup(mut self) -> Result<(), OrchestratorError> {
        let outcome = self.state;
        self.state = WorkerState::Cleaning;
        let deleted = self
            .shared
            .orchestrator
            .delete_sandbox(&self.sandbox, Duration::ZERO)
            .await;
        self.shared.registry.remove(self.id.as_str());
        if let Err(err) = self.shared.broker.delete_queue(&self.job_queue).await {
            tracing::debug!(worker_id = %self.id, error = %err, "job queue removal failed");
        }
        self.state = WorkerState::Terminated;
        self.shared.stats.record_cleanup();
        if deleted.is_ok() {
            tracing::info!(
                language = %self.language,
                worker_id = %self.id,
                sandbox = %self.sandbox,
                %outcome,
                "worker terminated"
            );
        }
        deleted
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("sandbox", &self.sandbox)
            .field("state", &self.state)
            .finish()
    }
}
