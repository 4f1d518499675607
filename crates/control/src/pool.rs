use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{Orchestrator, SandboxLaunchConfig};
use crate::broker::Broker;
use crate::error::PoolError;
use crate::protocol::{Language, reply_queue_name};
use crate::registry::Registry;
use crate::router;
use crate::stats::{PoolStats, PoolStatus};
use crate::worker::{Worker, WorkerState};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub language: Language,
    pub capacity: usize,
    pub launch: SandboxLaunchConfig,
}

/// State shared by the pool, its workers and its reply router.
pub(crate) struct PoolShared {
    pub(crate) language: Language,
    pub(crate) reply_queue: String,
    pub(crate) registry: Registry,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) orchestrator: Arc<dyn Orchestrator>,
    pub(crate) launch: SandboxLaunchConfig,
    pub(crate) stats: PoolStats,
}

/// Fixed-capacity, self-healing set of ready workers for one language.
///
/// The bounded `ready` channel is both the storage and the semaphore: a
/// worker is only visible to `acquire` once it has been fully provisioned
/// and sent, and each buffered worker is received by exactly one caller.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    shared: Arc<PoolShared>,
    capacity: usize,
    ready_tx: mpsc::Sender<Worker>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Worker>>,
    closed: CancellationToken,
    router_stop: CancellationToken,
    router: Mutex<Option<JoinHandle<()>>>,
    background: TaskTracker,
}

impl WorkerPool {
    /// Starts the reply router and provisions `capacity` workers.
    ///
    /// Any provisioning failure aborts construction: workers provisioned so
    /// far are cleaned up and the router is stopped before the error returns.
    pub async fn new(
        config: PoolConfig,
        broker: Arc<dyn Broker>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Result<Self, PoolError> {
        let PoolConfig {
            language,
            capacity,
            launch,
        } = config;
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }

        let reply_queue = reply_queue_name(language);
        broker.declare_queue(&reply_queue).await?;
        let deliveries = broker.consume(&reply_queue).await?;

        let shared = Arc::new(PoolShared {
            language,
            reply_queue,
            registry: Registry::default(),
            broker,
            orchestrator,
            launch,
            stats: PoolStats::default(),
        });
        let router_stop = CancellationToken::new();
        let router = tokio::spawn(router::run(
            Arc::clone(&shared),
            deliveries,
            router_stop.clone(),
        ));

        let (ready_tx, ready_rx) = mpsc::channel(capacity);
        let pool = Self {
            inner: Arc::new(PoolInner {
                shared,
                capacity,
                ready_tx,
                ready_rx: tokio::sync::Mutex::new(ready_rx),
                closed: CancellationToken::new(),
                router_stop,
                router: Mutex::new(Some(router)),
                background: TaskTracker::new(),
            }),
        };

        for index in 0..capacity {
            match Worker::provision(&pool.inner.shared).await {
                Ok(worker) => pool.insert_ready(worker).await,
                Err(source) => {
                    pool.inner.shared.stats.record_provision_failure();
                    tracing::error!(%language, index, capacity, error = %source, "pool bootstrap failed");
                    pool.shutdown().await;
                    return Err(PoolError::Bootstrap {
                        language,
                        index,
                        capacity,
                        source,
                    });
                }
            }
        }
        tracing::info!(%language, capacity, "worker pool ready");
        Ok(pool)
    }

    pub fn language(&self) -> Language {
        self.inner.shared.language
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn reply_queue(&self) -> &str {
        &self.inner.shared.reply_queue
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Number of workers sitting in the ready queue.
    pub fn ready(&self) -> usize {
        self.inner.capacity - self.inner.ready_tx.capacity()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            language: self.language(),
            capacity: self.capacity(),
            ready: self.ready(),
            live_workers: self.inner.shared.registry.len(),
            closed: self.is_closed(),
            stats: self.inner.shared.stats.snapshot(),
        }
    }

    /// Leases one ready worker, waiting at most `deadline` for one to appear.
    ///
    /// A timed-out call consumes nothing from the pool.
    pub async fn acquire(&self, deadline: Duration) -> Result<Worker, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let next = async {
            let mut ready = self.inner.ready_rx.lock().await;
            ready.recv().await
        };
        let received = tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => return Err(PoolError::Closed),
            received = tokio::time::timeout(deadline, next) => received,
        };
        match received {
            Ok(Some(mut worker)) => {
                worker.set_state(WorkerState::Leased);
                self.inner.shared.stats.record_lease();
                tracing::debug!(language = %self.language(), worker_id = %worker.id(), "worker leased");
                Ok(worker)
            }
            Ok(None) => Err(PoolError::Closed),
            Err(_) => {
                tracing::warn!(language = %self.language(), ?deadline, "timed out waiting for a worker");
                Err(PoolError::AcquireTimeout(deadline))
            }
        }
    }

    /// Provisions `n` workers and adds them to the ready queue.
    ///
    /// Failures are logged and counted but never retried, so each one
    /// permanently lowers the number of workers this pool can hand out.
    pub async fn replenish(&self, n: usize) {
        for _ in 0..n {
            if self.is_closed() {
                return;
            }
            match Worker::provision(&self.inner.shared).await {
                Ok(worker) => self.insert_ready(worker).await,
                Err(err) => {
                    self.inner.shared.stats.record_provision_failure();
                    self.inner.shared.stats.record_replenish_failure();
                    tracing::error!(
                        language = %self.language(),
                        error = %err,
                        ready = self.ready(),
                        capacity = self.capacity(),
                        "replenishment failed; pool capacity reduced"
                    );
                }
            }
        }
    }

    /// Ends a lease: tears the worker down and provisions its replacement in
    /// the background, off the caller's response path.
    pub fn release(&self, worker: Worker) {
        let pool = self.clone();
        self.inner.background.spawn(async move {
            pool.retire(worker).await;
            pool.replenish(1).await;
        });
    }

    /// Stops handing out workers, cleans up every ready worker, waits for
    /// in-flight releases and stops the reply router.
    pub async fn shutdown(&self) {
        self.inner.closed.cancel();
        let drained = {
            let mut ready = self.inner.ready_rx.lock().await;
            ready.close();
            let mut drained = Vec::new();
            while let Some(worker) = ready.recv().await {
                drained.push(worker);
            }
            drained
        };
        for worker in drained {
            self.retire(worker).await;
        }

        self.inner.background.close();
        self.inner.background.wait().await;

        self.inner.router_stop.cancel();
        let router = self.inner.router.lock().take();
        if let Some(router) = router
            && let Err(err) = router.await
        {
            tracing::error!(language = %self.language(), error = %err, "reply router panicked");
        }
        if let Err(err) = self
            .inner
            .shared
            .broker
            .delete_queue(&self.inner.shared.reply_queue)
            .await
        {
            tracing::debug!(language = %self.language(), error = %err, "reply queue removal failed");
        }
        tracing::info!(language = %self.language(), "worker pool shut down");
    }

    async fn insert_ready(&self, mut worker: Worker) {
        worker.set_state(WorkerState::Pooled);
        if let Err(mpsc::error::SendError(worker)) = self.inner.ready_tx.send(worker).await {
            tracing::debug!(language = %self.language(), worker_id = %worker.id(), "pool closed; discarding new worker");
            self.retire(worker).await;
        }
    }

    async fn retire(&self, worker: Worker) {
        let worker_id = worker.id().clone();
        if let Err(err) = worker.cleanup().await {
            tracing::error!(
                language = %self.language(),
                %worker_id,
                error = %err,
                "sandbox deletion failed; sandbox may need manual removal"
            );
        }
    }
}
