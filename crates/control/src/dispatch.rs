use std::time::{Duration, Instant};

use crate::error::DispatchError;
use crate::pool::WorkerPool;
use crate::protocol::{JobMessage, ResultMessage};
use crate::worker::Worker;

/// The two independent, sequential deadlines of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// How long to wait for a ready worker.
    pub acquire_timeout: Duration,
    /// How long the leased worker has to reply once the job is published.
    pub execution_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub result: ResultMessage,
    /// Measured here from publish to reply; the sandbox's own timing is never used.
    pub duration: Duration,
}

/// A leased worker that goes back to its pool when dropped.
///
/// `execute` can be cancelled at any await point, e.g. when the client
/// disconnects or the request timeout fires; the worker is released then too.
struct Lease<'a> {
    pool: &'a WorkerPool,
    worker: Option<Worker>,
}

impl<'a> Lease<'a> {
    fn new(pool: &'a WorkerPool, worker: Worker) -> Self {
        Self {
            pool,
            worker: Some(worker),
        }
    }

    fn worker(&mut self) -> Result<&mut Worker, DispatchError> {
        self.worker.as_mut().ok_or(DispatchError::PoolClosed)
    }

    fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker);
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            tracing::warn!(
                language = %self.pool.language(),
                worker_id = %worker.id(),
                "execution abandoned; releasing worker"
            );
            self.pool.release(worker);
        }
    }
}

/// Leases a worker, runs `job` on it and returns its reply.
///
/// The worker is released on every path once it has been leased, which
/// tears it down and provisions a replacement in the background. That
/// includes the future being dropped before it completes.
pub async fn execute(
    pool: &WorkerPool,
    job: JobMessage,
    limits: ExecutionLimits,
) -> Result<Execution, DispatchError> {
    let mut lease = Lease::new(pool, pool.acquire(limits.acquire_timeout).await?);
    let worker = lease.worker()?;
    let worker_id = worker.id().clone();

    let started = Instant::now();
    if let Err(err) = worker.publish(&job).await {
        tracing::error!(language = %pool.language(), %worker_id, error = %err, "publish failed");
        lease.release();
        return Err(DispatchError::Publish(err));
    }

    let reply = worker.await_reply(limits.execution_timeout).await;
    let duration = started.elapsed();
    lease.release();

    match reply {
        Some(result) => {
            tracing::info!(
                language = %pool.language(),
                %worker_id,
                success = result.success,
                duration_ms = duration.as_millis() as u64,
                "execution finished"
            );
            Ok(Execution { result, duration })
        }
        None => {
            tracing::warn!(
                language = %pool.language(),
                %worker_id,
                timeout = ?limits.execution_timeout,
                "execution timed out"
            );
            Err(DispatchError::ExecutionTimeout(limits.execution_timeout))
        }
    }
}
