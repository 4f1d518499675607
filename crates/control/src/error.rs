use std::time::Duration;

use thiserror::Error;

use crate::protocol::Language;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("declaring queue {queue} failed: {reason}")]
    Declare { queue: String, reason: String },
    #[error("deleting queue {queue} failed: {reason}")]
    Delete { queue: String, reason: String },
    #[error("publishing to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },
    #[error("consuming {queue} failed: {reason}")]
    Consume { queue: String, reason: String },
    #[error("queue {0} does not exist")]
    QueueNotFound(String),
    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("connecting to docker failed: {0}")]
    Connect(#[source] bollard::errors::Error),
    #[error("docker {operation} for {name} failed: {source}")]
    Docker {
        operation: &'static str,
        name: String,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("sandbox {name} stopped before becoming ready")]
    Exited { name: String },
    #[error("sandbox {name} not ready after {timeout:?}")]
    NotReady { name: String, timeout: Duration },
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("job queue setup failed: {0}")]
    Queue(#[from] BrokerError),
    #[error("sandbox creation failed: {0}")]
    Sandbox(#[from] OrchestratorError),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool capacity must be at least 1")]
    ZeroCapacity,
    #[error("{language} pool bootstrap failed on worker {index} of {capacity}: {source}")]
    Bootstrap {
        language: Language,
        index: usize,
        capacity: usize,
        #[source]
        source: ProvisionError,
    },
    #[error("no worker became available within {0:?}")]
    AcquireTimeout(Duration),
    #[error("pool is shut down")]
    Closed,
    #[error("reply queue setup failed: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no {0} pool is running")]
    UnsupportedLanguage(Language),
    #[error("no worker became available within {0:?}")]
    AcquireTimeout(Duration),
    #[error("worker did not reply within {0:?}")]
    ExecutionTimeout(Duration),
    #[error("publishing job failed: {0}")]
    Publish(#[source] BrokerError),
    #[error("pool is shut down")]
    PoolClosed,
}

impl From<PoolError> for DispatchError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::AcquireTimeout(deadline) => Self::AcquireTimeout(deadline),
            _ => Self::PoolClosed,
        }
    }
}
