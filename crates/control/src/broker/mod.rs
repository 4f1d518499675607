//! Message broker seam.
//!
//! Queues are non-durable and go away once unused; nothing published here
//! survives a broker restart. Messages always travel through the default
//! exchange, so the queue name is the routing key.

mod amqp;
mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Stream of messages from one queue. Dropping it cancels the consumer.
pub type Deliveries = mpsc::UnboundedReceiver<Envelope>;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Address handed to sandboxes so they can reach the same broker.
    fn url(&self) -> &str;

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), BrokerError>;

    /// Messages are acknowledged on delivery.
    async fn consume(&self, queue: &str) -> Result<Deliveries, BrokerError>;
}
