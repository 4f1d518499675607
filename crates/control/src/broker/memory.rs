use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Broker, Deliveries, Envelope};
use crate::error::BrokerError;

/// In-process broker with the same queue semantics as the AMQP one.
///
/// Used by tests and by embedders that run sandboxes inside the same process.
#[derive(Clone)]
pub struct MemoryBroker {
    url: String,
    queues: Arc<Mutex<HashMap<String, MemoryQueue>>>,
    fail_publishes: Arc<AtomicBool>,
}

#[derive(Default)]
struct MemoryQueue {
    backlog: VecDeque<Envelope>,
    consumers: Vec<mpsc::UnboundedSender<Envelope>>,
    next_consumer: usize,
}

impl MemoryQueue {
    fn deliver(&mut self, mut envelope: Envelope) {
        self.consumers.retain(|consumer| !consumer.is_closed());
        while !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            self.next_consumer = self.next_consumer.wrapping_add(1);
            match self.consumers[index].send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    envelope = returned;
                    self.consumers.remove(index);
                }
            }
        }
        self.backlog.push_back(envelope);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            url: "memory://local".to_owned(),
            queues: Arc::new(Mutex::new(HashMap::new())),
            fail_publishes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every publish fail, as if the broker were unreachable.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.lock().keys().cloned().collect()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.lock().contains_key(queue)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, |queue| {
            queue
                .consumers
                .iter()
                .filter(|consumer| !consumer.is_closed())
                .count()
        })
    }

    pub fn backlog_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map_or(0, |queue| queue.backlog.len())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn url(&self) -> &str {
        &self.url
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.queues.lock().entry(queue.to_owned()).or_default();
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.queues.lock().remove(queue);
        Ok(())
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), BrokerError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish {
                queue: queue.to_owned(),
                reason: "broker unreachable".to_owned(),
            });
        }
        let mut queues = self.queues.lock();
        let target = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_owned()))?;
        target.deliver(envelope);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries, BrokerError> {
        let mut queues = self.queues.lock();
        let target = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_owned()))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        while let Some(envelope) = target.backlog.pop_front() {
            if let Err(mpsc::error::SendError(envelope)) = sender.send(envelope) {
                target.backlog.push_front(envelope);
                break;
            }
        }
        target.consumers.push(sender);
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backlog_is_flushed_to_first_consumer() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs").await.unwrap();
        broker
            .publish("jobs", Envelope::new(b"one".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.backlog_len("jobs"), 1);

        let mut deliveries = broker.consume("jobs").await.unwrap();
        let envelope = deliveries.recv().await.unwrap();
        assert_eq!(envelope.body, b"one");
        assert_eq!(broker.backlog_len("jobs"), 0);
    }

    #[tokio::test]
    async fn publish_to_missing_queue_fails() {
        let broker = MemoryBroker::new();
        let err = broker
            .publish("nowhere", Envelope::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QueueNotFound(queue) if queue == "nowhere"));
    }

    #[tokio::test]
    async fn dropped_consumer_does_not_swallow_messages() {
        let broker = MemoryBroker::new();
        broker.declare_queue("replies").await.unwrap();
        let first = broker.consume("replies").await.unwrap();
        let mut second = broker.consume("replies").await.unwrap();
        drop(first);
        assert_eq!(broker.consumer_count("replies"), 1);

        broker
            .publish(
                "replies",
                Envelope::new(b"x".to_vec()).with_correlation_id("w1"),
            )
            .await
            .unwrap();
        let envelope = second.recv().await.unwrap();
        assert_eq!(envelope.correlation_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn failing_publishes_surface_errors() {
        let broker = MemoryBroker::new();
        broker.declare_queue("jobs").await.unwrap();
        broker.fail_publishes(true);
        assert!(broker.publish("jobs", Envelope::default()).await.is_err());
        broker.fail_publishes(false);
        assert!(broker.publish("jobs", Envelope::default()).await.is_ok());
    }
}
