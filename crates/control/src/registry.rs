use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::{ResultMessage, WorkerId};

/// Worker id to private reply channel, one entry per live worker.
#[derive(Clone, Default)]
pub struct Registry {
    entries: Arc<Mutex<HashMap<WorkerId, mpsc::Sender<ResultMessage>>>>,
}

/// What happened to a reply handed to [`Registry::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No live worker with that id, typically one already cleaned up.
    Unknown,
    /// The worker already received its one reply.
    Duplicate,
}

impl Registry {
    /// Registers `worker_id` and returns the receiving half of its reply channel.
    pub fn register(&self, worker_id: &WorkerId) -> mpsc::Receiver<ResultMessage> {
        let (sender, receiver) = mpsc::channel(1);
        self.entries.lock().insert(worker_id.clone(), sender);
        receiver
    }

    pub fn remove(&self, worker_id: &str) -> bool {
        self.entries.lock().remove(worker_id).is_some()
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.entries.lock().contains_key(worker_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Non-blocking hand-off of a reply to the worker that owns `worker_id`.
    pub fn deliver(&self, worker_id: &str, reply: ResultMessage) -> Delivery {
        let entries = self.entries.lock();
        let Some(sender) = entries.get(worker_id) else {
            return Delivery::Unknown;
        };
        match sender.try_send(reply) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Duplicate,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(output: &str) -> ResultMessage {
        ResultMessage {
            success: true,
            output: output.to_owned(),
            ..ResultMessage::default()
        }
    }

    #[tokio::test]
    async fn delivers_exactly_one_reply_per_worker() {
        let registry = Registry::default();
        let id = WorkerId::from("w1");
        let mut replies = registry.register(&id);

        assert_eq!(registry.deliver("w1", reply("first")), Delivery::Delivered);
        assert_eq!(registry.deliver("w1", reply("second")), Delivery::Duplicate);

        assert_eq!(replies.recv().await.unwrap().output, "first");
        assert!(replies.try_recv().is_err());
    }

    #[test]
    fn unknown_and_removed_ids_are_reported() {
        let registry = Registry::default();
        assert_eq!(registry.deliver("ghost", reply("x")), Delivery::Unknown);

        let id = WorkerId::from("w2");
        let _replies = registry.register(&id);
        assert!(registry.contains("w2"));
        assert!(registry.remove("w2"));
        assert!(!registry.remove("w2"));
        assert_eq!(registry.deliver("w2", reply("late")), Delivery::Unknown);
        assert!(registry.is_empty());
    }

    #[test]
    fn dropped_receiver_counts_as_unknown() {
        let registry = Registry::default();
        let id = WorkerId::from("w3");
        drop(registry.register(&id));
        assert_eq!(registry.deliver("w3", reply("x")), Delivery::Unknown);
        assert_eq!(registry.len(), 1);
    }
}
