//! Named bounded FIFO queues shared by all `queue:` endpoints of a component.

use std::sync::Arc;

use dashmap::DashMap;
use mediator_core::{MediationError, Message};
use tokio::sync::{mpsc, Mutex};

/// One point-to-point queue. Competing receivers take turns on the receiver.
pub struct QueueChannel {
    name: String,
    capacity: usize,
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
}

impl QueueChannel {
    fn new(name: String, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            name,
            capacity,
            tx,
            rx: Mutex::new(rx),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next message. Cancel-safe: dropping the future loses
    /// no message.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Number of messages waiting.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

async fn push(channel: &QueueChannel, message: Message) -> Result<(), MediationError> {
    channel
        .tx
        .send(message)
        .await
        .map_err(|_| MediationError::Transport {
            uri: format!("queue:{}", channel.name),
            message: "queue closed".to_string(),
        })
}

/// In-process broker.
///
/// Queues are created on first use and live until deleted.
pub struct QueueBroker {
    queues: DashMap<String, Arc<QueueChannel>>,
    capacity: usize,
}

impl QueueBroker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns the queue, creating it if needed.
    #[must_use]
    pub fn queue(&self, name: &str) -> Arc<QueueChannel> {
        if let Some(existing) = self.queues.get(name) {
            return Arc::clone(existing.value());
        }
        let created = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueChannel::new(name.to_string(), self.capacity)));
        Arc::clone(created.value())
    }

    /// Enqueues a message, creating the queue if needed and waiting for
    /// space if it is full.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the queue's receiver is gone.
    pub async fn send(&self, name: &str, message: Message) -> Result<(), MediationError> {
        push(&self.queue(name), message).await
    }

    /// Enqueues a message only if the queue exists. Used for replies, whose
    /// destination may have been deleted by a requester that gave up.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if there is no such queue.
    pub async fn send_to_existing(
        &self,
        name: &str,
        message: Message,
    ) -> Result<(), MediationError> {
        let channel = self
            .queues
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MediationError::Transport {
                uri: format!("queue:{name}"),
                message: "no such queue".to_string(),
            })?;
        push(&channel, message).await
    }

    /// Creates a uniquely named queue for a single request's reply.
    #[must_use]
    pub fn create_temporary(&self) -> Arc<QueueChannel> {
        let name = format!("temp-{}", uuid::Uuid::new_v4().simple());
        self.queue(&name)
    }

    /// Removes the queue. Messages still in it are dropped once the last
    /// receiver handle goes away.
    pub fn delete(&self, name: &str) -> bool {
        self.queues.remove(name).is_some()
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    #[must_use]
    pub fn depth(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |q| q.depth())
    }

    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let broker = QueueBroker::new(8);
        broker.send("q", Message::new("a")).await.unwrap();
        broker.send("q", Message::new("b")).await.unwrap();
        assert_eq!(broker.depth("q"), 2);

        let queue = broker.queue("q");
        let first = queue.recv().await.unwrap();
        let second = queue.recv().await.unwrap();
        assert_eq!(first.body_ref::<String>().unwrap(), "a");
        assert_eq!(second.body_ref::<String>().unwrap(), "b");
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn send_to_existing_never_creates_queues() {
        let broker = QueueBroker::new(8);
        let temp = broker.create_temporary();
        let name = temp.name().to_string();
        broker.delete(&name);

        let result = broker.send_to_existing(&name, Message::new("late")).await;
        assert!(matches!(result, Err(MediationError::Transport { .. })));
        assert!(broker.queue_names().is_empty());

        broker.queue("replies");
        broker
            .send_to_existing("replies", Message::new("on time"))
            .await
            .unwrap();
        assert_eq!(broker.depth("replies"), 1);
    }

    #[test]
    fn same_name_same_queue() {
        let broker = QueueBroker::new(8);
        assert!(Arc::ptr_eq(&broker.queue("x"), &broker.queue("x")));
    }

    #[test]
    fn temporary_queues_are_unique_and_deletable() {
        let broker = QueueBroker::new(8);
        let a = broker.create_temporary();
        let b = broker.create_temporary();
        assert_ne!(a.name(), b.name());
        assert!(broker.exists(a.name()));
        assert!(broker.delete(a.name()));
        assert!(!broker.exists(a.name()));
    }
}
