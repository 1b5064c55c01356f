//! Work queue abstraction.
//!
//! Chained payloads produced by completion handling re-enter the pipeline
//! through this queue. The queue carries opaque JSON documents; oversized
//! bodies are offloaded to blob storage before enqueueing.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Acknowledgement of one enqueued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// The identifier the queue assigned to the message.
    pub message_id: String,
}

/// Accepts work messages for later delivery.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues one message.
    async fn enqueue(&self, message: Value) -> Result<EnqueueOutcome>;
}

/// One message held by the in-memory queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// The assigned message identifier.
    pub id: String,
    /// The message body.
    pub body: Value,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("work queue lock poisoned")
}

/// In-memory FIFO queue for tests.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    messages: Mutex<VecDeque<QueuedMessage>>,
}

impl InMemoryWorkQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the oldest message, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn pop(&self) -> Result<Option<QueuedMessage>> {
        let message = self.messages.lock().map_err(poison_err)?.pop_front();
        Ok(message)
    }

    /// Returns a snapshot of all queued messages in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn messages(&self) -> Result<Vec<QueuedMessage>> {
        let messages = self.messages.lock().map_err(poison_err)?;
        let all = messages.iter().cloned().collect();
        drop(messages);
        Ok(all)
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, message: Value) -> Result<EnqueueOutcome> {
        let id = Ulid::new().to_string();
        self.messages.lock().map_err(poison_err)?.push_back(QueuedMessage {
            id: id.clone(),
            body: message,
        });
        Ok(EnqueueOutcome { message_id: id })
    }
}
