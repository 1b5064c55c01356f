//! Notification sink abstraction.
//!
//! The sink accepts batches of (body, routing-attributes) messages; nothing
//! is consumed from it beyond the success or failure of the batch call.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::events::Event;

/// One outbound message: a serialized event body plus routing attributes.
#[derive(Debug, Clone)]
pub struct Notification {
    /// The serialized event document.
    pub body: Value,
    /// Routing attributes for filtering without body deserialization.
    pub attributes: BTreeMap<String, String>,
}

impl Notification {
    /// Builds a notification from an event.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the event cannot be serialized.
    pub fn from_event(event: &Event) -> Result<Self> {
        let body = serde_json::to_value(event).map_err(|e| Error::Serialization {
            message: format!("event body: {e}"),
        })?;
        Ok(Self {
            body,
            attributes: event.attributes(),
        })
    }
}

/// Publishes notification batches.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Publishes one batch. All-or-nothing from the caller's view.
    async fn publish_batch(&self, batch: &[Notification]) -> Result<()>;
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("notification sink lock poisoned")
}

/// In-memory sink for tests. Records every published batch.
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    batches: RwLock<Vec<Vec<Notification>>>,
}

impl InMemoryNotificationSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded batches in publish order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn batches(&self) -> Result<Vec<Vec<Notification>>> {
        let batches = self.batches.read().map_err(poison_err)?.clone();
        Ok(batches)
    }

    /// Returns all published notifications, flattened in publish order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published(&self) -> Result<Vec<Notification>> {
        let batches = self.batches.read().map_err(poison_err)?;
        let all = batches.iter().flatten().cloned().collect();
        drop(batches);
        Ok(all)
    }

    /// Returns the `event_kind` attribute of every published notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn published_kinds(&self) -> Result<Vec<String>> {
        let kinds = self
            .published()?
            .iter()
            .filter_map(|n| n.attributes.get("event_kind").cloned())
            .collect();
        Ok(kinds)
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn publish_batch(&self, batch: &[Notification]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.batches.write().map_err(poison_err)?.push(batch.to_vec());
        Ok(())
    }
}
