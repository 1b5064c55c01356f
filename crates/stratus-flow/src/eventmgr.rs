//! The event manager: single choke point for every recognized transition.
//!
//! Each semantic operation performs, in order:
//!
//! 1. the state-store mutation,
//! 2. an optional timeseries record (reporting-only, failures are logged
//!    and swallowed),
//! 3. an [`Event`] pushed to a batched notification buffer.
//!
//! The buffer flushes in fixed-size groups and must be flushed explicitly
//! at the end of a processing unit with [`EventManager::flush`]; the buffer
//! is invocation-local, so an unflushed event is a lost event.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use stratus_core::{ExecutionRef, PayloadId};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind};
use crate::metrics::FlowMetrics;
use crate::notify::{Notification, NotificationSink};
use crate::state::{ClaimOutcome, ConfirmOutcome, PayloadState, StateStore};
use crate::timeseries::{TimeseriesRecord, TimeseriesSink};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("event buffer lock poisoned")
}

/// Announces transitions to the store, the timeseries sink, and the
/// notification sink.
pub struct EventManager {
    store: Arc<dyn StateStore>,
    notifications: Arc<dyn NotificationSink>,
    timeseries: Option<Arc<dyn TimeseriesSink>>,
    timeseries_enabled: bool,
    metrics: FlowMetrics,
    batch_size: usize,
    buffer: Mutex<Vec<Event>>,
}

impl EventManager {
    /// Creates an event manager without a timeseries sink.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        notifications: Arc<dyn NotificationSink>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            notifications,
            timeseries: None,
            timeseries_enabled: config.timeseries_enabled,
            metrics: FlowMetrics::new(),
            batch_size: config.notification_batch_size.max(1),
            buffer: Mutex::new(Vec::new()),
        }
    }

    /// Attaches a timeseries sink. Ignored unless the configuration has
    /// [`Config::timeseries_enabled`] set.
    #[must_use]
    pub fn with_timeseries(mut self, sink: Arc<dyn TimeseriesSink>) -> Self {
        if self.timeseries_enabled {
            self.timeseries = Some(sink);
        } else {
            debug!("timeseries disabled, sink not attached");
        }
        self
    }

    /// Returns the state store this manager writes through.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Conditionally claims an identity. On success announces `claimed`.
    ///
    /// # Errors
    ///
    /// Returns an error on a store-level failure; a lost race is a normal
    /// [`ClaimOutcome::AlreadyActive`] outcome.
    pub async fn claim(
        &self,
        id: &PayloadId,
        execution: &ExecutionRef,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let outcome = self.store.claim(id, execution, now).await?;
        if outcome.is_claimed() {
            self.record(id, PayloadState::Claimed, Some(execution), now).await;
            self.push(Event::new(EventKind::Claimed, id.clone(), now).with_execution(execution.clone()))
                .await?;
        }
        Ok(outcome)
    }

    /// Conditionally confirms a start. On success announces `started`.
    ///
    /// # Errors
    ///
    /// Returns an error on a store-level failure; a failed predicate is a
    /// normal [`ConfirmOutcome`] variant.
    pub async fn confirm_started(
        &self,
        id: &PayloadId,
        execution: &ExecutionRef,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome> {
        let outcome = self.store.confirm_started(id, execution, now).await?;
        if outcome.is_confirmed() {
            self.record(id, PayloadState::Processing, Some(execution), now).await;
            self.push(Event::new(EventKind::Started, id.clone(), now).with_execution(execution.clone()))
                .await?;
        }
        Ok(outcome)
    }

    /// Marks an identity completed and announces `succeeded`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write or the buffer flush fails.
    pub async fn succeeded(
        &self,
        id: &PayloadId,
        execution: Option<&ExecutionRef>,
        outputs: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.complete(id, outputs, now).await?;
        self.record(id, PayloadState::Completed, execution, now).await;
        let mut event = Event::new(EventKind::Succeeded, id.clone(), now);
        if let Some(execution) = execution {
            event = event.with_execution(execution.clone());
        }
        self.push(event).await
    }

    /// Marks an identity failed and announces `failed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write or the buffer flush fails.
    pub async fn failed(
        &self,
        id: &PayloadId,
        execution: Option<&ExecutionRef>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.fail_as(EventKind::Failed, id, execution, message, now).await
    }

    /// Marks an identity failed and announces `timed_out`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write or the buffer flush fails.
    pub async fn timed_out(
        &self,
        id: &PayloadId,
        execution: Option<&ExecutionRef>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.fail_as(EventKind::TimedOut, id, execution, message, now).await
    }

    async fn fail_as(
        &self,
        kind: EventKind,
        id: &PayloadId,
        execution: Option<&ExecutionRef>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.fail(id, message, now).await?;
        self.record(id, PayloadState::Failed, execution, now).await;
        let mut event = Event::new(kind, id.clone(), now).with_error(message);
        if let Some(execution) = execution {
            event = event.with_execution(execution.clone());
        }
        self.push(event).await
    }

    /// Marks an identity invalid and announces `invalid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write or the buffer flush fails.
    pub async fn invalid(
        &self,
        id: &PayloadId,
        execution: Option<&ExecutionRef>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.invalidate(id, message, now).await?;
        self.record(id, PayloadState::Invalid, execution, now).await;
        let mut event = Event::new(EventKind::Invalid, id.clone(), now).with_error(message);
        if let Some(execution) = execution {
            event = event.with_execution(execution.clone());
        }
        self.push(event).await
    }

    /// Marks an identity aborted and announces `aborted`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write or the buffer flush fails.
    pub async fn aborted(
        &self,
        id: &PayloadId,
        execution: Option<&ExecutionRef>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.abort(id, now).await?;
        self.record(id, PayloadState::Aborted, execution, now).await;
        let mut event = Event::new(EventKind::Aborted, id.clone(), now);
        if let Some(execution) = execution {
            event = event.with_execution(execution.clone());
        }
        self.push(event).await
    }

    /// Announces a within-batch duplicate. No store write.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer flush fails.
    pub async fn duplicate(&self, id: &PayloadId, now: DateTime<Utc>) -> Result<()> {
        self.push(Event::new(EventKind::Duplicate, id.clone(), now)).await
    }

    /// Announces an `already_<state>` skip. No store write.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer flush fails.
    pub async fn skip(
        &self,
        id: &PayloadId,
        state: PayloadState,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut event = Event::new(EventKind::already(state), id.clone(), now);
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.push(event).await
    }

    /// Announces a message that could not be extracted. No store write,
    /// no identity; the event points at the uploaded raw message.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer flush fails.
    pub async fn extract_failed(
        &self,
        blob_ref: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.push(Event::malformed(EventKind::RecordExtractFailed, blob_ref, now).with_error(error))
            .await
    }

    /// Announces a document that failed payload validation. No store
    /// write, no identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer flush fails.
    pub async fn not_a_payload(
        &self,
        blob_ref: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.push(Event::malformed(EventKind::NotAPayload, blob_ref, now).with_error(error))
            .await
    }

    /// Flushes all buffered events, in groups of the configured batch size.
    ///
    /// Call at the end of every processing unit.
    ///
    /// # Errors
    ///
    /// Returns an error if a publish fails; unpublished events stay
    /// buffered for a retry.
    pub async fn flush(&self) -> Result<()> {
        loop {
            let batch = {
                let mut buffer = self.buffer.lock().map_err(poison_err)?;
                if buffer.is_empty() {
                    return Ok(());
                }
                let take = buffer.len().min(self.batch_size);
                buffer.drain(..take).collect::<Vec<_>>()
            };
            if let Err(err) = self.publish(&batch).await {
                let mut buffer = self.buffer.lock().map_err(poison_err)?;
                let mut restored = batch;
                restored.extend(buffer.drain(..));
                *buffer = restored;
                return Err(err);
            }
        }
    }

    async fn push(&self, event: Event) -> Result<()> {
        self.metrics.record_event(event.kind.as_str());
        let full = {
            let mut buffer = self.buffer.lock().map_err(poison_err)?;
            buffer.push(event);
            if buffer.len() >= self.batch_size {
                Some(buffer.drain(..self.batch_size).collect::<Vec<_>>())
            } else {
                None
            }
        };
        if let Some(batch) = full {
            self.publish(&batch).await?;
        }
        Ok(())
    }

    async fn publish(&self, batch: &[Event]) -> Result<()> {
        let notifications = batch
            .iter()
            .map(Notification::from_event)
            .collect::<Result<Vec<_>>>()?;
        self.notifications.publish_batch(&notifications).await
    }

    /// Timeseries write; reporting-only, so a failure is logged and
    /// swallowed.
    async fn record(
        &self,
        id: &PayloadId,
        state: PayloadState,
        execution: Option<&ExecutionRef>,
        now: DateTime<Utc>,
    ) {
        self.metrics.record_transition(state.as_str());
        if let Some(sink) = &self.timeseries {
            let record = TimeseriesRecord::for_transition(id, state, execution, now);
            if let Err(err) = sink.record(record).await {
                warn!(payload_id = %id, state = %state, error = %err, "timeseries record failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::InMemoryNotificationSink;
    use crate::state::memory::InMemoryStateStore;
    use crate::timeseries::InMemoryTimeseriesSink;

    fn manager(
        batch_size: usize,
    ) -> (
        EventManager,
        Arc<InMemoryStateStore>,
        Arc<InMemoryNotificationSink>,
        Arc<InMemoryTimeseriesSink>,
    ) {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(InMemoryNotificationSink::new());
        let timeseries = Arc::new(InMemoryTimeseriesSink::new());
        let config = Config {
            notification_batch_size: batch_size,
            timeseries_enabled: true,
            ..Config::default()
        };
        let manager = EventManager::new(store.clone(), sink.clone(), &config)
            .with_timeseries(timeseries.clone());
        (manager, store, sink, timeseries)
    }

    fn id(item: &str) -> PayloadId {
        format!("X/workflow-wf/{item}").parse().unwrap()
    }

    #[tokio::test]
    async fn claim_writes_store_and_announces() -> Result<()> {
        let (manager, store, sink, timeseries) = manager(10);
        let identity = id("a");
        let exec = ExecutionRef::derive(&identity, 1);
        let now = Utc::now();

        let outcome = manager.claim(&identity, &exec, now).await?;
        assert!(outcome.is_claimed());
        assert_eq!(
            store.get(&identity).await?.unwrap().state,
            PayloadState::Claimed
        );
        assert_eq!(timeseries.records()?.len(), 1);

        // Buffered until an explicit flush.
        assert!(sink.published()?.is_empty());
        manager.flush().await?;
        assert_eq!(sink.published_kinds()?, vec!["claimed"]);
        Ok(())
    }

    #[tokio::test]
    async fn lost_claim_announces_nothing() -> Result<()> {
        let (manager, _store, sink, timeseries) = manager(10);
        let identity = id("a");
        let now = Utc::now();

        manager.claim(&identity, &ExecutionRef::derive(&identity, 1), now).await?;
        let lost = manager
            .claim(&identity, &ExecutionRef::derive(&identity, 2), now)
            .await?;
        assert!(!lost.is_claimed());

        manager.flush().await?;
        assert_eq!(sink.published_kinds()?, vec!["claimed"]);
        assert_eq!(timeseries.records()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn buffer_flushes_in_fixed_groups() -> Result<()> {
        let (manager, _store, sink, _timeseries) = manager(3);
        let now = Utc::now();
        for item in ["a", "b", "c", "d", "e", "f", "g"] {
            manager.duplicate(&id(item), now).await?;
        }

        // Two full groups published on the way, one partial at flush.
        assert_eq!(sink.batches()?.len(), 2);
        manager.flush().await?;
        let batches = sink.batches()?;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[2].len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn timed_out_marks_failed_state() -> Result<()> {
        let (manager, store, sink, _timeseries) = manager(10);
        let identity = id("a");
        let now = Utc::now();

        manager.timed_out(&identity, None, "States.Timeout", now).await?;
        assert_eq!(
            store.get(&identity).await?.unwrap().state,
            PayloadState::Failed
        );
        manager.flush().await?;
        assert_eq!(sink.published_kinds()?, vec!["timed_out"]);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_events_carry_blob_reference() -> Result<()> {
        let (manager, _store, sink, _timeseries) = manager(10);
        manager
            .not_a_payload("payloads/raw/01ABC", "no process steps", Utc::now())
            .await?;
        manager.flush().await?;

        let published = sink.published()?;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].body["blobRef"], "payloads/raw/01ABC");
        assert!(published[0].body.get("payloadId").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_timeseries_records_nothing() -> Result<()> {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(InMemoryNotificationSink::new());
        let timeseries = Arc::new(InMemoryTimeseriesSink::new());
        // timeseries_enabled defaults to false.
        let manager = EventManager::new(store, sink, &Config::default())
            .with_timeseries(timeseries.clone());

        let identity = id("a");
        manager
            .claim(&identity, &ExecutionRef::derive(&identity, 1), Utc::now())
            .await?;
        assert!(timeseries.records()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn flush_is_idempotent_when_empty() -> Result<()> {
        let (manager, _store, sink, _timeseries) = manager(10);
        manager.flush().await?;
        manager.flush().await?;
        assert!(sink.batches()?.is_empty());
        Ok(())
    }
}
