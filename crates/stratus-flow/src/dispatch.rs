//! The claim/dispatch state machine.
//!
//! One dispatch attempt moves a payload through
//! claim → upload → invoke → confirm. Races are resolved by branching on
//! the store's typed outcomes, never by catching errors:
//!
//! - a `PROCESSING` conflict at claim time is a benign skip,
//! - a `CLAIMED` conflict adopts the stored execution reference (another
//!   caller already decided the execution identity),
//! - a failed confirmation after a successful engine start is announced as
//!   a skip, not raised.
//!
//! Success returns `Ok(Some(identity))`, a benign skip `Ok(None)`; only
//! unresolved failures raise, with [`Error::is_terminal`] separating
//! dead-letter conditions from retryable ones.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use stratus_core::{BlobStorage, ExecutionRef, PayloadId, WritePrecondition};

use crate::config::Config;
use crate::engine::{ExecutionEngine, StartOutcome};
use crate::error::{Error, Result};
use crate::eventmgr::EventManager;
use crate::metrics::{results, FlowMetrics};
use crate::payload::Payload;
use crate::state::{ClaimOutcome, ConfirmOutcome, PayloadState, StateRecord};

/// Dispatches one payload to the execution engine.
pub struct Dispatcher {
    events: Arc<EventManager>,
    engine: Arc<dyn ExecutionEngine>,
    blob: Arc<dyn BlobStorage>,
    config: Config,
    metrics: FlowMetrics,
}

impl Dispatcher {
    /// Creates a dispatcher from its collaborators.
    #[must_use]
    pub fn new(
        events: Arc<EventManager>,
        engine: Arc<dyn ExecutionEngine>,
        blob: Arc<dyn BlobStorage>,
        config: Config,
    ) -> Self {
        Self {
            events,
            engine,
            blob,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Returns the blob key holding the dispatch input for an identity.
    #[must_use]
    pub fn payload_key(&self, id: &PayloadId) -> String {
        format!("{}/{}/input.json", self.config.payload_prefix, id)
    }

    /// Dispatches one payload: claim, upload, invoke, confirm.
    ///
    /// Returns the payload identity on success and `None` on a benign skip
    /// (another attempt is already active, or the record advanced
    /// concurrently).
    ///
    /// # Errors
    ///
    /// - [`Error::WorkflowNotFound`] (terminal) when the engine does not
    ///   know the target; the record is marked failed first.
    /// - [`Error::ClaimContention`] (retryable) when a race could not be
    ///   resolved by adoption.
    /// - Transport and storage failures are re-raised after a best-effort
    ///   failure mark.
    pub async fn dispatch(&self, payload: &Payload) -> Result<Option<PayloadId>> {
        let mut payload = payload.clone();
        payload.validate()?;
        let id = payload.ensure_id()?.clone();
        let workflow = payload.workflow()?.to_string();

        let started_at = std::time::Instant::now();
        let outcome = self.dispatch_inner(&payload, &id, &workflow).await;
        let result_label = match &outcome {
            Ok(Some(_)) => results::STARTED,
            Ok(None) => results::SKIPPED,
            Err(_) => results::FAILED,
        };
        self.metrics.record_dispatch(result_label);
        self.metrics
            .observe_dispatch_duration(result_label, started_at.elapsed());
        outcome
    }

    async fn dispatch_inner(
        &self,
        payload: &Payload,
        id: &PayloadId,
        workflow: &str,
    ) -> Result<Option<PayloadId>> {
        let now = Utc::now();

        // Plan the execution reference from the committed attempt count so
        // a redelivered dispatch computes the same reference.
        let stored = self.events.store().get(id).await?;
        let attempt = stored.as_ref().map_or(1, StateRecord::next_attempt);
        let planned = ExecutionRef::derive(id, attempt);

        let execution = match self.events.claim(id, &planned, now).await? {
            ClaimOutcome::Claimed => planned,
            ClaimOutcome::AlreadyActive { state, executions } => {
                match state {
                    PayloadState::Processing => {
                        debug!(payload_id = %id, "already processing, skipping");
                        self.events.skip(id, state, None, now).await?;
                        return Ok(None);
                    }
                    PayloadState::Claimed => match executions.last() {
                        Some(stored_ref) => {
                            if *stored_ref != planned {
                                // Another caller already decided the
                                // execution identity; adopt it.
                                warn!(
                                    payload_id = %id,
                                    planned = %planned,
                                    adopted = %stored_ref,
                                    "adopting stored execution reference"
                                );
                            }
                            stored_ref.clone()
                        }
                        None => {
                            return Err(Error::ClaimContention {
                                payload_id: id.clone(),
                            })
                        }
                    },
                    // The record raced to another state between the read
                    // and the claim; let the caller's runtime retry.
                    _ => {
                        return Err(Error::ClaimContention {
                            payload_id: id.clone(),
                        })
                    }
                }
            }
        };

        let input = match self.upload_body(payload, id).await {
            Ok(input) => input,
            Err(err) => {
                self.events
                    .failed(id, Some(&execution), &err.to_string(), Utc::now())
                    .await?;
                return Err(err);
            }
        };

        let start = match self.engine.start(workflow, &execution, &input).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.events
                    .failed(id, Some(&execution), &err.to_string(), Utc::now())
                    .await?;
                return Err(err);
            }
        };
        match start {
            StartOutcome::UnknownTarget => {
                let err = Error::WorkflowNotFound {
                    workflow: workflow.to_string(),
                };
                self.events
                    .failed(id, Some(&execution), &err.to_string(), Utc::now())
                    .await?;
                return Err(err);
            }
            StartOutcome::AlreadyExists => {
                debug!(payload_id = %id, execution = %execution, "execution already exists");
            }
            StartOutcome::Started => {}
        }

        match self.events.confirm_started(id, &execution, Utc::now()).await? {
            ConfirmOutcome::Confirmed => {
                info!(payload_id = %id, execution = %execution, workflow, "dispatched");
                Ok(Some(id.clone()))
            }
            ConfirmOutcome::Rejected { state, .. } => {
                // The record advanced concurrently. The engine invocation
                // outcome is captured so the skip is diagnosable.
                let detail = if start == StartOutcome::AlreadyExists {
                    "engine reported existing execution"
                } else {
                    "engine start succeeded"
                };
                warn!(payload_id = %id, state = %state, detail, "confirmation rejected, skipping");
                self.events.skip(id, state, Some(detail), Utc::now()).await?;
                Ok(None)
            }
            ConfirmOutcome::NotFound => Err(Error::ClaimContention {
                payload_id: id.clone(),
            }),
        }
    }

    /// Persists the dispatch input before the engine is invoked, so an
    /// oversized body can always be re-fetched by reference.
    async fn upload_body(&self, payload: &Payload, id: &PayloadId) -> Result<serde_json::Value> {
        let document = payload.to_json()?;
        let body = serde_json::to_vec(&document).map_err(|e| Error::Serialization {
            message: format!("payload body: {e}"),
        })?;
        let key = self.payload_key(id);
        let oversized = body.len() > self.config.inline_payload_limit;
        self.blob
            .put(&key, Bytes::from(body), WritePrecondition::None)
            .await?;

        Ok(if oversized {
            json!({ "reference": key })
        } else {
            document
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryEngine;
    use crate::notify::InMemoryNotificationSink;
    use crate::payload::{ProcessStep, Record, StepEntry};
    use crate::state::memory::InMemoryStateStore;
    use crate::state::StateStore;
    use stratus_core::MemoryBlobStore;

    struct Fixture {
        dispatcher: Dispatcher,
        store: Arc<InMemoryStateStore>,
        engine: Arc<InMemoryEngine>,
        sink: Arc<InMemoryNotificationSink>,
        events: Arc<EventManager>,
    }

    fn fixture() -> Fixture {
        fixture_with_config(Config::default())
    }

    fn fixture_with_config(config: Config) -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(InMemoryNotificationSink::new());
        let engine = Arc::new(InMemoryEngine::with_targets(["wf"]));
        let events = Arc::new(EventManager::new(store.clone(), sink.clone(), &config));
        let dispatcher = Dispatcher::new(
            events.clone(),
            engine.clone(),
            Arc::new(MemoryBlobStore::new()),
            config,
        );
        Fixture {
            dispatcher,
            store,
            engine,
            sink,
            events,
        }
    }

    fn payload(items: &[&str]) -> Payload {
        Payload::new(
            vec![StepEntry::Single(ProcessStep::new("wf"))],
            items.iter().map(|i| Record::new(*i, "X")).collect(),
        )
    }

    #[tokio::test]
    async fn dispatch_happy_path() -> Result<()> {
        let f = fixture();
        let id = f.dispatcher.dispatch(&payload(&["a"])).await?.unwrap();
        assert_eq!(id.to_string(), "X/workflow-wf/a");

        let record = f.store.get(&id).await?.unwrap();
        assert_eq!(record.state, PayloadState::Processing);
        assert_eq!(record.executions.len(), 1);
        assert_eq!(f.engine.started()?.len(), 1);

        f.events.flush().await?;
        assert_eq!(f.sink.published_kinds()?, vec!["claimed", "started"]);
        Ok(())
    }

    #[tokio::test]
    async fn second_dispatch_while_processing_skips() -> Result<()> {
        let f = fixture();
        let p = payload(&["a"]);
        f.dispatcher.dispatch(&p).await?.unwrap();

        let second = f.dispatcher.dispatch(&p).await?;
        assert!(second.is_none());
        assert_eq!(f.engine.started()?.len(), 1);

        f.events.flush().await?;
        assert!(f
            .sink
            .published_kinds()?
            .contains(&"already_processing".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_target_is_terminal_and_marks_failed() -> Result<()> {
        let f = fixture();
        let p = Payload::new(
            vec![StepEntry::Single(ProcessStep::new("missing"))],
            vec![Record::new("a", "X")],
        );

        let err = f.dispatcher.dispatch(&p).await.unwrap_err();
        assert!(err.is_terminal());

        let id: PayloadId = "X/workflow-missing/a".parse().unwrap();
        assert_eq!(f.store.get(&id).await?.unwrap().state, PayloadState::Failed);
        Ok(())
    }

    /// Blob store whose writes always fail, for exercising the upload
    /// error path.
    struct FailingBlobStore;

    #[async_trait::async_trait]
    impl BlobStorage for FailingBlobStore {
        async fn get(&self, path: &str) -> stratus_core::Result<Bytes> {
            Err(stratus_core::Error::NotFound(path.to_string()))
        }

        async fn put(
            &self,
            _path: &str,
            _data: Bytes,
            _precondition: WritePrecondition,
        ) -> stratus_core::Result<stratus_core::WriteResult> {
            Err(stratus_core::Error::storage("blob backend unavailable"))
        }

        async fn delete(&self, _path: &str) -> stratus_core::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn blob_failure_after_claim_marks_failed() -> Result<()> {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(InMemoryNotificationSink::new());
        let config = Config::default();
        let events = Arc::new(EventManager::new(store.clone(), sink.clone(), &config));
        let dispatcher = Dispatcher::new(
            events.clone(),
            Arc::new(InMemoryEngine::with_targets(["wf"])),
            Arc::new(FailingBlobStore),
            config,
        );

        let err = dispatcher.dispatch(&payload(&["a"])).await.unwrap_err();
        assert!(!err.is_terminal());

        let id: PayloadId = "X/workflow-wf/a".parse().unwrap();
        let record = store.get(&id).await?.unwrap();
        assert_eq!(record.state, PayloadState::Failed);
        assert!(record.last_error.is_some());

        events.flush().await?;
        assert_eq!(sink.published_kinds()?, vec!["claimed", "failed"]);
        Ok(())
    }

    #[tokio::test]
    async fn transport_error_is_retryable_and_marks_failed() -> Result<()> {
        let f = fixture();
        f.engine.fail_next_start();

        let err = f.dispatcher.dispatch(&payload(&["a"])).await.unwrap_err();
        assert!(!err.is_terminal());

        let id: PayloadId = "X/workflow-wf/a".parse().unwrap();
        assert_eq!(f.store.get(&id).await?.unwrap().state, PayloadState::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn failed_record_is_reentered_with_new_execution() -> Result<()> {
        let f = fixture();
        f.engine.fail_next_start();
        let p = payload(&["a"]);
        f.dispatcher.dispatch(&p).await.unwrap_err();

        let id = f.dispatcher.dispatch(&p).await?.unwrap();
        let record = f.store.get(&id).await?.unwrap();
        assert_eq!(record.state, PayloadState::Processing);
        assert_eq!(record.executions.len(), 2);
        assert_ne!(record.executions[0], record.executions[1]);
        Ok(())
    }

    #[tokio::test]
    async fn claimed_conflict_adopts_stored_reference() -> Result<()> {
        let f = fixture();
        let id: PayloadId = "X/workflow-wf/a".parse().unwrap();
        // Another caller claimed with an execution ref this dispatcher
        // would not plan (attempt 5).
        let stored = ExecutionRef::derive(&id, 5);
        f.store.claim(&id, &stored, Utc::now()).await?;

        let result = f.dispatcher.dispatch(&payload(&["a"])).await?.unwrap();
        assert_eq!(result, id);

        let started = f.engine.started()?;
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].execution, stored);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_body_dispatches_by_reference() -> Result<()> {
        let config = Config {
            inline_payload_limit: 64,
            ..Config::default()
        };
        let f = fixture_with_config(config);

        f.dispatcher.dispatch(&payload(&["a", "b", "c"])).await?.unwrap();

        let started = f.engine.started()?;
        assert_eq!(
            started[0].input["reference"],
            "payloads/X/workflow-wf/a/b/c/input.json"
        );
        Ok(())
    }

    #[tokio::test]
    async fn payload_body_is_uploaded_before_start() -> Result<()> {
        let blob = Arc::new(MemoryBlobStore::new());
        let store = Arc::new(InMemoryStateStore::new());
        let config = Config::default();
        let events = Arc::new(EventManager::new(
            store,
            Arc::new(InMemoryNotificationSink::new()),
            &config,
        ));
        let dispatcher = Dispatcher::new(
            events,
            Arc::new(InMemoryEngine::with_targets(["wf"])),
            blob.clone(),
            config,
        );

        let id = dispatcher.dispatch(&payload(&["a"])).await?.unwrap();
        let stored = blob.get(&dispatcher.payload_key(&id)).await?;
        let document: serde_json::Value = serde_json::from_slice(&stored).unwrap();
        assert_eq!(document["id"], "X/workflow-wf/a");
        Ok(())
    }
}
