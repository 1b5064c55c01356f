//! Finalizes payload state from the engine's asynchronous completion
//! reports and enqueues the next generation of chained payloads.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use stratus_core::{BlobStorage, WritePrecondition};
use ulid::Ulid;

use crate::config::Config;
use crate::engine::{CompletionReport, CompletionStatus};
use crate::error::{Error, Result};
use crate::eventmgr::EventManager;
use crate::payload::Payload;
use crate::queue::WorkQueue;

/// Error names that mark the input, not the infrastructure, as the
/// problem. A matching failure is recorded `INVALID` instead of `FAILED`
/// so redelivery does not retry it.
fn is_invalid_input(message: &str) -> bool {
    message
        .split(':')
        .next()
        .is_some_and(|name| name.trim().ends_with("InvalidInput"))
}

/// Consumes completion reports and finalizes state through the event
/// manager.
pub struct CompletionHandler {
    events: Arc<EventManager>,
    queue: Arc<dyn WorkQueue>,
    blob: Arc<dyn BlobStorage>,
    config: Config,
}

impl CompletionHandler {
    /// Creates a handler from its collaborators.
    #[must_use]
    pub fn new(
        events: Arc<EventManager>,
        queue: Arc<dyn WorkQueue>,
        blob: Arc<dyn BlobStorage>,
        config: Config,
    ) -> Self {
        Self {
            events,
            queue,
            blob,
            config,
        }
    }

    /// Handles one completion report.
    ///
    /// Success marks the record completed with its output links and
    /// enqueues chained payloads; a failure classified as invalid input
    /// marks the record invalid rather than failed. Buffered events are
    /// flushed before returning.
    ///
    /// # Errors
    ///
    /// Returns an error when the report payload cannot be resolved to a
    /// payload, or when a store, blob, or queue operation fails.
    pub async fn handle(&self, report: &CompletionReport) -> Result<()> {
        let document = self.resolve_document(&report.payload).await?;
        let mut payload = Payload::from_json(document)?;
        let id = payload.ensure_id()?.clone();
        let execution = Some(&report.execution);
        let now = Utc::now();

        match report.status {
            CompletionStatus::Succeeded => {
                let outputs: Vec<String> = payload
                    .records
                    .iter()
                    .filter_map(|record| record.canonical_link().map(str::to_string))
                    .collect();
                self.events.succeeded(&id, execution, outputs, now).await?;
                info!(payload_id = %id, execution = %report.execution, "completed");
                self.enqueue_chained(&payload).await?;
            }
            CompletionStatus::Failed => {
                let message = report
                    .first_error()
                    .unwrap_or_else(|| "unknown error".to_string());
                if is_invalid_input(&message) {
                    self.events.invalid(&id, execution, &message, now).await?;
                } else {
                    self.events.failed(&id, execution, &message, now).await?;
                }
                warn!(payload_id = %id, error = %message, "workflow failed");
            }
            CompletionStatus::Aborted => {
                self.events.aborted(&id, execution, now).await?;
            }
            CompletionStatus::TimedOut => {
                let message = report
                    .first_error()
                    .unwrap_or_else(|| "execution timed out".to_string());
                self.events.timed_out(&id, execution, &message, now).await?;
            }
        }

        self.events.flush().await
    }

    /// Resolves a by-reference report payload through blob storage.
    async fn resolve_document(&self, payload: &Value) -> Result<Value> {
        if let Some(reference) = payload.get("reference").and_then(Value::as_str) {
            let data = self.blob.get(reference).await?;
            return serde_json::from_slice(&data).map_err(|e| Error::Serialization {
                message: format!("referenced completion payload is not JSON: {e}"),
            });
        }
        Ok(payload.clone())
    }

    /// Enqueues the next generation of a completed payload. Oversized
    /// bodies are offloaded to blob storage and enqueued by reference.
    async fn enqueue_chained(&self, payload: &Payload) -> Result<()> {
        for next in payload.next_payloads() {
            let document = next.to_json()?;
            let body = serde_json::to_vec(&document).map_err(|e| Error::Serialization {
                message: format!("chained payload: {e}"),
            })?;
            let message = if body.len() > self.config.inline_payload_limit {
                let key = format!("{}/chained/{}.json", self.config.payload_prefix, Ulid::new());
                self.blob
                    .put(&key, Bytes::from(body), WritePrecondition::None)
                    .await?;
                json!({ "reference": key })
            } else {
                document
            };
            self.queue.enqueue(message).await?;
        }
        Ok(())
    }
}
