//! Raw message extraction and payload ingestion.
//!
//! Inbound messages arrive wrapped in one level of queue or topic envelope
//! and may carry a blob reference instead of an inline body. Extraction or
//! validation failure is announced as a malformed-input event with the raw
//! message uploaded to blob storage, never a crash: the queue layer must
//! be able to acknowledge a poison message after announcing it.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use ulid::Ulid;

use stratus_core::{BlobStorage, WritePrecondition};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::eventmgr::EventManager;
use crate::payload::Payload;

/// Extracts candidate documents from raw messages and turns them into
/// validated payloads.
pub struct Ingestor {
    blob: Arc<dyn BlobStorage>,
    events: Arc<EventManager>,
    raw_prefix: String,
}

impl Ingestor {
    /// Creates an ingestor from its collaborators.
    #[must_use]
    pub fn new(blob: Arc<dyn BlobStorage>, events: Arc<EventManager>, config: &Config) -> Self {
        Self {
            blob,
            events,
            raw_prefix: format!("{}/raw", config.payload_prefix),
        }
    }

    /// Unwraps one level of envelope and resolves a blob reference.
    ///
    /// Recognized envelopes: a topic delivery `{"Message": "<json>"}` and a
    /// queue delivery `{"body": ...}` (string bodies are parsed as JSON).
    /// A resulting `{"reference": <key>}` document is replaced by the blob
    /// it points at.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for an unparsable body, or a storage
    /// error when a referenced blob cannot be fetched.
    pub async fn extract(&self, raw: &Value) -> Result<Value> {
        let unwrapped = match raw {
            Value::Object(map) => {
                if let Some(message) = map.get("Message") {
                    let text = message.as_str().ok_or_else(|| Error::Serialization {
                        message: "envelope Message is not a string".to_string(),
                    })?;
                    serde_json::from_str(text).map_err(|e| Error::Serialization {
                        message: format!("envelope Message is not JSON: {e}"),
                    })?
                } else if let Some(body) = map.get("body") {
                    match body {
                        Value::String(text) => {
                            serde_json::from_str(text).map_err(|e| Error::Serialization {
                                message: format!("envelope body is not JSON: {e}"),
                            })?
                        }
                        other => other.clone(),
                    }
                } else {
                    raw.clone()
                }
            }
            other => other.clone(),
        };

        if let Some(reference) = unwrapped.get("reference").and_then(Value::as_str) {
            let data = self.blob.get(reference).await?;
            return serde_json::from_slice(&data).map_err(|e| Error::Serialization {
                message: format!("referenced document is not JSON: {e}"),
            });
        }
        Ok(unwrapped)
    }

    /// Ingests one raw message.
    ///
    /// Returns the validated payload, or `None` when the message was
    /// malformed and has been announced (with the raw body uploaded for
    /// inspection).
    ///
    /// # Errors
    ///
    /// Returns an error only when announcing the failure itself fails
    /// (blob upload or notification publish).
    pub async fn ingest(&self, raw: &Value) -> Result<Option<Payload>> {
        let document = match self.extract(raw).await {
            Ok(document) => document,
            Err(err) => {
                let blob_ref = self.upload_raw(raw).await?;
                warn!(blob_ref, error = %err, "message extraction failed");
                self.events
                    .extract_failed(&blob_ref, &err.to_string(), Utc::now())
                    .await?;
                return Ok(None);
            }
        };

        match Payload::from_json(document) {
            Ok(payload) => Ok(Some(payload)),
            Err(err) => {
                let blob_ref = self.upload_raw(raw).await?;
                warn!(blob_ref, error = %err, "document is not a payload");
                self.events
                    .not_a_payload(&blob_ref, &err.to_string(), Utc::now())
                    .await?;
                Ok(None)
            }
        }
    }

    async fn upload_raw(&self, raw: &Value) -> Result<String> {
        let key = format!("{}/{}.json", self.raw_prefix, Ulid::new());
        let body = serde_json::to_vec(raw).map_err(|e| Error::Serialization {
            message: format!("raw message: {e}"),
        })?;
        self.blob
            .put(&key, Bytes::from(body), WritePrecondition::None)
            .await?;
        Ok(key)
    }
}
