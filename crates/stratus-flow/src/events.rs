//! Transition events.
//!
//! Every recognized transition, including skips and duplicates, produces an
//! [`Event`]. Events are ephemeral: they are published to the notification
//! sink and never read back by the decision logic. Each event carries
//! routing attributes so downstream consumers can filter on kind, workflow,
//! or collections without deserializing the body.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stratus_core::{ExecutionRef, PayloadId};

use crate::state::PayloadState;

/// The kind of transition an event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A dispatch attempt claimed the identity.
    Claimed,
    /// An execution was confirmed active.
    Started,
    /// The workflow completed successfully.
    Succeeded,
    /// The workflow failed.
    Failed,
    /// The workflow timed out.
    TimedOut,
    /// The payload was judged invalid.
    Invalid,
    /// The workflow was aborted.
    Aborted,
    /// A later occurrence within one batch was dropped.
    Duplicate,
    /// Skipped: the identity is already claimed.
    AlreadyClaimed,
    /// Skipped: an execution is already active.
    AlreadyProcessing,
    /// Skipped: the identity already completed and no replace was requested.
    AlreadyCompleted,
    /// Skipped: the identity is recorded failed.
    AlreadyFailed,
    /// Skipped: the identity is recorded invalid and no replace was
    /// requested.
    AlreadyInvalid,
    /// Skipped: the identity is recorded aborted.
    AlreadyAborted,
    /// A raw message could not be extracted into a candidate document.
    RecordExtractFailed,
    /// A candidate document failed payload validation.
    NotAPayload,
}

impl EventKind {
    /// Returns the wire representation (`claimed`, `already_processing`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Invalid => "invalid",
            Self::Aborted => "aborted",
            Self::Duplicate => "duplicate",
            Self::AlreadyClaimed => "already_claimed",
            Self::AlreadyProcessing => "already_processing",
            Self::AlreadyCompleted => "already_completed",
            Self::AlreadyFailed => "already_failed",
            Self::AlreadyInvalid => "already_invalid",
            Self::AlreadyAborted => "already_aborted",
            Self::RecordExtractFailed => "record_extract_failed",
            Self::NotAPayload => "not_a_payload",
        }
    }

    /// Returns the `already_<state>` skip kind for a stored state.
    #[must_use]
    pub const fn already(state: PayloadState) -> Self {
        match state {
            PayloadState::Claimed => Self::AlreadyClaimed,
            PayloadState::Processing => Self::AlreadyProcessing,
            PayloadState::Completed => Self::AlreadyCompleted,
            PayloadState::Failed => Self::AlreadyFailed,
            PayloadState::Invalid => Self::AlreadyInvalid,
            PayloadState::Aborted => Self::AlreadyAborted,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One announced transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// The payload identity, absent for malformed input that never became
    /// a payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_id: Option<PayloadId>,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
    /// The execution involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionRef>,
    /// Error text, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Blob reference to the offending or oversized raw document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<String>,
}

impl Event {
    /// Creates an event for a known payload identity.
    #[must_use]
    pub fn new(kind: EventKind, payload_id: PayloadId, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            payload_id: Some(payload_id),
            timestamp,
            execution: None,
            error: None,
            blob_ref: None,
        }
    }

    /// Creates an event for malformed input with no payload identity,
    /// pointing at the uploaded raw message.
    #[must_use]
    pub fn malformed(
        kind: EventKind,
        blob_ref: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            payload_id: None,
            timestamp,
            execution: None,
            error: None,
            blob_ref: Some(blob_ref.into()),
        }
    }

    /// Attaches the execution reference.
    #[must_use]
    pub fn with_execution(mut self, execution: ExecutionRef) -> Self {
        self.execution = Some(execution);
        self
    }

    /// Attaches error text.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Returns the routing attributes for downstream filtering.
    ///
    /// Always includes `event_kind`; includes `workflow` and `collections`
    /// when an identity is present and `error` when error text is present.
    #[must_use]
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        attrs.insert("event_kind".to_string(), self.kind.as_str().to_string());
        if let Some(id) = &self.payload_id {
            attrs.insert("workflow".to_string(), id.workflow().to_string());
            attrs.insert("collections".to_string(), id.collections().to_string());
        }
        if let Some(error) = &self.error {
            attrs.insert("error".to_string(), error.clone());
        }
        attrs
    }
}
