//! Persistent state for payload identities.
//!
//! The [`StateStore`] keeps one record per payload identity and is the
//! **only** synchronization point in the pipeline: there is no client-side
//! locking, no leader election, and no local mutex protecting an identity.
//! Cross-worker correctness is delegated entirely to the store's
//! conditional-write predicates, which implementations must evaluate
//! atomically against their current committed value.
//!
//! ## Design Principles
//!
//! - **Typed conditional outcomes**: a claim or confirmation losing its race
//!   returns [`ClaimOutcome::AlreadyActive`] / [`ConfirmOutcome::Rejected`],
//!   never an error - callers must branch on every case
//! - **First-writer-wins creation**: `created` is set once and never
//!   overwritten
//! - **Append-only executions**: the executions list only grows

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use stratus_core::{ExecutionRef, PayloadId};

use crate::error::Result;

/// The lifecycle state of a payload identity.
///
/// `Claimed → Processing → {Completed | Failed | Invalid | Aborted}`.
/// `Failed`, `Aborted`, and `Claimed` are re-enterable: a later attempt may
/// claim again. `Completed` and `Invalid` are terminal unless an explicit
/// replace is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadState {
    /// Provisionally reserved by one dispatch attempt.
    Claimed,
    /// A workflow execution is confirmed active.
    Processing,
    /// The workflow completed successfully.
    Completed,
    /// The workflow failed; re-enterable.
    Failed,
    /// The payload was judged invalid; terminal.
    Invalid,
    /// The workflow was aborted; re-enterable.
    Aborted,
}

impl PayloadState {
    /// Returns the wire/index representation (`CLAIMED`, `PROCESSING`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Claimed => "CLAIMED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Invalid => "INVALID",
            Self::Aborted => "ABORTED",
        }
    }

    /// Returns true if a later attempt may claim this identity again
    /// without an explicit replace.
    #[must_use]
    pub const fn is_reenterable(self) -> bool {
        matches!(self, Self::Claimed | Self::Failed | Self::Aborted)
    }

    /// Returns true if another dispatch attempt is currently active.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Claimed | Self::Processing)
    }
}

impl fmt::Display for PayloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per payload identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    /// The payload identity this record tracks.
    pub payload_id: PayloadId,
    /// Current state.
    pub state: PayloadState,
    /// When the current state was entered.
    pub state_updated_at: DateTime<Utc>,
    /// First time this identity was seen. Set once, never overwritten.
    pub created: DateTime<Utc>,
    /// Last modification time.
    pub updated: DateTime<Utc>,
    /// Execution references attempted for this identity. Append-only.
    pub executions: Vec<ExecutionRef>,
    /// URLs of produced records, set on completion.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Error text from the last failure/invalidation/timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StateRecord {
    /// Returns the compound state+time value used as a sortable index key.
    ///
    /// Format: `{STATE}_{rfc3339}`, e.g. `PROCESSING_2025-01-15T10:00:00Z`.
    #[must_use]
    pub fn state_updated(&self) -> String {
        format!(
            "{}_{}",
            self.state,
            self.state_updated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    /// Returns the most recently appended execution reference.
    #[must_use]
    pub fn last_execution(&self) -> Option<&ExecutionRef> {
        self.executions.last()
    }

    /// Returns the attempt number the next execution of this identity
    /// would carry.
    #[must_use]
    pub fn next_attempt(&self) -> usize {
        self.executions.len() + 1
    }
}

/// Outcome of a conditional claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claim was applied; this attempt owns the identity.
    Claimed,
    /// The predicate failed: another attempt holds the identity.
    AlreadyActive {
        /// The stored state that blocked the claim.
        state: PayloadState,
        /// The stored executions list at the time of the failed claim.
        executions: Vec<ExecutionRef>,
    },
}

impl ClaimOutcome {
    /// Returns true if the claim was applied.
    #[must_use]
    pub const fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed)
    }
}

/// Outcome of a conditional start confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The record transitioned to `Processing` under this execution.
    Confirmed,
    /// The predicate failed: the state or the executions list no longer
    /// admits this confirmation.
    Rejected {
        /// The stored state at the time of the failed confirmation.
        state: PayloadState,
        /// The stored executions list.
        executions: Vec<ExecutionRef>,
    },
    /// No record exists for the identity.
    NotFound,
}

impl ConfirmOutcome {
    /// Returns true if the confirmation was applied.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed)
    }
}

/// A range query over one `collections_workflow` partition.
#[derive(Debug, Clone)]
pub struct StateQuery {
    /// Partition to query (`<collections>/workflow-<name>`).
    pub collections_workflow: String,
    /// Restrict to one state; selects the state+time compound index.
    pub state: Option<PayloadState>,
    /// Inclusive lower bound on `updated`.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `updated`.
    pub until: Option<DateTime<Utc>>,
    /// Keep only rows whose `last_error` starts with this prefix.
    pub error_prefix: Option<String>,
    /// Sort direction over the selected index.
    pub ascending: bool,
    /// Maximum number of rows per page.
    pub limit: usize,
    /// Continuation token from the previous page.
    pub page_token: Option<PageToken>,
}

impl StateQuery {
    /// Creates a query over a partition with defaults: no filters,
    /// descending, limit 100.
    #[must_use]
    pub fn new(collections_workflow: impl Into<String>) -> Self {
        Self {
            collections_workflow: collections_workflow.into(),
            state: None,
            since: None,
            until: None,
            error_prefix: None,
            ascending: false,
            limit: 100,
            page_token: None,
        }
    }

    /// Restricts the query to one state.
    #[must_use]
    pub const fn with_state(mut self, state: PayloadState) -> Self {
        self.state = Some(state);
        self
    }

    /// Bounds the query to `updated` within `[since, until]`.
    #[must_use]
    pub const fn with_time_range(
        mut self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    /// Keeps only rows whose `last_error` starts with the prefix.
    #[must_use]
    pub fn with_error_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.error_prefix = Some(prefix.into());
        self
    }

    /// Sets the sort direction.
    #[must_use]
    pub const fn with_ascending(mut self, ascending: bool) -> Self {
        self.ascending = ascending;
        self
    }

    /// Sets the page size.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Resumes from a continuation token.
    #[must_use]
    pub fn with_page_token(mut self, token: PageToken) -> Self {
        self.page_token = Some(token);
        self
    }
}

/// Continuation token: the primary+secondary key values of the last row
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageToken {
    /// The sort-index key of the last row (`state_updated` or `updated`).
    pub sort_key: String,
    /// The `item_ids` component of the last row.
    pub item_ids: String,
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct Page {
    /// Records in the requested order.
    pub records: Vec<StateRecord>,
    /// Continuation token, present when more rows remain.
    pub next: Option<PageToken>,
}

/// Result of a capped count.
///
/// `AtLeast(n)` is returned when the scan hit the cap without exhausting
/// the partition; it formats as `"{n}+"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    /// The partition was scanned to the end.
    Exact(u64),
    /// The scan stopped at the cap; at least this many rows match.
    AtLeast(u64),
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(n) => write!(f, "{n}"),
            Self::AtLeast(n) => write!(f, "{n}+"),
        }
    }
}

/// Durable keyed storage for payload state.
///
/// Implementations must evaluate conditional-write predicates atomically
/// against the current committed value; a predicate failure is a normal
/// outcome, a store-level failure is an `Err` and is always raised.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Gets the record for one identity, if any.
    async fn get(&self, id: &PayloadId) -> Result<Option<StateRecord>>;

    /// Gets records for a batch of identities, in input order.
    async fn batch_get(&self, ids: &[PayloadId]) -> Result<Vec<Option<StateRecord>>>;

    /// Conditionally claims an identity for one dispatch attempt.
    ///
    /// Succeeds only if the current state is neither `Processing` nor
    /// `Claimed` (or no record exists). On success sets state=`Claimed`,
    /// appends `execution` to the executions list, and sets `created` if
    /// absent.
    async fn claim(
        &self,
        id: &PayloadId,
        execution: &ExecutionRef,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome>;

    /// Conditionally confirms that an execution has started.
    ///
    /// Succeeds only if the current state is `Claimed` or `Processing`
    /// **and** `execution` is present in the stored executions list. On
    /// success sets state=`Processing`.
    async fn confirm_started(
        &self,
        id: &PayloadId,
        execution: &ExecutionRef,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome>;

    /// Unconditionally marks an identity completed, recording outputs.
    async fn complete(
        &self,
        id: &PayloadId,
        outputs: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Unconditionally marks an identity failed, recording the error.
    async fn fail(&self, id: &PayloadId, message: &str, now: DateTime<Utc>) -> Result<()>;

    /// Unconditionally marks an identity invalid, recording the reason.
    async fn invalidate(&self, id: &PayloadId, message: &str, now: DateTime<Utc>) -> Result<()>;

    /// Unconditionally marks an identity aborted.
    async fn abort(&self, id: &PayloadId, now: DateTime<Utc>) -> Result<()>;

    /// Range query over a partition's secondary index, with pagination.
    ///
    /// State-filtered queries use the state+time compound index
    /// (`state_updated`); unfiltered or time-range queries use the
    /// `updated` index.
    async fn query(&self, query: &StateQuery) -> Result<Page>;

    /// Counts rows matching the query, scanning at most `cap` rows.
    async fn count(&self, query: &StateQuery, cap: u64) -> Result<Count>;
}
