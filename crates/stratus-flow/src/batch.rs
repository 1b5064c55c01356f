//! In-order batch deduplication and the dispatch decision policy.
//!
//! A batch is processed sequentially, never in parallel, so duplicate
//! detection is deterministic: the first occurrence of an identity wins
//! dispatch and later occurrences are dropped. Partial failure never rolls
//! back already-started dispatches; the caller acknowledges inbound
//! messages per outcome list.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use stratus_core::PayloadId;

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::eventmgr::EventManager;
use crate::metrics::FlowMetrics;
use crate::payload::Payload;
use crate::state::PayloadState;

/// One dispatch failure within a batch.
#[derive(Debug, Clone)]
pub struct FailedDispatch {
    /// The identity that failed to dispatch.
    pub payload_id: PayloadId,
    /// The error message.
    pub message: String,
    /// True when the error cannot self-resolve; the caller should route
    /// the inbound message to a dead-letter path instead of redelivering.
    pub terminal: bool,
}

/// Per-outcome identity lists for one processed batch.
///
/// Messages for `started` identities are safe to acknowledge; `skipped`
/// and `dropped` identities were handled without a new execution; `failed`
/// identities are left for redelivery or dead-lettering depending on
/// [`FailedDispatch::terminal`].
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Identities for which a new execution was dispatched.
    pub started: Vec<PayloadId>,
    /// Identities skipped by the decision policy or by a benign race.
    pub skipped: Vec<PayloadId>,
    /// Later in-batch occurrences of an already-handled identity.
    pub dropped: Vec<PayloadId>,
    /// Identities whose dispatch raised an error.
    pub failed: Vec<FailedDispatch>,
}

/// Applies the decision policy to a batch of validated payloads and
/// dispatches the ones that need a new execution.
pub struct BatchOrchestrator {
    dispatcher: Arc<Dispatcher>,
    events: Arc<EventManager>,
    metrics: FlowMetrics,
}

impl BatchOrchestrator {
    /// Creates an orchestrator from its collaborators.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, events: Arc<EventManager>) -> Self {
        Self {
            dispatcher,
            events,
            metrics: FlowMetrics::new(),
        }
    }

    /// Processes one batch of validated payloads, in input order.
    ///
    /// Decision policy per payload, first match wins:
    ///
    /// 1. identity already handled in this batch: drop as duplicate;
    /// 2. stored state unknown, `FAILED`, `ABORTED`, or `CLAIMED`, or the
    ///    current step carries `replace`: dispatch;
    /// 3. otherwise (`PROCESSING`, `COMPLETED`, `INVALID`, no replace):
    ///    skip with an `already_<state>` event.
    ///
    /// Buffered events are flushed before returning.
    ///
    /// # Errors
    ///
    /// Returns an error only for a payload that fails validation or
    /// identity derivation (the batch contract is pre-validated payloads)
    /// or for a store-level failure resolving batch state. Per-payload
    /// dispatch errors are collected in [`BatchOutcome::failed`] and do not
    /// interrupt the batch.
    pub async fn process(&self, payloads: Vec<Payload>) -> Result<BatchOutcome> {
        self.metrics.observe_batch_size(payloads.len());

        // Resolve every identity's stored state once, up front. The
        // dispatcher re-checks under the claim predicate, so a stale
        // snapshot here can only cause a skip-or-dispatch decision that
        // the store will correct.
        let mut entries = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let mut payload = payload;
            payload.validate()?;
            let id = payload.ensure_id()?.clone();
            entries.push((id, payload));
        }
        let ids: Vec<PayloadId> = entries.iter().map(|(id, _)| id.clone()).collect();
        let states = self.events.store().batch_get(&ids).await?;

        let mut outcome = BatchOutcome::default();
        let mut handled: HashSet<PayloadId> = HashSet::new();

        for ((id, payload), stored) in entries.into_iter().zip(states) {
            if !handled.insert(id.clone()) {
                self.events.duplicate(&id, Utc::now()).await?;
                outcome.dropped.push(id);
                continue;
            }

            let state = stored.map(|record| record.state);
            let replace = payload.current_step()?.replace;
            let dispatchable = replace
                || state.is_none_or(|state| {
                    matches!(
                        state,
                        PayloadState::Failed | PayloadState::Aborted | PayloadState::Claimed
                    )
                });

            if !dispatchable {
                // state is Processing, Completed, or Invalid here.
                if let Some(state) = state {
                    self.events.skip(&id, state, None, Utc::now()).await?;
                }
                outcome.skipped.push(id);
                continue;
            }

            match self.dispatcher.dispatch(&payload).await {
                Ok(Some(id)) => outcome.started.push(id),
                Ok(None) => outcome.skipped.push(id),
                Err(err) => {
                    warn!(payload_id = %id, error = %err, terminal = err.is_terminal(), "dispatch failed");
                    outcome.failed.push(FailedDispatch {
                        payload_id: id,
                        message: err.to_string(),
                        terminal: err.is_terminal(),
                    });
                }
            }
        }

        self.events.flush().await?;
        info!(
            started = outcome.started.len(),
            skipped = outcome.skipped.len(),
            dropped = outcome.dropped.len(),
            failed = outcome.failed.len(),
            "batch processed"
        );
        Ok(outcome)
    }
}
