//! In-memory state store implementation for testing.
//!
//! Predicates are evaluated under the write lock, so conditional
//! transitions are atomic against the current committed value exactly as
//! the [`StateStore`] contract requires.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process state
//! - **Single-process only**

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use stratus_core::{ExecutionRef, PayloadId};

use super::{
    ClaimOutcome, ConfirmOutcome, Count, Page, PageToken, PayloadState, StateQuery, StateRecord,
    StateStore,
};
use crate::error::{Error, Result};

/// In-memory state store.
///
/// Rows are keyed by partition (`collections_workflow`) and sorted within a
/// partition by `item_ids`, mirroring the composite-key layout of the
/// durable backends.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    partitions: RwLock<HashMap<String, BTreeMap<String, StateRecord>>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("state store lock poisoned")
}

impl InMemoryStateStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of records across all partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn record_count(&self) -> Result<usize> {
        let count = {
            let partitions = self.partitions.read().map_err(poison_err)?;
            partitions.values().map(BTreeMap::len).sum()
        };
        Ok(count)
    }

    /// Applies an unconditional transition, creating the record if absent.
    ///
    /// `created` uses set-if-absent semantics: an existing record keeps its
    /// original creation time.
    fn transition(
        &self,
        id: &PayloadId,
        state: PayloadState,
        now: DateTime<Utc>,
        mutate: impl FnOnce(&mut StateRecord),
    ) -> Result<()> {
        let mut partitions = self.partitions.write().map_err(poison_err)?;
        let partition = partitions
            .entry(id.collections_workflow().to_string())
            .or_default();

        let record = partition
            .entry(id.item_ids().to_string())
            .or_insert_with(|| StateRecord {
                payload_id: id.clone(),
                state,
                state_updated_at: now,
                created: now,
                updated: now,
                executions: Vec::new(),
                outputs: Vec::new(),
                last_error: None,
            });

        record.state = state;
        record.state_updated_at = now;
        record.updated = now;
        mutate(record);
        Ok(())
    }

    /// Returns the sort-index key for a record under the given query.
    fn sort_key(query: &StateQuery, record: &StateRecord) -> String {
        if query.state.is_some() {
            record.state_updated()
        } else {
            record.updated.to_rfc3339_opts(SecondsFormat::Millis, true)
        }
    }

    /// Collects the partition's matching records in index order.
    fn matching_rows(&self, query: &StateQuery) -> Result<Vec<(String, StateRecord)>> {
        let partitions = self.partitions.read().map_err(poison_err)?;
        let Some(partition) = partitions.get(&query.collections_workflow) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<(String, StateRecord)> = partition
            .values()
            .filter(|record| query.state.is_none_or(|state| record.state == state))
            .filter(|record| query.since.is_none_or(|since| record.updated >= since))
            .filter(|record| query.until.is_none_or(|until| record.updated <= until))
            .filter(|record| {
                query.error_prefix.as_deref().is_none_or(|prefix| {
                    record
                        .last_error
                        .as_deref()
                        .is_some_and(|error| error.starts_with(prefix))
                })
            })
            .map(|record| (Self::sort_key(query, record), record.clone()))
            .collect();
        drop(partitions);

        rows.sort_by(|(a_key, a), (b_key, b)| {
            (a_key, a.payload_id.item_ids()).cmp(&(b_key, b.payload_id.item_ids()))
        });
        if !query.ascending {
            rows.reverse();
        }
        Ok(rows)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, id: &PayloadId) -> Result<Option<StateRecord>> {
        let result = {
            let partitions = self.partitions.read().map_err(poison_err)?;
            partitions
                .get(id.collections_workflow())
                .and_then(|partition| partition.get(id.item_ids()))
                .cloned()
        };
        Ok(result)
    }

    async fn batch_get(&self, ids: &[PayloadId]) -> Result<Vec<Option<StateRecord>>> {
        let partitions = self.partitions.read().map_err(poison_err)?;
        let results = ids
            .iter()
            .map(|id| {
                partitions
                    .get(id.collections_workflow())
                    .and_then(|partition| partition.get(id.item_ids()))
                    .cloned()
            })
            .collect();
        drop(partitions);
        Ok(results)
    }

    async fn claim(
        &self,
        id: &PayloadId,
        execution: &ExecutionRef,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut partitions = self.partitions.write().map_err(poison_err)?;
        let partition = partitions
            .entry(id.collections_workflow().to_string())
            .or_default();

        match partition.get_mut(id.item_ids()) {
            None => {
                partition.insert(
                    id.item_ids().to_string(),
                    StateRecord {
                        payload_id: id.clone(),
                        state: PayloadState::Claimed,
                        state_updated_at: now,
                        created: now,
                        updated: now,
                        executions: vec![execution.clone()],
                        outputs: Vec::new(),
                        last_error: None,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
            Some(record) if record.state.is_active() => Ok(ClaimOutcome::AlreadyActive {
                state: record.state,
                executions: record.executions.clone(),
            }),
            Some(record) => {
                record.state = PayloadState::Claimed;
                record.state_updated_at = now;
                record.updated = now;
                record.executions.push(execution.clone());
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn confirm_started(
        &self,
        id: &PayloadId,
        execution: &ExecutionRef,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome> {
        let mut partitions = self.partitions.write().map_err(poison_err)?;
        let Some(record) = partitions
            .get_mut(id.collections_workflow())
            .and_then(|partition| partition.get_mut(id.item_ids()))
        else {
            return Ok(ConfirmOutcome::NotFound);
        };

        if record.state.is_active() && record.executions.contains(execution) {
            record.state = PayloadState::Processing;
            record.state_updated_at = now;
            record.updated = now;
            Ok(ConfirmOutcome::Confirmed)
        } else {
            Ok(ConfirmOutcome::Rejected {
                state: record.state,
                executions: record.executions.clone(),
            })
        }
    }

    async fn complete(
        &self,
        id: &PayloadId,
        outputs: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(id, PayloadState::Completed, now, |record| {
            record.outputs = outputs;
        })
    }

    async fn fail(&self, id: &PayloadId, message: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(id, PayloadState::Failed, now, |record| {
            record.last_error = Some(message.to_string());
        })
    }

    async fn invalidate(&self, id: &PayloadId, message: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(id, PayloadState::Invalid, now, |record| {
            record.last_error = Some(message.to_string());
        })
    }

    async fn abort(&self, id: &PayloadId, now: DateTime<Utc>) -> Result<()> {
        self.transition(id, PayloadState::Aborted, now, |_| {})
    }

    async fn query(&self, query: &StateQuery) -> Result<Page> {
        let rows = self.matching_rows(query)?;

        let start = match &query.page_token {
            Some(token) => {
                let position = rows.iter().position(|(key, record)| {
                    *key == token.sort_key && record.payload_id.item_ids() == token.item_ids
                });
                // A vanished token row resumes from the beginning rather
                // than silently skipping everything.
                position.map_or(0, |index| index + 1)
            }
            None => 0,
        };

        let page: Vec<StateRecord> = rows
            .iter()
            .skip(start)
            .take(query.limit)
            .map(|(_, record)| record.clone())
            .collect();

        let next = if !page.is_empty() && start + page.len() < rows.len() {
            rows.get(start + page.len() - 1).map(|(key, record)| PageToken {
                sort_key: key.clone(),
                item_ids: record.payload_id.item_ids().to_string(),
            })
        } else {
            None
        };

        Ok(Page {
            records: page,
            next,
        })
    }

    async fn count(&self, query: &StateQuery, cap: u64) -> Result<Count> {
        let rows = self.matching_rows(query)?;
        let total = rows.len() as u64;
        if total > cap {
            Ok(Count::AtLeast(cap))
        } else {
            Ok(Count::Exact(total))
        }
    }
}
