//! Timeseries sink abstraction.
//!
//! Receives one dimensioned record per state transition. The sink is
//! reporting-only: the decision logic never reads it back, and a recording
//! failure is logged and swallowed by the event manager rather than failing
//! the transition.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stratus_core::{ExecutionRef, PayloadId};

use crate::error::{Error, Result};
use crate::state::PayloadState;

/// One timeseries measurement: a state transition with its dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeseriesRecord {
    /// Workflow name dimension.
    pub workflow: String,
    /// Collections dimension.
    pub collections: String,
    /// Item ids dimension.
    pub item_ids: String,
    /// The execution involved, if any.
    pub execution: Option<ExecutionRef>,
    /// The state entered.
    pub state: PayloadState,
    /// When the transition happened.
    pub time: DateTime<Utc>,
}

impl TimeseriesRecord {
    /// Builds a record for a transition of the given identity.
    #[must_use]
    pub fn for_transition(
        id: &PayloadId,
        state: PayloadState,
        execution: Option<&ExecutionRef>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow: id.workflow().to_string(),
            collections: id.collections().to_string(),
            item_ids: id.item_ids().to_string(),
            execution: execution.cloned(),
            state,
            time,
        }
    }
}

/// Accepts timeseries records.
#[async_trait]
pub trait TimeseriesSink: Send + Sync {
    /// Records one measurement.
    async fn record(&self, record: TimeseriesRecord) -> Result<()>;
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("timeseries sink lock poisoned")
}

/// In-memory sink for tests.
#[derive(Debug, Default)]
pub struct InMemoryTimeseriesSink {
    records: RwLock<Vec<TimeseriesRecord>>,
}

impl InMemoryTimeseriesSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded measurements in arrival order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn records(&self) -> Result<Vec<TimeseriesRecord>> {
        let records = self.records.read().map_err(poison_err)?.clone();
        Ok(records)
    }
}

#[async_trait]
impl TimeseriesSink for InMemoryTimeseriesSink {
    async fn record(&self, record: TimeseriesRecord) -> Result<()> {
        self.records.write().map_err(poison_err)?.push(record);
        Ok(())
    }
}
