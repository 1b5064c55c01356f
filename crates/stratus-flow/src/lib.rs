//! # stratus-flow
//!
//! Payload orchestration engine for the stratus geospatial pipeline.
//!
//! Work items ("payloads") describing one or more geospatial records plus an
//! ordered list of processing steps flow through a queue, are dispatched to a
//! named workflow execution, and transition through a persisted state machine
//! until they complete, fail, or are judged invalid. Many producers and many
//! concurrent workers may dispatch the same payload at once; this crate
//! guarantees **at-most-one active workflow execution per payload identity**
//! and never loses track of a payload's outcome.
//!
//! ## Core Concepts
//!
//! - **Payload**: the validated, immutable-until-chained work item
//!   ([`payload::Payload`])
//! - **State Store**: durable keyed storage with conditional transitions
//!   ([`state::StateStore`])
//! - **Dispatch**: the per-payload claim/upload/invoke/confirm state machine
//!   ([`dispatch::Dispatcher`])
//! - **Batch**: in-order batch deduplication and the decision policy
//!   ([`batch::BatchOrchestrator`])
//! - **Events**: the single choke point announcing every transition to the
//!   store, the timeseries sink, and the notification sink
//!   ([`eventmgr::EventManager`])
//!
//! ## Guarantees
//!
//! - Cross-worker correctness is delegated entirely to the state store's
//!   conditional-write predicates; there is no client-side locking
//! - Concurrency signals are typed outcomes, never exceptions
//! - A stranded `CLAIMED` record is re-enterable by the next attempt

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod chain;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod eventmgr;
pub mod events;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod payload;
pub mod queue;
pub mod state;
pub mod timeseries;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::batch::{BatchOrchestrator, BatchOutcome};
    pub use crate::chain::ChainFilter;
    pub use crate::completion::CompletionHandler;
    pub use crate::config::Config;
    pub use crate::dispatch::Dispatcher;
    pub use crate::engine::{CompletionReport, CompletionStatus, ExecutionEngine, StartOutcome};
    pub use crate::error::{Error, Result};
    pub use crate::eventmgr::EventManager;
    pub use crate::events::{Event, EventKind};
    pub use crate::ingest::Ingestor;
    pub use crate::notify::{Notification, NotificationSink};
    pub use crate::payload::{Payload, ProcessStep, Record, StepEntry};
    pub use crate::queue::{EnqueueOutcome, WorkQueue};
    pub use crate::state::{ClaimOutcome, ConfirmOutcome, PayloadState, StateRecord, StateStore};
    pub use crate::timeseries::{TimeseriesRecord, TimeseriesSink};
}
