//! Workflow execution engine abstraction.
//!
//! The engine is an external collaborator: this crate starts executions
//! under a caller-chosen [`ExecutionRef`] and later consumes an
//! asynchronous [`CompletionReport`]. Nothing here interprets the workflow
//! definition itself.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stratus_core::ExecutionRef;

use crate::error::{Error, Result};

/// Outcome of a start request.
///
/// `UnknownTarget` is a terminal condition for the caller; `AlreadyExists`
/// is the engine's own idempotency signal for a duplicate invocation under
/// the same reference and is never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new execution was started under the given reference.
    Started,
    /// An execution under this reference already exists.
    AlreadyExists,
    /// The named workflow target does not exist.
    UnknownTarget,
}

/// Starts workflow executions.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Starts an execution of `target` under `execution` with the given
    /// input document.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport-level failures; target and
    /// duplicate conditions are reported through [`StartOutcome`].
    async fn start(
        &self,
        target: &str,
        execution: &ExecutionRef,
        input: &Value,
    ) -> Result<StartOutcome>;
}

/// Final status reported by the engine for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    /// The execution finished successfully.
    Succeeded,
    /// The execution failed.
    Failed,
    /// The execution was aborted by an operator.
    Aborted,
    /// The execution exceeded its time limit.
    TimedOut,
}

/// Asynchronous completion report for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    /// The execution this report concerns.
    pub execution: ExecutionRef,
    /// The output payload document (the input document for non-success).
    pub payload: Value,
    /// Final status.
    pub status: CompletionStatus,
    /// Error name reported by the engine, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure cause: either a cause object or an execution history usable
    /// to extract the first real error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Value>,
}

impl CompletionReport {
    /// Extracts the most specific error description available.
    ///
    /// Prefers the first error found in an execution-history cause, then a
    /// cause object's message, then the top-level error name.
    #[must_use]
    pub fn first_error(&self) -> Option<String> {
        if let Some(cause) = &self.cause {
            if let Some(found) = Self::error_from_cause(cause) {
                return Some(found);
            }
        }
        self.error.clone()
    }

    fn error_from_cause(cause: &Value) -> Option<String> {
        match cause {
            Value::Array(history) => history.iter().find_map(Self::error_from_cause),
            Value::Object(map) => {
                let name = map
                    .get("error")
                    .or_else(|| map.get("errorType"))
                    .and_then(Value::as_str);
                let message = map
                    .get("errorMessage")
                    .or_else(|| map.get("message"))
                    .and_then(Value::as_str);
                match (name, message) {
                    (Some(name), Some(message)) => Some(format!("{name}: {message}")),
                    (Some(name), None) => Some(name.to_string()),
                    (None, Some(message)) => Some(message.to_string()),
                    (None, None) => None,
                }
            }
            _ => None,
        }
    }
}

/// One recorded start call.
#[derive(Debug, Clone)]
pub struct StartedExecution {
    /// The workflow target that was invoked.
    pub target: String,
    /// The execution reference used.
    pub execution: ExecutionRef,
    /// The input document passed to the engine.
    pub input: Value,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::engine("engine lock poisoned")
}

/// In-memory engine for tests.
///
/// Knows a fixed set of targets, records every start call, and reports
/// `AlreadyExists` for a repeated reference. A transport failure can be
/// injected for the next call.
#[derive(Debug, Default)]
pub struct InMemoryEngine {
    targets: HashSet<String>,
    started: RwLock<Vec<StartedExecution>>,
    running: RwLock<HashSet<ExecutionRef>>,
    fail_next: AtomicBool,
}

impl InMemoryEngine {
    /// Creates an engine knowing the given workflow targets.
    #[must_use]
    pub fn with_targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Makes the next `start` call fail with a transport error.
    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Returns all recorded start calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn started(&self) -> Result<Vec<StartedExecution>> {
        let started = self.started.read().map_err(poison_err)?.clone();
        Ok(started)
    }
}

#[async_trait]
impl ExecutionEngine for InMemoryEngine {
    async fn start(
        &self,
        target: &str,
        execution: &ExecutionRef,
        input: &Value,
    ) -> Result<StartOutcome> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::engine("connection reset"));
        }
        if !self.targets.contains(target) {
            return Ok(StartOutcome::UnknownTarget);
        }
        {
            let mut running = self.running.write().map_err(poison_err)?;
            if !running.insert(execution.clone()) {
                return Ok(StartOutcome::AlreadyExists);
            }
        }
        self.started.write().map_err(poison_err)?.push(StartedExecution {
            target: target.to_string(),
            execution: execution.clone(),
            input: input.clone(),
        });
        Ok(StartOutcome::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stratus_core::PayloadId;

    fn exec(attempt: usize) -> ExecutionRef {
        let id: PayloadId = "X/workflow-wf/a".parse().unwrap();
        ExecutionRef::derive(&id, attempt)
    }

    #[tokio::test]
    async fn start_records_invocation() -> Result<()> {
        let engine = InMemoryEngine::with_targets(["wf"]);
        let outcome = engine.start("wf", &exec(1), &json!({"k": 1})).await?;
        assert_eq!(outcome, StartOutcome::Started);
        assert_eq!(engine.started()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_reference_already_exists() -> Result<()> {
        let engine = InMemoryEngine::with_targets(["wf"]);
        engine.start("wf", &exec(1), &json!({})).await?;
        let outcome = engine.start("wf", &exec(1), &json!({})).await?;
        assert_eq!(outcome, StartOutcome::AlreadyExists);
        assert_eq!(engine.started()?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_target() -> Result<()> {
        let engine = InMemoryEngine::with_targets(["wf"]);
        let outcome = engine.start("other", &exec(1), &json!({})).await?;
        assert_eq!(outcome, StartOutcome::UnknownTarget);
        Ok(())
    }

    #[tokio::test]
    async fn injected_transport_error_fires_once() -> Result<()> {
        let engine = InMemoryEngine::with_targets(["wf"]);
        engine.fail_next_start();
        assert!(engine.start("wf", &exec(1), &json!({})).await.is_err());
        assert!(engine.start("wf", &exec(1), &json!({})).await.is_ok());
        Ok(())
    }

    #[test]
    fn first_error_prefers_history() {
        let report = CompletionReport {
            execution: exec(1),
            payload: json!({}),
            status: CompletionStatus::Failed,
            error: Some("States.TaskFailed".into()),
            cause: Some(json!([
                {"type": "TaskStateEntered"},
                {"error": "InvalidInput", "errorMessage": "no records"},
            ])),
        };
        assert_eq!(
            report.first_error().as_deref(),
            Some("InvalidInput: no records")
        );
    }

    #[test]
    fn first_error_falls_back_to_name() {
        let report = CompletionReport {
            execution: exec(1),
            payload: json!({}),
            status: CompletionStatus::TimedOut,
            error: Some("States.Timeout".into()),
            cause: None,
        };
        assert_eq!(report.first_error().as_deref(), Some("States.Timeout"));
    }
}
