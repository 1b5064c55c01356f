//! Error types for the orchestration domain.
//!
//! The taxonomy distinguishes four classes of failure:
//!
//! 1. **Input errors** ([`Error::InvalidPayload`]): rejected before any state
//!    mutation; never retried.
//! 2. **Concurrency signals**: NOT errors. Conditional-write races surface as
//!    typed outcomes ([`crate::state::ClaimOutcome`],
//!    [`crate::state::ConfirmOutcome`]) that callers must branch on.
//! 3. **Terminal errors** ([`Error::WorkflowNotFound`],
//!    [`Error::MissingConfiguration`]): the condition cannot self-resolve;
//!    the hosting runtime should route the message to a dead-letter path
//!    instead of retrying. Identified by [`Error::is_terminal`].
//! 4. **Transient errors** (everything else): re-raised so the hosting
//!    runtime retries the unit of work.

use stratus_core::PayloadId;

/// The result type used throughout stratus-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A payload failed structural validation.
    #[error("invalid payload: {message}")]
    InvalidPayload {
        /// Description of what made the payload invalid.
        message: String,
    },

    /// The execution engine does not know the target workflow. Terminal.
    #[error("workflow not found: {workflow}")]
    WorkflowNotFound {
        /// The workflow name the engine rejected.
        workflow: String,
    },

    /// Mandatory configuration for the target is missing. Terminal.
    #[error("missing configuration: {message}")]
    MissingConfiguration {
        /// Description of the missing configuration.
        message: String,
    },

    /// A claim raced with another writer in a way that could not be
    /// resolved by adoption; the caller's runtime should retry.
    #[error("claim contention on {payload_id}")]
    ClaimContention {
        /// The contended payload identity.
        payload_id: PayloadId,
    },

    /// The execution engine call failed for a transport-level reason.
    #[error("engine error: {message}")]
    Engine {
        /// Description of the engine failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A storage operation failed (state store, blob, queue, sink).
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from stratus-core.
    #[error("core error: {0}")]
    Core(#[from] stratus_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new engine error without a source.
    #[must_use]
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new invalid-payload error.
    #[must_use]
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Returns true for conditions that must not be retried because they
    /// cannot self-resolve.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowNotFound { .. } | Self::MissingConfiguration { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_not_found_is_terminal() {
        let err = Error::WorkflowNotFound {
            workflow: "cog-convert".into(),
        };
        assert!(err.is_terminal());
        assert!(err.to_string().contains("cog-convert"));
    }

    #[test]
    fn engine_error_is_retryable() {
        assert!(!Error::engine("connection reset").is_terminal());
        assert!(!Error::storage("throttled").is_terminal());
    }

    #[test]
    fn claim_contention_is_retryable() {
        let id: PayloadId = "c/workflow-wf/i".parse().unwrap();
        assert!(!Error::ClaimContention { payload_id: id }.is_terminal());
    }
}
