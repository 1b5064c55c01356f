//! Strongly-typed identifiers for stratus entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Deterministic where it matters**: Payload identities and execution
//!   references are pure functions of their ingredients, so retried work is
//!   idempotent without coordination
//!
//! # Example
//!
//! ```rust
//! use stratus_core::id::{ExecutionRef, PayloadId};
//!
//! let id = PayloadId::from_parts(["landsat", "landsat"], "cog-convert", ["scene-1", "scene-2"]).unwrap();
//! assert_eq!(id.as_str(), "landsat/workflow-cog-convert/scene-1/scene-2");
//!
//! // Same ingredients, same reference - replay-safe.
//! let a = ExecutionRef::derive(&id, 1);
//! let b = ExecutionRef::derive(&id, 1);
//! assert_eq!(a, b);
//! ```

use base32::Alphabet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Marker prefix for the workflow segment of a payload identity.
const WORKFLOW_SEGMENT_PREFIX: &str = "workflow-";

/// The unique identity of a payload (work item).
///
/// Format: `<collections>/workflow-<workflow-name>/<item-ids>`, where
/// `collections` is a sorted, `/`-joined, deduplicated set of source
/// collection names and `item-ids` is a sorted, `/`-joined set of record
/// identifiers.
///
/// The identity always contains a `workflow-` segment. It is derived once
/// from a payload's records (or supplied explicitly) and never recomputed
/// after assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadId(String);

impl PayloadId {
    /// Derives a payload identity from its ingredients.
    ///
    /// Collections are deduplicated and sorted; item IDs are deduplicated
    /// and sorted. The derivation is a pure function, so the same records
    /// always produce the same identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the workflow name is empty, no item
    /// IDs were provided, or any ingredient contains a `/`.
    pub fn from_parts<'a, C, I>(collections: C, workflow: &str, item_ids: I) -> Result<Self>
    where
        C: IntoIterator<Item = &'a str>,
        I: IntoIterator<Item = &'a str>,
    {
        if workflow.is_empty() {
            return Err(Error::InvalidId {
                message: "payload identity requires a workflow name".into(),
            });
        }
        if workflow.contains('/') {
            return Err(Error::InvalidId {
                message: format!("workflow name '{workflow}' must not contain '/'"),
            });
        }

        let mut collections: Vec<&str> = collections.into_iter().collect();
        collections.sort_unstable();
        collections.dedup();

        let mut item_ids: Vec<&str> = item_ids.into_iter().collect();
        item_ids.sort_unstable();
        item_ids.dedup();

        if collections.is_empty() {
            return Err(Error::InvalidId {
                message: "payload identity requires at least one collection".into(),
            });
        }
        if item_ids.is_empty() {
            return Err(Error::InvalidId {
                message: "payload identity requires at least one item ID".into(),
            });
        }
        if let Some(bad) = collections
            .iter()
            .chain(item_ids.iter())
            .find(|part| part.is_empty() || part.contains('/'))
        {
            return Err(Error::InvalidId {
                message: format!("identity component '{bad}' is empty or contains '/'"),
            });
        }

        Ok(Self(format!(
            "{}/{}{}/{}",
            collections.join("/"),
            WORKFLOW_SEGMENT_PREFIX,
            workflow,
            item_ids.join("/"),
        )))
    }

    /// Returns the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the partition component: everything up to and including the
    /// `workflow-` segment.
    #[must_use]
    pub fn collections_workflow(&self) -> &str {
        let (head, _) = self.split_at_workflow();
        head
    }

    /// Returns the sort component: the `/`-joined item IDs after the
    /// `workflow-` segment.
    #[must_use]
    pub fn item_ids(&self) -> &str {
        let (_, tail) = self.split_at_workflow();
        tail
    }

    /// Returns the `/`-joined collections component, without the
    /// `workflow-` segment.
    #[must_use]
    pub fn collections(&self) -> &str {
        let head = self.collections_workflow();
        head.rsplit_once('/').map_or(head, |(collections, _)| collections)
    }

    /// Returns the workflow name embedded in the identity.
    #[must_use]
    pub fn workflow(&self) -> &str {
        let head = self.collections_workflow();
        let segment = head.rsplit('/').next().unwrap_or(head);
        segment.strip_prefix(WORKFLOW_SEGMENT_PREFIX).unwrap_or(segment)
    }

    /// Splits the identity at the end of the `workflow-` segment.
    ///
    /// Parsing guarantees the segment exists, so the fallback branch is
    /// unreachable for any constructed `PayloadId`.
    fn split_at_workflow(&self) -> (&str, &str) {
        let mut offset = 0;
        for segment in self.0.split('/') {
            let end = offset + segment.len();
            if segment.starts_with(WORKFLOW_SEGMENT_PREFIX) {
                let tail = self.0.get(end + 1..).unwrap_or("");
                return (&self.0[..end], tail);
            }
            offset = end + 1;
        }
        (&self.0, "")
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PayloadId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let workflow_segment = s
            .split('/')
            .find(|segment| segment.starts_with(WORKFLOW_SEGMENT_PREFIX));

        match workflow_segment {
            Some(segment) if segment.len() > WORKFLOW_SEGMENT_PREFIX.len() => {
                let id = Self(s.to_string());
                if id.collections_workflow().len() == segment.len() {
                    return Err(Error::InvalidId {
                        message: format!("payload identity '{s}' has no collections component"),
                    });
                }
                if id.item_ids().is_empty() {
                    return Err(Error::InvalidId {
                        message: format!("payload identity '{s}' has no item IDs component"),
                    });
                }
                Ok(id)
            }
            _ => Err(Error::InvalidId {
                message: format!("payload identity '{s}' is missing a 'workflow-' segment"),
            }),
        }
    }
}

/// An opaque reference to one run of the external workflow execution engine.
///
/// References are derived deterministically from a payload identity and an
/// attempt number, so a redelivered dispatch computes the same reference as
/// the attempt it duplicates and the engine can deduplicate the start call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionRef(String);

impl ExecutionRef {
    /// Derives the execution reference for the given attempt of a payload.
    ///
    /// Format: `exec_{base32(sha256("execution:{id}:{attempt}"))[..26]}`,
    /// yielding 130 bits of entropy in a compact, engine-safe identifier.
    #[must_use]
    pub fn derive(id: &PayloadId, attempt: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"execution:");
        hasher.update(id.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(attempt.to_string().as_bytes());
        let hash = hasher.finalize();

        // 32-byte hash -> 52 base32 chars; 26 chars keep the reference compact.
        let encoded = base32::encode(Alphabet::Rfc4648 { padding: false }, &hash);
        let short = encoded.get(..26).unwrap_or(&encoded).to_lowercase();

        Self(format!("exec_{short}"))
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidId {
                message: "execution reference must not be empty".into(),
            });
        }
        Ok(Self(s.to_string()))
    }
}
