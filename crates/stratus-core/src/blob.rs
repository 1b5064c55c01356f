//! Blob storage abstraction for payload documents and raw messages.
//!
//! The pipeline persists every dispatch input to blob storage before the
//! execution engine is invoked, and offloads any outbound document whose
//! serialized size exceeds a threshold (the document is replaced by
//! `{"reference": <ref>}`). This module defines the contract those callers
//! rely on:
//!
//! - Conditional writes with preconditions (first-writer-wins races)
//! - Precondition failure reported as a **result**, never as an error
//! - An opaque version token so backends (S3 ETag, GCS generation, memory
//!   counter) interpret it according to their own semantics

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional blob writes.
///
/// The version token is opaque - backends interpret it according to their
/// semantics.
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if the object does not exist.
    DoesNotExist,
    /// Write only if the object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional blob write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns the new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns the current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Blob storage contract for payload bodies and offloaded documents.
///
/// Implementations target cloud object stores in production and
/// [`MemoryBlobStore`] in tests. All methods are `Send + Sync` to support
/// concurrent access from multiple dispatch workers.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Reads an entire object.
    ///
    /// Returns [`Error::NotFound`] if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes an object with an optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if the precondition is not
    /// met. Never returns an error for a precondition failure - that is a
    /// normal outcome callers must branch on.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if the object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Internal blob record: data plus a monotonically increasing version.
#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    version: u64,
}

/// In-memory blob storage for testing.
///
/// Thread-safe via `RwLock`; versions are per-object write counters
/// rendered as strings to match the opaque-token contract.
///
/// ## Limitations
///
/// - **NOT suitable for production**: No durability, no cross-process state
/// - **Single-process only**
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, StoredBlob>>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("blob store lock poisoned")
}

impl MemoryBlobStore {
    /// Creates a new empty in-memory blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of objects currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn object_count(&self) -> Result<usize> {
        let count = {
            let objects = self.objects.read().map_err(poison_err)?;
            objects.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStore {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(poison_err)?;
        objects
            .get(path)
            .map(|blob| blob.data.clone())
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(poison_err)?;

        let current = objects.get(path);
        match (&precondition, current) {
            (WritePrecondition::DoesNotExist, Some(existing)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: existing.version.to_string(),
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(existing))
                if existing.version.to_string() != *expected =>
            {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: existing.version.to_string(),
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: "0".to_string(),
                });
            }
            _ => {}
        }

        let next_version = current.map_or(1, |existing| existing.version + 1);
        objects.insert(
            path.to_string(),
            StoredBlob {
                data,
                version: next_version,
            },
        );

        Ok(WriteResult::Success {
            version: next_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut objects = self.objects.write().map_err(poison_err)?;
        objects.remove(path);
        Ok(())
    }
}
