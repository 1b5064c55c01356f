//! # stratus-core
//!
//! Shared foundation for the stratus geospatial processing pipeline.
//!
//! This crate provides the types every stratus component agrees on:
//!
//! - **Identifiers**: [`PayloadId`] (the derived work-item identity) and
//!   [`ExecutionRef`] (one run of the external workflow execution engine)
//! - **Errors**: the shared [`error::Error`] type and [`error::Result`] alias
//! - **Blob storage**: the [`BlobStorage`] trait with conditional-write
//!   primitives, plus an in-memory backend for tests
//!
//! Higher-level orchestration (state store, dispatch, batching, events)
//! lives in `stratus-flow`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod blob;
pub mod error;
pub mod id;

pub use blob::{BlobStorage, MemoryBlobStore, WritePrecondition, WriteResult};
pub use error::{Error, Result};
pub use id::{ExecutionRef, PayloadId};
