//! Storage contracts for the transit ETA learner.
//!
//! This crate defines the persisted layout the learning core owns:
//! - one statistics row per (segment, time bin)
//! - an append-only rejection log
//! - idempotency records with a creation timestamp for TTL checks
//! - token buckets keyed by rotating client bucket id
//!
//! plus the read-only segment reference store consumed by the core.
//!
//! Every mutation goes through a [`StoreTransaction`]: the caller stages reads
//! and writes, then commits or rolls back as one unit. Backends surface
//! transient contention as [`StorageError::Busy`] so callers can retry.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::{InMemoryEtaStore, InMemoryReference};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEtaStore;
pub use traits::{EtaStore, QueryWindow, ReferenceStore, StoreTransaction};
