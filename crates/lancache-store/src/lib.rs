//! Embedded relational store for the Lancache core.
//!
//! SQLite (WAL, `synchronous=NORMAL`) holds downloads, raw log rows,
//! per-client and per-service rollups, the depot→app catalogue, the
//! prefill manifest cache and cache-size snapshots.
//!
//! Concurrency model: one writer connection serialized behind a lock,
//! read-only connections opened per query. Bulk inserts run in batched
//! transactions; a failed transaction rolls back in full so the
//! ingestor can replay the same bytes.

pub mod depots;
pub mod error;
pub mod models;
pub mod schema;
pub mod store;

pub use depots::{DepotMappingUpdate, MergeOutcome};
pub use error::{Error, Result};
pub use models::{ClientStats, LogEntryRow, ServiceStats, StatDelta, TableClass};
pub use store::{Store, StoreWriter};
