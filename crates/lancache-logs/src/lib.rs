//! Access-log parsing and download aggregation for the Lancache core.
//!
//! This crate holds the pure, store-agnostic half of the ingestion
//! pipeline:
//!
//! - [`parser`]: turns raw nginx access-log lines into [`LogRecord`]s
//! - [`session`]: folds record streams into [`Download`] sessions keyed
//!   by `(client_ip, service)` with an idle-gap cutoff
//! - [`speed`]: a rolling-window byte-rate tracker producing JSON
//!   snapshots for live dashboards
//!
//! Nothing in here performs IO; the tail loop and the store live in the
//! `lancache-ingest` and `lancache-store` crates.

pub mod download;
pub mod parser;
pub mod record;
pub mod service;
pub mod session;
pub mod speed;

pub use download::Download;
pub use parser::{LogParser, ParseOutcome};
pub use record::{CacheStatus, LogRecord};
pub use session::{SessionAggregator, DEFAULT_SESSION_GAP_SECS};
pub use speed::{
    ClientSpeedInfo, DepotResolver, DownloadSpeedSnapshot, GameSpeedInfo, SpeedWindow,
};
