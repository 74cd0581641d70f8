//! Cache filesystem introspection and maintenance.
//!
//! The on-disk cache is nginx's two-level layout,
//! `<service>/<aa>/<bb>/<md5-of-cache-key>`. This crate walks it
//! ([`inspect`]), derives chunk paths from URLs ([`layout`]) and runs
//! the destructive, cancellable maintenance jobs ([`jobs`]): cache
//! clear, per-service and per-game removal, corruption scrubbing and
//! the in-place log rewrite.

pub mod error;
pub mod inspect;
pub mod jobs;
pub mod layout;

pub use error::{Error, Result};
pub use inspect::{
    scan_cache_size, scan_corruption, CacheSizeReport, CorruptionReport, DeleteRateConfig,
};
pub use jobs::{JobContext, JobHandle};
