//! Runtime half of the ingestion pipeline.
//!
//! One [`tailer::LogTailIngestor`] task per datasource reads the
//! access log from its persisted byte position, folds records through
//! the session aggregator and commits batches to the store. A
//! [`speed::SpeedTracker`] task follows the same files with a rolling
//! window for live dashboards. [`supervisor::spawn_supervised`] keeps
//! both alive across failures with backed-off restarts.

pub mod datasource;
pub mod error;
pub mod speed;
pub mod supervisor;
pub mod tailer;

pub use datasource::Datasource;
pub use error::{Error, Result};
pub use speed::{SpeedTracker, SpeedTrackerConfig};
pub use supervisor::spawn_supervised;
pub use tailer::{LogTailIngestor, TailerConfig};
