//! Durable JSON state outside the relational store.
//!
//! Every write goes through the same atomic path: serialize to a
//! sibling temp file, fsync, rename over the target. A crash between
//! write and rename leaves the old file intact; after the rename the
//! new content is visible. Reads tolerate absent files by returning
//! defaults.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::Result;

/// Serialize `value` to `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let tmp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(tmp.as_file(), value)?;
    tmp.as_file().sync_all()?;

    if let Err(persist_err) = tmp.persist(path) {
        // Rename can fail when the target is held open by a watcher;
        // fall back to copy + delete like the log rewriter does.
        warn!(
            "atomic rename to {} failed ({}), using copy fallback",
            path.display(),
            persist_err.error
        );
        let tmp_path = persist_err.file.into_temp_path();
        fs::copy(&tmp_path, path)?;
    }
    Ok(())
}

/// Deserialize `path`, returning `T::default()` when the file is
/// absent or unreadable.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("ignoring corrupt state file {}: {e}", path.display());
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

/// Byte position and line count of one tailed log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPosition {
    pub bytes: u64,
    pub lines: u64,
}

/// All datasource positions, persisted in a single file keyed by
/// datasource name.
#[derive(Debug)]
pub struct PositionStore {
    path: PathBuf,
    positions: HashMap<String, LogPosition>,
}

impl PositionStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let positions = read_json_or_default(&path);
        Self { path, positions }
    }

    pub fn get(&self, datasource: &str) -> LogPosition {
        self.positions.get(datasource).copied().unwrap_or_default()
    }

    /// Update one datasource's position and persist the whole file.
    pub fn set(&mut self, datasource: &str, position: LogPosition) -> Result<()> {
        self.positions.insert(datasource.to_string(), position);
        write_json_atomic(&self.path, &self.positions)
    }

    /// Drop a datasource's position (used by the reset operation).
    pub fn clear(&mut self, datasource: &str) -> Result<()> {
        self.positions.remove(datasource);
        write_json_atomic(&self.path, &self.positions)
    }
}

/// How destructive cache deletes traverse the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDeleteMode {
    /// Delete files but keep the two-level hex skeleton.
    #[default]
    Preserve,
    /// Delete whole service directories.
    Full,
    /// Hand the tree to an rsync child process.
    Rsync,
}

/// Durable application flags and crawl marks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppState {
    pub setup_completed: bool,
    pub last_depot_crawl: Option<NaiveDateTime>,
    pub crawl_interval_hours: u32,
    pub crawl_incremental: bool,
    pub cache_delete_mode: CacheDeleteMode,
    pub guest_sessions_allowed: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            setup_completed: false,
            last_depot_crawl: None,
            crawl_interval_hours: 24,
            crawl_incremental: true,
            cache_delete_mode: CacheDeleteMode::default(),
            guest_sessions_allowed: false,
        }
    }
}

/// Handle for loading and saving [`AppState`].
#[derive(Debug)]
pub struct AppStateFile {
    path: PathBuf,
    pub state: AppState,
}

impl AppStateFile {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = read_json_or_default(&path);
        Self { path, state }
    }

    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.state)
    }
}

/// Operation lifecycle as persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Progress of one operation, written atomically about once a second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    pub id: String,
    pub op_type: String,
    pub status: OperationStatus,
    pub percent_complete: f64,
    pub message: String,
    pub started_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    #[serde(default)]
    pub child_pid: Option<u32>,
    /// Set once the completion event for a terminal state has been
    /// published, so restarts do not announce it again.
    #[serde(default)]
    pub announced: bool,
}

impl OperationState {
    pub fn new(id: impl Into<String>, op_type: impl Into<String>) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            id: id.into(),
            op_type: op_type.into(),
            status: OperationStatus::Running,
            percent_complete: 0.0,
            message: String::new(),
            started_at: now,
            updated_at: now,
            child_pid: None,
            announced: false,
        }
    }
}

/// Throttled writer for one operation's state file.
#[derive(Debug)]
pub struct OperationStateWriter {
    path: PathBuf,
    min_interval: Duration,
    last_write: Option<Instant>,
}

impl OperationStateWriter {
    /// State files live at `<dir>/<operation-id>.json`.
    pub fn new(dir: &Path, operation_id: &str) -> Self {
        Self {
            path: dir.join(format!("{operation_id}.json")),
            min_interval: Duration::from_secs(1),
            last_write: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `state`, skipping writes that come faster than the
    /// interval. Terminal states always hit the disk.
    pub fn write(&mut self, state: &OperationState) -> Result<()> {
        let due = self
            .last_write
            .is_none_or(|t| t.elapsed() >= self.min_interval);
        if !due && !state.status.is_terminal() {
            return Ok(());
        }
        let mut state = state.clone();
        state.updated_at = Utc::now().naive_utc();
        write_json_atomic(&self.path, &state)?;
        self.last_write = Some(Instant::now());
        Ok(())
    }
}

/// What startup recovery decided about one persisted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDisposition {
    /// Terminal state whose completion event has not been announced
    /// yet; the caller publishes it exactly once.
    CompletedPendingEvent,
    /// Non-terminal record whose process is gone; marked failed.
    Orphaned,
    /// Non-terminal record older than the retention window; deleted.
    Pruned,
}

#[derive(Debug, Clone)]
pub struct RecoveredOperation {
    pub state: OperationState,
    pub disposition: RecoveryDisposition,
}

/// Retention window for stale non-terminal records.
const STALE_OPERATION_HOURS: i64 = 24;

/// Scan persisted operation state files at startup.
///
/// Terminal, unannounced records come back as `CompletedPendingEvent`
/// and are re-written with `announced = true` so the event fires once
/// across restarts. Non-terminal records are either pruned (older than
/// 24 h) or marked failed as `Orphaned`.
pub fn recover_operations(dir: &Path, now: NaiveDateTime) -> Result<Vec<RecoveredOperation>> {
    let mut recovered = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(recovered);
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(bytes) = fs::read(&path) else {
            continue;
        };
        let Ok(mut state) = serde_json::from_slice::<OperationState>(&bytes) else {
            warn!("removing unreadable operation state {}", path.display());
            let _ = fs::remove_file(&path);
            continue;
        };

        if state.status.is_terminal() {
            if state.announced {
                continue;
            }
            state.announced = true;
            write_json_atomic(&path, &state)?;
            recovered.push(RecoveredOperation {
                state,
                disposition: RecoveryDisposition::CompletedPendingEvent,
            });
            continue;
        }

        let age = now - state.started_at;
        if age > chrono::Duration::hours(STALE_OPERATION_HOURS) {
            debug!(id = %state.id, "pruning stale operation state");
            fs::remove_file(&path)?;
            recovered.push(RecoveredOperation {
                state,
                disposition: RecoveryDisposition::Pruned,
            });
            continue;
        }

        // A running record at startup means the previous process died;
        // if it had a child, that child is gone too.
        let orphaned = state.child_pid.is_none_or(|pid| !pid_running(pid));
        if orphaned {
            state.status = OperationStatus::Failed;
            state.message = "orphaned by process restart".to_string();
            state.announced = true;
            write_json_atomic(&path, &state)?;
            recovered.push(RecoveredOperation {
                state,
                disposition: RecoveryDisposition::Orphaned,
            });
        }
    }

    Ok(recovered)
}

#[cfg(unix)]
fn pid_running(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn pid_running(_pid: u32) -> bool {
    false
}
