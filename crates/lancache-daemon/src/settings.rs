//! Daemon settings.
//!
//! A JSON file with defaults for everything; absent file means
//! defaults plus whatever the command line overrides.

use std::path::{Path, PathBuf};

use lancache_cachefs::DeleteRateConfig;
use lancache_ingest::Datasource;
use lancache_logs::session::DEFAULT_SESSION_GAP_SECS;
use lancache_logs::speed::DEFAULT_WINDOW_SECS;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Writable state directory (store, positions, operations).
    pub data_dir: PathBuf,
    /// Root of the cache tree (independently mountable).
    pub cache_dir: PathBuf,
    pub datasources: Vec<Datasource>,
    pub session_gap_seconds: i64,
    pub speed_window_seconds: i64,
    pub snapshot_interval_minutes: u64,
    pub snapshot_retention_days: i64,
    /// Provisioned cache capacity (the proxy's disk quota); zero when
    /// the deployment did not declare one.
    pub cache_capacity_bytes: u64,
    pub event_capacity: usize,
    pub delete_rates: DeleteRateConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            cache_dir: PathBuf::from("/cache"),
            datasources: vec![Datasource::new("default", "/logs")],
            session_gap_seconds: DEFAULT_SESSION_GAP_SECS,
            speed_window_seconds: DEFAULT_WINDOW_SECS,
            snapshot_interval_minutes: 15,
            snapshot_retention_days: 30,
            cache_capacity_bytes: 0,
            event_capacity: 1024,
            delete_rates: DeleteRateConfig::default(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let bytes = std::fs::read(path)?;
                Ok(serde_json::from_slice(&bytes)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("lancache.db")
    }

    pub fn positions_path(&self) -> PathBuf {
        self.data_dir.join("positions.json")
    }

    pub fn app_state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn operations_dir(&self) -> PathBuf {
        self.data_dir.join("operations")
    }

    pub fn session_gap(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_gap_seconds)
    }

    pub fn speed_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.speed_window_seconds)
    }
}
