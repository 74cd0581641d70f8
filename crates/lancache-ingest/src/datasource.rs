//! Datasource configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One configured log directory, typically one per cache instance.
/// Each datasource owns an independent persisted byte position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datasource {
    pub name: String,
    pub log_directory: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Datasource {
    pub fn new(name: impl Into<String>, log_directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            log_directory: log_directory.into(),
            enabled: true,
        }
    }

    /// The access log this datasource tails.
    pub fn log_path(&self) -> PathBuf {
        self.log_directory.join("access.log")
    }
}
