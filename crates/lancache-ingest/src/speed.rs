//! Live speed tracker task.
//!
//! A second, low-latency consumer of the access logs. Positions start
//! at end-of-file (history is the tailer's job); appended records feed
//! the rolling window, and snapshots go out as JSON lines plus
//! `DownloadSpeedUpdate` events whenever the picture changes, or at
//! least once per window.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lancache_logs::parser::{LogParser, ParseOutcome};
use lancache_logs::speed::{DepotResolver, SpeedWindow, DEFAULT_WINDOW_SECS};
use lancache_ops::events::{Event, EventBus, SpeedUpdate};
use lancache_store::Store;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct SpeedTrackerConfig {
    pub window: chrono::Duration,
    /// How often snapshots are considered for broadcast.
    pub broadcast_interval: Duration,
    /// How often the files are polled for appended bytes.
    pub poll_interval: Duration,
}

impl Default for SpeedTrackerConfig {
    fn default() -> Self {
        Self {
            window: chrono::Duration::seconds(DEFAULT_WINDOW_SECS),
            broadcast_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Store-backed depot resolver. Only successful name lookups are
/// cached, so a depot mapped later still resolves.
pub struct StoreDepotResolver {
    store: Arc<Store>,
    cache: HashMap<u32, (Option<String>, Option<u32>)>,
}

impl StoreDepotResolver {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }
}

impl DepotResolver for StoreDepotResolver {
    fn resolve(&mut self, depot_id: u32) -> (Option<String>, Option<u32>) {
        if let Some(cached) = self.cache.get(&depot_id) {
            if cached.0.is_some() {
                return cached.clone();
            }
        }
        let resolved = match self.store.owner_for_depot(depot_id) {
            Ok(Some((app_id, app_name))) => (app_name, Some(app_id)),
            Ok(None) => (None, None),
            Err(e) => {
                debug!("depot lookup failed for {depot_id}: {e}");
                (None, None)
            }
        };
        if resolved.0.is_some() {
            self.cache.insert(depot_id, resolved.clone());
        }
        resolved
    }
}

/// The tracker task.
pub struct SpeedTracker {
    log_paths: Vec<PathBuf>,
    bus: EventBus,
    resolver: StoreDepotResolver,
    config: SpeedTrackerConfig,
    /// Optional sink for the raw JSON lines (the daemon wires this to
    /// stdout for external consumers).
    line_sink: Option<UnboundedSender<String>>,
}

impl SpeedTracker {
    pub fn new(log_paths: Vec<PathBuf>, store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            log_paths,
            bus,
            resolver: StoreDepotResolver::new(store),
            config: SpeedTrackerConfig::default(),
            line_sink: None,
        }
    }

    pub fn with_config(mut self, config: SpeedTrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_line_sink(mut self, sink: UnboundedSender<String>) -> Self {
        self.line_sink = Some(sink);
        self
    }

    /// Run until cancelled; reacts to cancellation within one window.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(files = self.log_paths.len(), "speed tracker starting");
        let parser = LogParser::default();
        let mut window = SpeedWindow::new(self.config.window);

        // Start at end of file: the live view has no history.
        let mut positions: HashMap<PathBuf, u64> = HashMap::new();
        for path in &self.log_paths {
            let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            positions.insert(path.clone(), len);
        }

        let mut last_broadcast = Instant::now();
        let mut last_emit = Instant::now();
        let mut last_line: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            for path in &self.log_paths {
                let position = positions.entry(path.clone()).or_insert(0);
                match read_appended(path, position) {
                    Ok(lines) => {
                        for line in lines {
                            if let ParseOutcome::Record(record) = parser.parse(line.trim()) {
                                window.push(&record);
                            }
                        }
                    }
                    Err(e) => debug!("speed read failed for {}: {e}", path.display()),
                }
            }

            if last_broadcast.elapsed() >= self.config.broadcast_interval {
                last_broadcast = Instant::now();
                let snapshot = window.snapshot(Utc::now().naive_utc(), &mut self.resolver);
                let line = snapshot.to_json_line();

                // Change detection ignores the embedded timestamp.
                let mut keyed = snapshot.clone();
                keyed.timestamp_utc = String::new();
                let key = keyed.to_json_line();

                // Emit when something changed, or at least once per
                // window to keep consumers' clocks ticking.
                let due = last_line.as_deref() != Some(key.as_str())
                    || last_emit.elapsed() >= window_duration(&self.config);
                if due {
                    last_emit = Instant::now();
                    if let Ok(value) = serde_json::to_value(&snapshot) {
                        self.bus
                            .publish(Event::DownloadSpeedUpdate(SpeedUpdate { snapshot: value }));
                    }
                    if let Some(sink) = &self.line_sink {
                        if sink.send(line).is_err() {
                            warn!("speed line sink closed");
                            self.line_sink = None;
                        }
                    }
                    last_line = Some(key);
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        info!("speed tracker stopped");
        Ok(())
    }
}

fn window_duration(config: &SpeedTrackerConfig) -> Duration {
    Duration::from_secs(config.window.num_seconds().max(1) as u64)
}

/// Read whole appended lines; handles rotation by resetting to zero.
fn read_appended(path: &PathBuf, position: &mut u64) -> std::io::Result<Vec<String>> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return Ok(Vec::new()),
    };
    let len = metadata.len();
    if len < *position {
        *position = 0;
    }
    if len == *position {
        return Ok(Vec::new());
    }

    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(*position))?;

    let mut lines = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        if !line.ends_with('\n') {
            break;
        }
        *position += n as u64;
        lines.push(std::mem::take(&mut line));
    }
    Ok(lines)
}
