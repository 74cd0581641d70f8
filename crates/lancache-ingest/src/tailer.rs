//! Per-datasource log tail ingestion.
//!
//! State machine: wait for the file, catch up from the persisted byte
//! position in batched transactions, then poll for appended bytes.
//! File shrinkage (rotation) resets the position to zero and re-enters
//! catch-up. Cancellation flushes the pending batch and persists the
//! position before exiting.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lancache_logs::parser::{LogParser, ParseOutcome};
use lancache_logs::record::LogRecord;
use lancache_logs::session::{SessionAggregator, DEFAULT_SESSION_GAP_SECS};
use lancache_ops::events::{
    wire_timestamp, Event, EventBus, FastProcessingComplete, ProcessingProgress,
};
use lancache_ops::state::{LogPosition, PositionStore};
use lancache_store::{LogEntryRow, StatDelta, Store};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::datasource::Datasource;
use crate::error::Result;

/// Tunables for the tail loop.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// How often the file is polled for growth.
    pub poll_interval: Duration,
    /// Rows per committed transaction.
    pub batch_size: usize,
    /// Session idle gap.
    pub session_gap: chrono::Duration,
    /// Minimum spacing of `ProcessingProgress` events.
    pub progress_interval: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 5000,
            session_gap: chrono::Duration::seconds(DEFAULT_SESSION_GAP_SECS),
            progress_interval: Duration::from_secs(1),
        }
    }
}

/// Tails one datasource's access log into the store.
pub struct LogTailIngestor {
    datasource: Datasource,
    store: Arc<Store>,
    bus: EventBus,
    positions: Arc<Mutex<PositionStore>>,
    config: TailerConfig,
    parser: LogParser,
}

impl LogTailIngestor {
    pub fn new(
        datasource: Datasource,
        store: Arc<Store>,
        bus: EventBus,
        positions: Arc<Mutex<PositionStore>>,
        config: TailerConfig,
    ) -> Self {
        Self {
            datasource,
            store,
            bus,
            positions,
            config,
            parser: LogParser::default(),
        }
    }

    /// Run until cancelled. The loop owns its aggregator; on a store
    /// failure the aggregator is re-seeded and the same bytes replay
    /// from the pre-batch position.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let log_path = self.datasource.log_path();
        let name = self.datasource.name.clone();
        info!(datasource = %name, path = %log_path.display(), "ingestor starting");

        // Idle: poll until the log file appears.
        while !log_path.exists() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let mut aggregator = self.seeded_aggregator()?;
        let mut position = self.positions.lock().get(&name);
        let mut unparsed_lines = 0u64;
        let mut last_progress = Instant::now() - self.config.progress_interval;
        let mut catch_up_announced = false;
        let mut downloads_touched = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let file_len = match std::fs::metadata(&log_path) {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    debug!(datasource = %name, "log stat failed ({e}), waiting");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            // Rotation: the file shrank under us.
            if file_len < position.bytes {
                warn!(
                    datasource = %name,
                    "log shrank ({} -> {file_len}), resetting position",
                    position.bytes
                );
                position = LogPosition::default();
                self.positions.lock().set(&name, position)?;
                catch_up_announced = false;
                continue;
            }

            if file_len == position.bytes {
                // Fully caught up: announce once, then tail.
                if !catch_up_announced {
                    catch_up_announced = true;
                    self.bus
                        .publish(Event::FastProcessingComplete(FastProcessingComplete {
                            datasource: name.clone(),
                            lines_processed: position.lines,
                            downloads_touched,
                            success: true,
                        }));
                    info!(datasource = %name, lines = position.lines, "caught up");
                }
                self.seal_and_flush(&mut aggregator)?;
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            // Read the next batch of lines off the executor.
            let batch_path = log_path.clone();
            let start = position.bytes;
            let max_lines = self.config.batch_size;
            let read = tokio::task::spawn_blocking(move || {
                read_batch(&batch_path, start, max_lines)
            })
            .await
            .map_err(|e| crate::error::Error::TaskFailed(e.to_string()))?;

            let (lines, new_position) = match read {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(datasource = %name, "log read failed: {e}");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };
            if lines.is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            let mut records = Vec::with_capacity(lines.len());
            for line in &lines {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match self.parser.parse(trimmed) {
                    ParseOutcome::Record(record) => {
                        if !record.is_heartbeat() {
                            records.push(record);
                        }
                    }
                    ParseOutcome::Unparsed => unparsed_lines += 1,
                }
            }

            match self.commit_batch(&mut aggregator, records) {
                Ok(touched) => {
                    downloads_touched += touched;
                    position.bytes = new_position;
                    position.lines += lines.len() as u64;
                    // Position is saved only after the commit; a crash
                    // replays the same bytes.
                    self.positions.lock().set(&name, position)?;
                }
                Err(e) => {
                    warn!(datasource = %name, "batch commit failed, will replay: {e}");
                    aggregator = self.seeded_aggregator()?;
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            }

            if last_progress.elapsed() >= self.config.progress_interval {
                last_progress = Instant::now();
                let percent = if file_len > 0 {
                    (position.bytes as f64 / file_len as f64) * 100.0
                } else {
                    100.0
                };
                self.bus
                    .publish(Event::ProcessingProgress(ProcessingProgress {
                        datasource: name.clone(),
                        bytes_processed: position.bytes,
                        bytes_total: file_len,
                        percent_complete: percent.min(100.0),
                        lines_processed: position.lines,
                        unparsed_lines,
                        timestamp: wire_timestamp(),
                    }));
            }
        }

        // Stopping: flush and persist.
        self.seal_and_flush(&mut aggregator)?;
        self.positions.lock().set(&self.datasource.name, position)?;
        info!(datasource = %self.datasource.name, "ingestor stopped");
        Ok(())
    }

    fn seeded_aggregator(&self) -> Result<SessionAggregator> {
        let mut aggregator =
            SessionAggregator::new(self.datasource.name.clone(), self.config.session_gap);
        let since = Utc::now().naive_utc() - self.config.session_gap;
        let recent = self.store.recent_downloads(&self.datasource.name, since)?;
        if !recent.is_empty() {
            debug!(
                datasource = %self.datasource.name,
                count = recent.len(),
                "seeding aggregator from store"
            );
        }
        aggregator.seed(recent);
        Ok(aggregator)
    }

    /// Fold a batch and commit downloads, raw rows and rollup deltas in
    /// one transaction. Returns how many downloads were touched.
    fn commit_batch(
        &self,
        aggregator: &mut SessionAggregator,
        mut records: Vec<LogRecord>,
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        records.sort_by_key(|r| r.timestamp);

        let mut delta = StatDelta::default();
        for record in &records {
            let created = aggregator.fold(record);
            delta.add_record(record);
            if created {
                delta.add_download_created(&record.client_ip, &record.service);
            }
        }
        aggregator.seal_idle(Utc::now().naive_utc());

        let datasource = &self.datasource.name;
        let touched = self.store.with_writer(|writer| {
            let mut flush_error: Option<lancache_store::Error> = None;
            let mut touched = 0u64;
            aggregator.flush_dirty(|download| match writer.upsert_download(download) {
                Ok(id) => {
                    touched += 1;
                    Some(id)
                }
                Err(e) => {
                    flush_error.get_or_insert(e);
                    None
                }
            });
            if let Some(e) = flush_error {
                return Err(e);
            }

            for record in &records {
                let download_id = aggregator.download_id(&record.client_ip, &record.service);
                writer.insert_log_entry(&LogEntryRow::from_record(
                    record,
                    download_id,
                    datasource,
                ))?;
            }
            writer.apply_stat_delta(&delta)?;
            Ok(touched)
        })?;

        Ok(touched)
    }

    /// Seal idle sessions and flush any resulting updates (small
    /// transaction, often empty).
    fn seal_and_flush(&self, aggregator: &mut SessionAggregator) -> Result<()> {
        aggregator.seal_idle(Utc::now().naive_utc());
        self.store.with_writer(|writer| {
            let mut flush_error: Option<lancache_store::Error> = None;
            aggregator.flush_dirty(|download| match writer.upsert_download(download) {
                Ok(id) => Some(id),
                Err(e) => {
                    flush_error.get_or_insert(e);
                    None
                }
            });
            match flush_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })?;
        Ok(())
    }
}

/// Read up to `max_lines` complete lines starting at `start`.
///
/// Returns the lines and the byte offset just past the last complete
/// line, so a partially-written trailing line is left for next poll.
fn read_batch(
    path: &Path,
    start: u64,
    max_lines: usize,
) -> std::io::Result<(Vec<String>, u64)> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::with_capacity(1 << 20, file);
    reader.seek(SeekFrom::Start(start))?;

    let mut lines = Vec::new();
    let mut consumed = start;
    let mut line = String::new();

    while lines.len() < max_lines {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        if !line.ends_with('\n') {
            // Incomplete trailing line; re-read it next time.
            break;
        }
        consumed += n as u64;
        lines.push(std::mem::take(&mut line));
    }

    Ok((lines, consumed))
}
