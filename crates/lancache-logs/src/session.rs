//! Session aggregation: folding record streams into downloads.
//!
//! Records are grouped by `(client_ip, service)`. A gap of more than
//! [`DEFAULT_SESSION_GAP_SECS`] between consecutive records closes the
//! current download and the next record opens a new one. The gap check
//! is inclusive: a record landing exactly on the boundary still belongs
//! to the running session.

use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime};
use tracing::debug;

use crate::download::Download;
use crate::record::LogRecord;

/// Idle period separating two downloads of the same key.
pub const DEFAULT_SESSION_GAP_SECS: i64 = 300;

type SessionKey = (String, String);

struct ActiveSession {
    download: Download,
    last_record_time: NaiveDateTime,
    dirty: bool,
}

/// Folds [`LogRecord`]s into [`Download`] mutations.
///
/// The aggregator keeps every touched session in memory until it has
/// been sealed for longer than the gap; within that horizon a late
/// record re-opens the sealed download instead of duplicating it.
pub struct SessionAggregator {
    gap: Duration,
    datasource: String,
    sessions: HashMap<SessionKey, ActiveSession>,
    /// Sealed downloads displaced by a newer session for the same key,
    /// waiting for their final state to be flushed.
    retired: Vec<Download>,
}

impl SessionAggregator {
    pub fn new(datasource: impl Into<String>, gap: Duration) -> Self {
        Self {
            gap,
            datasource: datasource.into(),
            sessions: HashMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn with_default_gap(datasource: impl Into<String>) -> Self {
        Self::new(datasource, Duration::seconds(DEFAULT_SESSION_GAP_SECS))
    }

    /// Pre-load recent downloads from the store after a restart so late
    /// records re-open them instead of duplicating.
    pub fn seed(&mut self, downloads: impl IntoIterator<Item = Download>) {
        for download in downloads {
            let key = (download.client_ip.clone(), download.service.clone());
            let last = download.end_utc;
            self.sessions.insert(
                key,
                ActiveSession {
                    download,
                    last_record_time: last,
                    dirty: false,
                },
            );
        }
    }

    /// Fold one record into its session, creating or re-opening a
    /// download as needed. Returns `true` when a new download was
    /// created. Records must arrive in per-key timestamp order; the
    /// tail path's occasional one-second backwards skew is absorbed by
    /// folding any record that lands inside the gap.
    pub fn fold(&mut self, record: &LogRecord) -> bool {
        let key = (record.client_ip.clone(), record.service.clone());

        let continues = self
            .sessions
            .get(&key)
            .is_some_and(|s| record.timestamp - s.last_record_time <= self.gap);

        if continues {
            if let Some(session) = self.sessions.get_mut(&key) {
                if !session.download.is_active {
                    debug!(
                        client = %record.client_ip,
                        service = %record.service,
                        "re-opening sealed download for late record"
                    );
                    session.download.is_active = true;
                }
                apply_record(&mut session.download, record);
                if record.timestamp > session.last_record_time {
                    session.last_record_time = record.timestamp;
                }
                session.dirty = true;
            }
            return false;
        }

        // A stale session for this key gets sealed and queued so its
        // final state still reaches the store.
        if let Some(mut stale) = self.sessions.remove(&key) {
            stale.download.is_active = false;
            self.retired.push(stale.download);
        }

        let mut download = Download {
            id: None,
            service: record.service.clone(),
            client_ip: record.client_ip.clone(),
            start_utc: record.timestamp,
            end_utc: record.timestamp,
            cache_hit_bytes: 0,
            cache_miss_bytes: 0,
            is_active: true,
            last_url: None,
            depot_id: None,
            app_id: None,
            game_name: None,
            image_url: None,
            datasource: self.datasource.clone(),
        };
        apply_record(&mut download, record);

        self.sessions.insert(
            key,
            ActiveSession {
                download,
                last_record_time: record.timestamp,
                dirty: true,
            },
        );
        true
    }

    /// Sort a batch by timestamp and fold every record. The bulk path
    /// uses this; the tail path folds line by line.
    pub fn fold_batch(&mut self, mut records: Vec<LogRecord>) {
        records.sort_by_key(|r| r.timestamp);
        for record in &records {
            self.fold(record);
        }
    }

    /// Seal every session idle for longer than the gap, relative to
    /// `reference` (wall clock on the tail path, max record time on the
    /// bulk path). Sealing is idempotent; sessions that stayed sealed
    /// and flushed for more than twice the gap are evicted.
    pub fn seal_idle(&mut self, reference: NaiveDateTime) {
        let mut evict = Vec::new();
        for (key, session) in &mut self.sessions {
            let idle = reference - session.last_record_time;
            if idle > self.gap && session.download.is_active {
                session.download.is_active = false;
                session.dirty = true;
            }
            if idle > self.gap * 2 && !session.download.is_active && !session.dirty {
                evict.push(key.clone());
            }
        }
        for key in evict {
            self.sessions.remove(&key);
        }
    }

    /// Visit every dirty download, persisting it through `persist` and
    /// recording the id it returns. A `None` from `persist` marks a
    /// failed write: the download stays dirty (or retired) so the next
    /// flush retries it after the transaction is replayed.
    pub fn flush_dirty<F>(&mut self, mut persist: F)
    where
        F: FnMut(&Download) -> Option<i64>,
    {
        self.retired.retain(|sealed| persist(sealed).is_none());
        for session in self.sessions.values_mut() {
            if session.dirty {
                if let Some(id) = persist(&session.download) {
                    session.download.id = Some(id);
                    session.dirty = false;
                }
            }
        }
    }

    /// Drop all in-memory state (used when a failed batch forces a
    /// re-seed from the store).
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.retired.clear();
    }

    /// Store rowid of the download a record for `(client, service)`
    /// currently folds into.
    pub fn download_id(&self, client_ip: &str, service: &str) -> Option<i64> {
        self.sessions
            .get(&(client_ip.to_string(), service.to_string()))
            .and_then(|s| s.download.id)
    }

    /// Number of sessions currently tracked.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Downloads currently marked active.
    pub fn active_downloads(&self) -> impl Iterator<Item = &Download> {
        self.sessions
            .values()
            .filter(|s| s.download.is_active)
            .map(|s| &s.download)
    }
}

fn apply_record(download: &mut Download, record: &LogRecord) {
    if record.cache_status.counts_as_hit() {
        download.cache_hit_bytes += record.bytes_served;
    } else {
        download.cache_miss_bytes += record.bytes_served;
    }
    if record.timestamp > download.end_utc {
        download.end_utc = record.timestamp;
    }
    if record.timestamp < download.start_utc {
        download.start_utc = record.timestamp;
    }
    download.last_url = Some(record.url.clone());
    // Depot is set once and never cleared by depot-less records.
    if download.service == "steam" && download.depot_id.is_none() {
        download.depot_id = record.depot_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CacheStatus;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn record(ts: NaiveDateTime, bytes: i64, status: CacheStatus) -> LogRecord {
        LogRecord {
            timestamp: ts,
            client_ip: "10.0.0.1".into(),
            service: "steam".into(),
            method: "GET".into(),
            url: "/depot/440/chunk/xx".into(),
            status: 200,
            bytes_served: bytes,
            cache_status: status,
            depot_id: Some(440),
        }
    }

    fn drain(agg: &mut SessionAggregator) -> Vec<Download> {
        let mut out = Vec::new();
        agg.flush_dirty(|d| {
            out.push(d.clone());
            None
        });
        out
    }

    #[test]
    fn records_within_gap_share_a_download() {
        let mut agg = SessionAggregator::with_default_gap("default");
        agg.fold(&record(at(10, 0, 0), 1000, CacheStatus::Hit));
        agg.fold(&record(at(10, 4, 59), 2000, CacheStatus::Miss));

        let downloads = drain(&mut agg);
        assert_eq!(downloads.len(), 1);
        let d = &downloads[0];
        assert_eq!(d.cache_hit_bytes, 1000);
        assert_eq!(d.cache_miss_bytes, 2000);
        assert_eq!(d.total_bytes(), 3000);
        assert_eq!(d.depot_id, Some(440));
        assert!(d.is_active);
    }

    #[test]
    fn gap_boundary_is_inclusive() {
        let mut agg = SessionAggregator::with_default_gap("default");
        agg.fold(&record(at(10, 0, 0), 10, CacheStatus::Hit));
        agg.fold(&record(at(10, 5, 0), 10, CacheStatus::Hit));
        assert_eq!(agg.session_count(), 1);

        // One second past the gap starts a fresh session.
        agg.fold(&record(at(10, 10, 1), 10, CacheStatus::Hit));
        assert_eq!(agg.session_count(), 1);
        let downloads = drain(&mut agg);
        // Old sealed download plus the new active one.
        assert_eq!(downloads.len(), 2);
        assert!(!downloads[0].is_active);
        assert!(downloads[1].is_active);
    }

    #[test]
    fn one_second_past_gap_starts_new_session() {
        let mut agg = SessionAggregator::with_default_gap("default");
        agg.fold(&record(at(10, 0, 0), 10, CacheStatus::Hit));
        agg.fold(&record(at(10, 5, 1), 10, CacheStatus::Hit));

        let downloads = drain(&mut agg);
        assert_eq!(downloads.len(), 2);
        assert!(!downloads[0].is_active, "first download sealed");
        assert!(downloads[1].is_active, "second download active");
    }

    #[test]
    fn unknown_status_bytes_count_as_miss() {
        let mut agg = SessionAggregator::with_default_gap("default");
        agg.fold(&record(at(10, 0, 0), 123, CacheStatus::Unknown));

        let downloads = drain(&mut agg);
        assert_eq!(downloads[0].cache_miss_bytes, 123);
        assert_eq!(downloads[0].cache_hit_bytes, 0);
    }

    #[test]
    fn depot_is_set_once() {
        let mut agg = SessionAggregator::with_default_gap("default");
        agg.fold(&record(at(10, 0, 0), 1, CacheStatus::Hit));

        let mut no_depot = record(at(10, 0, 1), 1, CacheStatus::Hit);
        no_depot.depot_id = None;
        agg.fold(&no_depot);

        let mut other_depot = record(at(10, 0, 2), 1, CacheStatus::Hit);
        other_depot.depot_id = Some(999);
        agg.fold(&other_depot);

        let downloads = drain(&mut agg);
        assert_eq!(downloads[0].depot_id, Some(440));
    }

    #[test]
    fn sealing_is_idempotent_and_reopens_on_late_record() {
        let mut agg = SessionAggregator::with_default_gap("default");
        agg.fold(&record(at(10, 0, 0), 10, CacheStatus::Hit));

        agg.seal_idle(at(10, 6, 0));
        agg.seal_idle(at(10, 6, 30));
        let downloads = drain(&mut agg);
        assert_eq!(downloads.len(), 1);
        assert!(!downloads[0].is_active);

        // Late record within the gap of the last record re-opens.
        agg.fold(&record(at(10, 4, 0), 5, CacheStatus::Hit));
        let downloads = drain(&mut agg);
        assert_eq!(downloads.len(), 1);
        assert!(downloads[0].is_active);
        assert_eq!(downloads[0].cache_hit_bytes, 15);
    }

    #[test]
    fn seeded_sealed_download_reopens() {
        let mut agg = SessionAggregator::with_default_gap("default");
        let mut seeded = Download {
            id: Some(7),
            service: "steam".into(),
            client_ip: "10.0.0.1".into(),
            start_utc: at(9, 55, 0),
            end_utc: at(10, 0, 0),
            cache_hit_bytes: 100,
            cache_miss_bytes: 0,
            is_active: false,
            last_url: None,
            depot_id: Some(440),
            app_id: None,
            game_name: None,
            image_url: None,
            datasource: "default".into(),
        };
        seeded.last_url = Some("/depot/440/chunk/aa".into());
        agg.seed([seeded]);

        agg.fold(&record(at(10, 3, 0), 50, CacheStatus::Hit));
        let downloads = drain(&mut agg);
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].id, Some(7));
        assert!(downloads[0].is_active);
        assert_eq!(downloads[0].cache_hit_bytes, 150);
    }

    #[test]
    fn bulk_fold_sorts_before_folding() {
        let mut agg = SessionAggregator::with_default_gap("default");
        let batch = vec![
            record(at(10, 4, 0), 1, CacheStatus::Hit),
            record(at(10, 0, 0), 2, CacheStatus::Hit),
            record(at(10, 2, 0), 4, CacheStatus::Hit),
        ];
        agg.fold_batch(batch);

        let downloads = drain(&mut agg);
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].cache_hit_bytes, 7);
        assert_eq!(downloads[0].start_utc, at(10, 0, 0));
        assert_eq!(downloads[0].end_utc, at(10, 4, 0));
    }

    #[test]
    fn byte_conservation_across_sessions() {
        let mut agg = SessionAggregator::with_default_gap("default");
        let mut total = 0;
        for (i, minutes) in [0i64, 1, 2, 12, 13, 30].iter().enumerate() {
            let ts = at(10, 0, 0) + Duration::minutes(*minutes);
            let bytes = (i as i64 + 1) * 100;
            total += bytes;
            agg.fold(&record(ts, bytes, CacheStatus::Miss));
        }
        let downloads = drain(&mut agg);
        assert_eq!(downloads.len(), 3);
        let sum: i64 = downloads.iter().map(Download::total_bytes).sum();
        assert_eq!(sum, total);
    }

    #[test]
    fn eviction_after_two_gaps() {
        let mut agg = SessionAggregator::with_default_gap("default");
        agg.fold(&record(at(10, 0, 0), 1, CacheStatus::Hit));
        agg.seal_idle(at(10, 6, 0));
        drain(&mut agg);
        assert_eq!(agg.session_count(), 1);
        agg.seal_idle(at(10, 11, 0));
        assert_eq!(agg.session_count(), 0);
    }
}
