//! Rolling-window download speed tracking.
//!
//! A low-latency consumer of the same log stream as the session
//! aggregator: every record contributes `(bytes, t)` to a deque, old
//! entries fall out of the window, and a snapshot is the windowed byte
//! sum divided by the window length. Snapshots serialize to single
//! JSON lines consumed by the push layer.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::record::LogRecord;

/// Default rolling window.
pub const DEFAULT_WINDOW_SECS: i64 = 2;

/// Resolves a Steam depot to `(game_name, app_id)`.
///
/// Implementations cache positive results; the window calls this once
/// per distinct depot per snapshot.
pub trait DepotResolver {
    fn resolve(&mut self, depot_id: u32) -> (Option<String>, Option<u32>);
}

/// Resolver that knows nothing; used when no store is attached.
pub struct NullDepotResolver;

impl DepotResolver for NullDepotResolver {
    fn resolve(&mut self, _depot_id: u32) -> (Option<String>, Option<u32>) {
        (None, None)
    }
}

#[derive(Debug, Clone)]
struct WindowEntry {
    timestamp: NaiveDateTime,
    client_ip: String,
    service: String,
    depot_id: Option<u32>,
    bytes: i64,
    is_hit: bool,
}

/// Per-game (depot + client) byte rate within the window.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameSpeedInfo {
    pub depot_id: u32,
    pub game_name: Option<String>,
    pub game_app_id: Option<u32>,
    pub service: String,
    pub client_ip: String,
    pub bytes_per_second: f64,
    pub total_bytes: i64,
    pub request_count: usize,
    pub cache_hit_bytes: i64,
    pub cache_miss_bytes: i64,
    pub cache_hit_percent: f64,
}

/// Per-client byte rate within the window.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpeedInfo {
    pub client_ip: String,
    pub bytes_per_second: f64,
    pub total_bytes: i64,
    pub active_games: usize,
    pub cache_hit_bytes: i64,
    pub cache_miss_bytes: i64,
}

/// One emitted speed snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSpeedSnapshot {
    pub timestamp_utc: String,
    pub total_bytes_per_second: f64,
    pub game_speeds: Vec<GameSpeedInfo>,
    pub client_speeds: Vec<ClientSpeedInfo>,
    pub window_seconds: i64,
    pub entries_in_window: usize,
    pub has_active_downloads: bool,
}

impl DownloadSpeedSnapshot {
    /// Render as the single JSON line the push layer consumes.
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Rolling window of recent transfer records.
pub struct SpeedWindow {
    window: Duration,
    entries: VecDeque<WindowEntry>,
}

impl SpeedWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(Duration::seconds(DEFAULT_WINDOW_SECS))
    }

    pub fn window_seconds(&self) -> i64 {
        self.window.num_seconds().max(1)
    }

    /// Add a record to the window. Zero-byte records carry no rate
    /// information and are dropped.
    pub fn push(&mut self, record: &LogRecord) {
        if record.bytes_served <= 0 || record.is_heartbeat() {
            return;
        }
        self.entries.push_back(WindowEntry {
            timestamp: record.timestamp,
            client_ip: record.client_ip.clone(),
            service: record.service.clone(),
            depot_id: record.depot_id,
            bytes: record.bytes_served,
            is_hit: record.cache_status.counts_as_hit(),
        });
    }

    /// Drop entries older than the window, relative to `now`.
    pub fn evict(&mut self, now: NaiveDateTime) {
        let cutoff = now - self.window;
        while let Some(front) = self.entries.front() {
            if front.timestamp < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute the current snapshot. `resolver` supplies game names for
    /// depots seen in the window.
    pub fn snapshot(
        &mut self,
        now: NaiveDateTime,
        resolver: &mut dyn DepotResolver,
    ) -> DownloadSpeedSnapshot {
        self.evict(now);
        let window_secs = self.window_seconds();

        let mut game_groups: HashMap<(u32, String), Vec<&WindowEntry>> = HashMap::new();
        let mut client_groups: HashMap<String, Vec<&WindowEntry>> = HashMap::new();
        for entry in &self.entries {
            if let Some(depot) = entry.depot_id {
                game_groups
                    .entry((depot, entry.client_ip.clone()))
                    .or_default()
                    .push(entry);
            }
            client_groups
                .entry(entry.client_ip.clone())
                .or_default()
                .push(entry);
        }

        let depots: HashSet<u32> = game_groups.keys().map(|(d, _)| *d).collect();
        let mut resolved: HashMap<u32, (Option<String>, Option<u32>)> = HashMap::new();
        for depot in depots {
            resolved.insert(depot, resolver.resolve(depot));
        }

        let mut game_speeds: Vec<GameSpeedInfo> = game_groups
            .into_iter()
            .map(|((depot_id, client_ip), entries)| {
                let total_bytes: i64 = entries.iter().map(|e| e.bytes).sum();
                let cache_hit_bytes: i64 =
                    entries.iter().filter(|e| e.is_hit).map(|e| e.bytes).sum();
                let cache_miss_bytes = total_bytes - cache_hit_bytes;
                let cache_hit_percent = if total_bytes > 0 {
                    (cache_hit_bytes as f64 / total_bytes as f64) * 100.0
                } else {
                    0.0
                };
                let (game_name, game_app_id) =
                    resolved.get(&depot_id).cloned().unwrap_or((None, None));
                let service = entries
                    .first()
                    .map(|e| e.service.clone())
                    .unwrap_or_default();

                GameSpeedInfo {
                    depot_id,
                    game_name,
                    game_app_id,
                    service,
                    client_ip,
                    bytes_per_second: total_bytes as f64 / window_secs as f64,
                    total_bytes,
                    request_count: entries.len(),
                    cache_hit_bytes,
                    cache_miss_bytes,
                    cache_hit_percent,
                }
            })
            .collect();
        game_speeds.sort_by(|a, b| {
            b.bytes_per_second
                .total_cmp(&a.bytes_per_second)
                .then_with(|| a.depot_id.cmp(&b.depot_id))
        });

        let mut client_speeds: Vec<ClientSpeedInfo> = client_groups
            .into_iter()
            .map(|(client_ip, entries)| {
                let total_bytes: i64 = entries.iter().map(|e| e.bytes).sum();
                let cache_hit_bytes: i64 =
                    entries.iter().filter(|e| e.is_hit).map(|e| e.bytes).sum();
                let active_games = entries
                    .iter()
                    .filter_map(|e| e.depot_id)
                    .collect::<HashSet<_>>()
                    .len();

                ClientSpeedInfo {
                    client_ip,
                    bytes_per_second: total_bytes as f64 / window_secs as f64,
                    total_bytes,
                    active_games,
                    cache_hit_bytes,
                    cache_miss_bytes: total_bytes - cache_hit_bytes,
                }
            })
            .collect();
        client_speeds.sort_by(|a, b| {
            b.bytes_per_second
                .total_cmp(&a.bytes_per_second)
                .then_with(|| a.client_ip.cmp(&b.client_ip))
        });

        let total_bytes: i64 = self.entries.iter().map(|e| e.bytes).sum();
        let has_active_downloads = self.entries.iter().any(|e| e.depot_id.is_some());

        DownloadSpeedSnapshot {
            timestamp_utc: now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            total_bytes_per_second: total_bytes as f64 / window_secs as f64,
            game_speeds,
            client_speeds,
            window_seconds: window_secs,
            entries_in_window: self.entries.len(),
            has_active_downloads,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::CacheStatus;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn at(s: u32, milli: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_milli_opt(10, 0, s, milli)
            .unwrap()
    }

    fn record(ts: NaiveDateTime, client: &str, depot: Option<u32>, bytes: i64) -> LogRecord {
        LogRecord {
            timestamp: ts,
            client_ip: client.into(),
            service: "steam".into(),
            method: "GET".into(),
            url: "/depot/440/chunk/xx".into(),
            status: 200,
            bytes_served: bytes,
            cache_status: CacheStatus::Hit,
            depot_id: depot,
        }
    }

    #[test]
    fn windowed_rate_is_sum_over_window() {
        let mut window = SpeedWindow::with_default_window();
        window.push(&record(at(0, 0), "10.0.0.1", Some(440), 1000));
        window.push(&record(at(1, 0), "10.0.0.1", Some(440), 1000));

        let snapshot = window.snapshot(at(1, 500), &mut NullDepotResolver);
        assert_eq!(snapshot.entries_in_window, 2);
        assert!((snapshot.total_bytes_per_second - 1000.0).abs() < f64::EPSILON);
        assert!(snapshot.has_active_downloads);
        assert_eq!(snapshot.game_speeds.len(), 1);
        assert_eq!(snapshot.game_speeds[0].total_bytes, 2000);
    }

    #[test]
    fn old_entries_evicted() {
        let mut window = SpeedWindow::with_default_window();
        window.push(&record(at(0, 0), "10.0.0.1", Some(440), 500));
        window.push(&record(at(5, 0), "10.0.0.1", Some(440), 700));

        let snapshot = window.snapshot(at(6, 0), &mut NullDepotResolver);
        assert_eq!(snapshot.entries_in_window, 1);
        assert_eq!(snapshot.game_speeds[0].total_bytes, 700);
    }

    #[test]
    fn zero_byte_records_ignored() {
        let mut window = SpeedWindow::with_default_window();
        window.push(&record(at(0, 0), "10.0.0.1", Some(440), 0));
        assert!(window.is_empty());
    }

    #[test]
    fn clients_grouped_independently_of_depots() {
        let mut window = SpeedWindow::with_default_window();
        window.push(&record(at(0, 0), "10.0.0.1", Some(440), 100));
        window.push(&record(at(0, 100), "10.0.0.1", Some(570), 200));
        window.push(&record(at(0, 200), "10.0.0.2", None, 400));

        let snapshot = window.snapshot(at(1, 0), &mut NullDepotResolver);
        assert_eq!(snapshot.game_speeds.len(), 2);
        assert_eq!(snapshot.client_speeds.len(), 2);

        let first_client = snapshot
            .client_speeds
            .iter()
            .find(|c| c.client_ip == "10.0.0.1")
            .unwrap();
        assert_eq!(first_client.active_games, 2);
        assert_eq!(first_client.total_bytes, 300);
    }

    #[test]
    fn resolver_names_flow_into_snapshot() {
        struct Fixed;
        impl DepotResolver for Fixed {
            fn resolve(&mut self, depot_id: u32) -> (Option<String>, Option<u32>) {
                assert_eq!(depot_id, 440);
                (Some("Team Fortress 2".into()), Some(440))
            }
        }

        let mut window = SpeedWindow::with_default_window();
        window.push(&record(at(0, 0), "10.0.0.1", Some(440), 100));
        let snapshot = window.snapshot(at(0, 500), &mut Fixed);
        assert_eq!(
            snapshot.game_speeds[0].game_name.as_deref(),
            Some("Team Fortress 2")
        );
        assert_eq!(snapshot.game_speeds[0].game_app_id, Some(440));
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let mut window = SpeedWindow::with_default_window();
        window.push(&record(at(0, 0), "10.0.0.1", Some(440), 100));
        let line = window
            .snapshot(at(0, 500), &mut NullDepotResolver)
            .to_json_line();
        assert!(line.contains("\"totalBytesPerSecond\""));
        assert!(line.contains("\"gameSpeeds\""));
        assert!(line.contains("\"hasActiveDownloads\""));
        assert!(!line.contains('\n'));
    }
}
