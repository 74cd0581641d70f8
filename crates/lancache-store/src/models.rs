//! Row types and batch accumulators.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use lancache_logs::record::LogRecord;
use serde::Serialize;

/// One appended raw log row, linked to the download it folded into.
#[derive(Debug, Clone)]
pub struct LogEntryRow {
    pub download_id: Option<i64>,
    pub timestamp: NaiveDateTime,
    pub client_ip: String,
    pub service: String,
    pub url: String,
    pub status: u16,
    pub bytes_served: i64,
    pub cache_status: String,
    pub depot_id: Option<u32>,
    pub datasource: String,
}

impl LogEntryRow {
    pub fn from_record(record: &LogRecord, download_id: Option<i64>, datasource: &str) -> Self {
        Self {
            download_id,
            timestamp: record.timestamp,
            client_ip: record.client_ip.clone(),
            service: record.service.clone(),
            url: record.url.clone(),
            status: record.status,
            bytes_served: record.bytes_served,
            cache_status: record.cache_status.as_str().to_string(),
            depot_id: record.depot_id,
            datasource: datasource.to_string(),
        }
    }
}

/// Per-client rollup row. Monotonic except on explicit resets.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub client_ip: String,
    pub cache_hit_bytes: i64,
    pub cache_miss_bytes: i64,
    pub download_count: i64,
    pub last_activity_utc: Option<NaiveDateTime>,
}

/// Per-service rollup row.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub service: String,
    pub cache_hit_bytes: i64,
    pub cache_miss_bytes: i64,
    pub download_count: i64,
    pub last_activity_utc: Option<NaiveDateTime>,
}

/// One accumulated rollup bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatBucket {
    pub hit_bytes: i64,
    pub miss_bytes: i64,
    pub downloads_created: i64,
    pub last_activity: Option<NaiveDateTime>,
}

impl StatBucket {
    fn touch(&mut self, at: NaiveDateTime) {
        if self.last_activity.is_none_or(|t| at > t) {
            self.last_activity = Some(at);
        }
    }
}

/// Rollup deltas for one ingest batch; applied to the store in a
/// single statement pair per touched key.
#[derive(Debug, Default)]
pub struct StatDelta {
    pub clients: HashMap<String, StatBucket>,
    pub services: HashMap<String, StatBucket>,
}

impl StatDelta {
    /// Fold one record's bytes into both rollups.
    pub fn add_record(&mut self, record: &LogRecord) {
        let (hit, miss) = if record.cache_status.counts_as_hit() {
            (record.bytes_served, 0)
        } else {
            (0, record.bytes_served)
        };
        for bucket in [
            self.clients.entry(record.client_ip.clone()).or_default(),
            self.services.entry(record.service.clone()).or_default(),
        ] {
            bucket.hit_bytes += hit;
            bucket.miss_bytes += miss;
            bucket.touch(record.timestamp);
        }
    }

    /// Count a newly created download against both rollups.
    pub fn add_download_created(&mut self, client_ip: &str, service: &str) {
        self.clients
            .entry(client_ip.to_string())
            .or_default()
            .downloads_created += 1;
        self.services
            .entry(service.to_string())
            .or_default()
            .downloads_created += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.services.is_empty()
    }
}

/// Table classes a reset operation may truncate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableClass {
    Downloads,
    LogEntries,
    ClientStats,
    ServiceStats,
    DepotMappings,
    PrefillDepots,
    CacheSnapshots,
}

impl TableClass {
    pub const ALL: [Self; 7] = [
        Self::LogEntries,
        Self::Downloads,
        Self::ClientStats,
        Self::ServiceStats,
        Self::DepotMappings,
        Self::PrefillDepots,
        Self::CacheSnapshots,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Downloads => "downloads",
            Self::LogEntries => "log_entries",
            Self::ClientStats => "client_stats",
            Self::ServiceStats => "service_stats",
            Self::DepotMappings => "depot_mappings",
            Self::PrefillDepots => "prefill_depots",
            Self::CacheSnapshots => "cache_snapshots",
        }
    }
}
