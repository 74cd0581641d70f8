//! Parsed access-log records.

use chrono::NaiveDateTime;

/// Whether the proxy served a request from disk or from the origin CDN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// Served from the local cache.
    Hit,
    /// Fetched from the upstream CDN.
    Miss,
    /// The upstream-status field was absent or carried another value.
    Unknown,
}

impl CacheStatus {
    /// Interpret the third quoted trailer field of a log line.
    ///
    /// Anything other than a literal `HIT` or `MISS` maps to `Unknown`.
    pub fn from_field(field: &str) -> Self {
        match field {
            "HIT" => Self::Hit,
            "MISS" => Self::Miss,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Unknown statuses are accounted as misses when bucketing bytes.
    pub fn counts_as_hit(self) -> bool {
        matches!(self, Self::Hit)
    }
}

/// One parsed access-log line.
///
/// Records are transient: they are parsed once, folded into a download
/// and appended to the raw-row table, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Request time, normalized to naive UTC.
    pub timestamp: NaiveDateTime,
    pub client_ip: String,
    /// Normalized service label (`steam`, `blizzard`, ..., or `unknown`).
    pub service: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    /// Response size; a `-` bytes field parses as 0.
    pub bytes_served: i64,
    pub cache_status: CacheStatus,
    /// Steam depot id captured from `/depot/<id>/` paths.
    pub depot_id: Option<u32>,
}

impl LogRecord {
    /// Heartbeat probes are parsed but skipped by ingestion.
    pub fn is_heartbeat(&self) -> bool {
        crate::service::is_heartbeat_url(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_status_from_field() {
        assert_eq!(CacheStatus::from_field("HIT"), CacheStatus::Hit);
        assert_eq!(CacheStatus::from_field("MISS"), CacheStatus::Miss);
        assert_eq!(CacheStatus::from_field("EXPIRED"), CacheStatus::Unknown);
        assert_eq!(CacheStatus::from_field("-"), CacheStatus::Unknown);
        assert_eq!(CacheStatus::from_field("hit"), CacheStatus::Unknown);
    }

    #[test]
    fn unknown_counts_as_miss() {
        assert!(!CacheStatus::Unknown.counts_as_hit());
        assert!(!CacheStatus::Miss.counts_as_hit());
        assert!(CacheStatus::Hit.counts_as_hit());
    }
}
