//! Access-log line parser.
//!
//! Accepts the nginx combined-log variant emitted by Lancache:
//!
//! ```text
//! [service] ip / - - - [timestamp] "METHOD url HTTP/v" status bytes "ref" "ua" "HIT" "upstream" "-"
//! ```
//!
//! The `[service]` prefix is optional; when absent the label is derived
//! from the first path segment. Parsing never fails: lines that do not
//! match the grammar come back as [`ParseOutcome::Unparsed`] and are
//! counted by the caller.

use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use tracing::trace;

use crate::record::{CacheStatus, LogRecord};
use crate::service;

/// Result of feeding one line through the parser.
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    /// The line matched the grammar.
    Record(LogRecord),
    /// The line did not match; skip and count.
    Unparsed,
}

impl ParseOutcome {
    pub fn into_record(self) -> Option<LogRecord> {
        match self {
            Self::Record(r) => Some(r),
            Self::Unparsed => None,
        }
    }
}

/// Line parser with pre-compiled grammar.
pub struct LogParser {
    main_regex: Regex,
    depot_regex: Regex,
    local_tz: Tz,
}

impl LogParser {
    /// Build a parser that interprets zone-less timestamps in `local_tz`.
    pub fn new(local_tz: Tz) -> Self {
        // The cache writes a fixed "/ - - -" filler between the client
        // address and the timestamp.
        #[allow(clippy::expect_used)]
        let main_regex = Regex::new(
            r#"^(?:\[(?P<service>[^\]]+)\]\s+)?(?P<ip>\S+)\s+/\s+-\s+-\s+-\s+\[(?P<time>[^\]]+)\]\s+"(?P<method>[A-Z]+)\s+(?P<url>\S+)(?:\s+HTTP/(?P<http_version>[^"\s]+))?"\s+(?P<status>\d{3})\s+(?P<bytes>-|\d+)(?P<rest>.*)$"#,
        )
        .expect("log grammar is a valid regex");
        #[allow(clippy::expect_used)]
        let depot_regex = Regex::new(r"/depot/(\d+)/").expect("depot grammar is a valid regex");

        Self {
            main_regex,
            depot_regex,
            local_tz,
        }
    }

    /// Parse one line. Never errors; mismatches return `Unparsed`.
    pub fn parse(&self, line: &str) -> ParseOutcome {
        let Some(captures) = self.main_regex.captures(line) else {
            return ParseOutcome::Unparsed;
        };

        let (Some(ip), Some(time), Some(method), Some(url), Some(status), Some(bytes)) = (
            captures.name("ip"),
            captures.name("time"),
            captures.name("method"),
            captures.name("url"),
            captures.name("status"),
            captures.name("bytes"),
        ) else {
            return ParseOutcome::Unparsed;
        };

        let Some(timestamp) = self.parse_timestamp(time.as_str()) else {
            trace!("unparseable timestamp: {}", time.as_str());
            return ParseOutcome::Unparsed;
        };

        let Ok(status) = status.as_str().parse::<u16>() else {
            return ParseOutcome::Unparsed;
        };

        let bytes_served = match bytes.as_str() {
            "-" => 0,
            b => match b.parse::<i64>() {
                Ok(n) => n,
                Err(_) => return ParseOutcome::Unparsed,
            },
        };

        let url = url.as_str().to_string();
        let service = match captures.name("service") {
            Some(m) => service::normalize_service_name(m.as_str()),
            None => service::service_from_path(&url)
                .map_or_else(|| "unknown".to_string(), str::to_string),
        };

        let rest = captures.name("rest").map_or("", |m| m.as_str());
        let cache_status = extract_cache_status(rest);

        let depot_id = if service == "steam" {
            self.extract_depot_id(&url)
        } else {
            None
        };

        ParseOutcome::Record(LogRecord {
            timestamp,
            client_ip: ip.as_str().to_string(),
            service,
            method: method.as_str().to_string(),
            url,
            status,
            bytes_served,
            cache_status,
            depot_id,
        })
    }

    /// Parse the bracketed timestamp, honoring an optional `±hhmm` zone.
    ///
    /// Accepted layouts: `dd/Mon/yyyy:HH:mm:ss`, `yyyy-MM-dd HH:mm:ss`
    /// and `yyyy-MM-ddTHH:mm:ss`. Zone-less values are interpreted in
    /// the configured local zone and converted to UTC.
    fn parse_timestamp(&self, time_str: &str) -> Option<NaiveDateTime> {
        let (without_zone, offset_secs) = split_zone(time_str);

        for format in ["%d/%b/%Y:%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(without_zone, format) {
                return Some(self.to_utc(naive, offset_secs));
            }
        }
        None
    }

    fn to_utc(&self, naive: NaiveDateTime, offset_secs: Option<i32>) -> NaiveDateTime {
        if let Some(secs) = offset_secs {
            if let Some(offset) = FixedOffset::east_opt(secs) {
                if let Some(local) = offset.from_local_datetime(&naive).earliest() {
                    return local.with_timezone(&Utc).naive_utc();
                }
            }
        }

        if let Some(local) = self.local_tz.from_local_datetime(&naive).earliest() {
            return local.with_timezone(&Utc).naive_utc();
        }

        naive
    }

    fn extract_depot_id(&self, url: &str) -> Option<u32> {
        self.depot_regex
            .captures(url)
            .and_then(|cap| cap.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
    }
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new(chrono_tz::UTC)
    }
}

/// Split a trailing `±hhmm` zone suffix off a timestamp string.
///
/// Only exact four-digit suffixes count; the dashes inside ISO dates
/// must not be mistaken for a zone sign.
fn split_zone(s: &str) -> (&str, Option<i32>) {
    if let Some(pos) = s.rfind(['+', '-']) {
        let suffix = &s[pos + 1..];
        if suffix.len() == 4 && suffix.bytes().all(|b| b.is_ascii_digit()) {
            let hours = suffix[..2].parse::<i32>().unwrap_or(0);
            let minutes = suffix[2..4].parse::<i32>().unwrap_or(0);
            let sign = if s.as_bytes()[pos] == b'-' { -1 } else { 1 };
            return (
                s[..pos].trim_end(),
                Some(sign * (hours * 3600 + minutes * 60)),
            );
        }
    }
    (s, None)
}

/// Pull the cache status out of the trailing quoted fields.
///
/// The trailer is `"referer" "user-agent" "status" "upstream" "-"`; the
/// status is the third quoted field (quotes five and six).
fn extract_cache_status(rest: &str) -> CacheStatus {
    let mut quote_count = 0;
    let mut start_idx = None;

    for (i, ch) in rest.char_indices() {
        if ch == '"' {
            quote_count += 1;
            if quote_count == 5 {
                start_idx = Some(i + 1);
            } else if quote_count == 6 {
                if let Some(start) = start_idx {
                    return CacheStatus::from_field(&rest[start..i]);
                }
                break;
            }
        }
    }

    CacheStatus::Unknown
}
