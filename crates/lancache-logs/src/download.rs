//! The persisted download entity.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A group of requests from one client to one service, separated from
/// its neighbours by the session gap.
///
/// `cache_hit_bytes + cache_miss_bytes` is the download's total size by
/// construction; there is no separately stored total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    /// Store rowid once persisted.
    pub id: Option<i64>,
    pub service: String,
    pub client_ip: String,
    pub start_utc: NaiveDateTime,
    pub end_utc: NaiveDateTime,
    pub cache_hit_bytes: i64,
    pub cache_miss_bytes: i64,
    pub is_active: bool,
    pub last_url: Option<String>,
    pub depot_id: Option<u32>,
    pub app_id: Option<u32>,
    pub game_name: Option<String>,
    pub image_url: Option<String>,
    pub datasource: String,
}

impl Download {
    pub fn total_bytes(&self) -> i64 {
        self.cache_hit_bytes + self.cache_miss_bytes
    }

    pub fn cache_hit_percent(&self) -> f64 {
        let total = self.total_bytes();
        if total > 0 {
            (self.cache_hit_bytes as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> Download {
        let t = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        Download {
            id: None,
            service: "steam".into(),
            client_ip: "10.0.0.1".into(),
            start_utc: t,
            end_utc: t,
            cache_hit_bytes: 750,
            cache_miss_bytes: 250,
            is_active: true,
            last_url: None,
            depot_id: None,
            app_id: None,
            game_name: None,
            image_url: None,
            datasource: "default".into(),
        }
    }

    #[test]
    fn total_is_hit_plus_miss() {
        let d = sample();
        assert_eq!(d.total_bytes(), 1000);
        assert!((d.cache_hit_percent() - 75.0).abs() < f64::EPSILON);
    }
}
