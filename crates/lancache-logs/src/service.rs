//! Service label normalization.
//!
//! Lancache tags each log line with a `[service]` prefix when the
//! upstream vhost is known. Lines without the prefix are attributed by
//! matching the first path segment against the fixed set of CDN labels
//! the cache is deployed for.

/// Canonical service labels the cache serves.
///
/// Aliases (`uplay` → `ubisoft`, `xbox` → `microsoft`) are folded before
/// lookup.
pub const KNOWN_SERVICES: &[&str] = &[
    "steam",
    "epic",
    "blizzard",
    "riot",
    "wsus",
    "origin",
    "ubisoft",
    "gog",
    "nintendo",
    "sony",
    "microsoft",
    "apple",
    "frontier",
    "nexusmods",
    "wargaming",
    "arenanet",
];

/// Fold a raw service label to its canonical form.
///
/// Bare IP labels (the heartbeat vhost logs `[127.0.0.1]`) normalize to
/// `unknown`.
pub fn normalize_service_name(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    if lower.is_empty() || looks_like_ip(&lower) {
        return "unknown".to_string();
    }
    match lower.as_str() {
        "uplay" => "ubisoft".to_string(),
        "xbox" => "microsoft".to_string(),
        _ => lower,
    }
}

/// Derive a service label from the first URL path segment.
///
/// Returns `None` when the segment is not one of the known labels.
pub fn service_from_path(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let first = path.trim_start_matches('/').split('/').next()?;
    let folded = match first.to_ascii_lowercase().as_str() {
        "uplay" => "ubisoft",
        "xbox" => "microsoft",
        other => return KNOWN_SERVICES.iter().find(|s| **s == other).copied(),
    };
    Some(folded)
}

/// Health-check URLs that must not be folded into downloads.
pub fn is_heartbeat_url(url: &str) -> bool {
    url.starts_with("/lancache-heartbeat") || url.starts_with("/server-heartbeat")
}

fn looks_like_ip(s: &str) -> bool {
    s.parse::<std::net::IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_aliases() {
        assert_eq!(normalize_service_name("Steam"), "steam");
        assert_eq!(normalize_service_name("uplay"), "ubisoft");
        assert_eq!(normalize_service_name("XBOX"), "microsoft");
        assert_eq!(normalize_service_name("blizzard"), "blizzard");
    }

    #[test]
    fn ip_labels_are_unknown() {
        assert_eq!(normalize_service_name("127.0.0.1"), "unknown");
        assert_eq!(normalize_service_name("::1"), "unknown");
        assert_eq!(normalize_service_name(""), "unknown");
    }

    #[test]
    fn derives_service_from_path() {
        assert_eq!(service_from_path("/steam/depot/440/chunk/ab"), Some("steam"));
        assert_eq!(service_from_path("/uplay/some/file"), Some("ubisoft"));
        assert_eq!(service_from_path("/xbox/content"), Some("microsoft"));
        assert_eq!(service_from_path("/totally-new/thing"), None);
        assert_eq!(service_from_path("/"), None);
    }

    #[test]
    fn heartbeat_urls() {
        assert!(is_heartbeat_url("/lancache-heartbeat"));
        assert!(is_heartbeat_url("/server-heartbeat"));
        assert!(!is_heartbeat_url("/depot/440/chunk/ab"));
    }
}
