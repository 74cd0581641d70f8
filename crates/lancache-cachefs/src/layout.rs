//! Cache key and path derivation.
//!
//! The proxy caches under `proxy_cache_key = <service><uri><slice>`,
//! hashed with MD5 and fanned out over two directory levels built from
//! the hash's trailing hex pairs (nginx `levels=2:2`). Large objects
//! are sliced into 1 MiB ranges, each cached under its own key with a
//! `bytes=<start>-<end>` suffix.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Slice size the cache uses for ranged objects.
pub const SLICE_SIZE: u64 = 1_048_576;

/// How far into a chunk file the metadata header may reach.
const KEY_SCAN_WINDOW: usize = 4096;

/// The cache key for a URL, with an optional slice range.
pub fn cache_key(service: &str, url_path: &str, range: Option<(u64, u64)>) -> String {
    match range {
        Some((start, end)) => format!("{service}{url_path}bytes={start}-{end}"),
        None => format!("{service}{url_path}"),
    }
}

/// On-disk path of a cache key: `<service>/<aa>/<bb>/<hash>`, where
/// `aa` is the hash's last hex pair and `bb` the pair before it.
pub fn cache_path_for_key(cache_root: &Path, service: &str, key: &str) -> PathBuf {
    let hash = format!("{:x}", md5::compute(key));
    let level1 = &hash[30..32];
    let level2 = &hash[28..30];
    cache_root
        .join(service)
        .join(level1)
        .join(level2)
        .join(&hash)
}

/// Path of the unsliced cache object for a URL.
pub fn cache_path_no_range(cache_root: &Path, service: &str, url_path: &str) -> PathBuf {
    cache_path_for_key(cache_root, service, &cache_key(service, url_path, None))
}

/// Path of one slice of a URL.
pub fn cache_path_for_slice(
    cache_root: &Path,
    service: &str,
    url_path: &str,
    start: u64,
    end: u64,
) -> PathBuf {
    cache_path_for_key(
        cache_root,
        service,
        &cache_key(service, url_path, Some((start, end))),
    )
}

/// The slice ranges covering an object of `total_bytes`.
pub fn slice_ranges(total_bytes: u64) -> impl Iterator<Item = (u64, u64)> {
    let slices = total_bytes.div_ceil(SLICE_SIZE).max(1);
    (0..slices).map(|i| {
        let start = i * SLICE_SIZE;
        (start, start + SLICE_SIZE - 1)
    })
}

/// Every path a URL's content may occupy: the unsliced object plus
/// each slice. With an unknown size only the first slice is probed.
pub fn candidate_paths(
    cache_root: &Path,
    service: &str,
    url_path: &str,
    total_bytes: u64,
) -> Vec<PathBuf> {
    let mut paths = vec![cache_path_no_range(cache_root, service, url_path)];
    if total_bytes > 0 {
        for (start, end) in slice_ranges(total_bytes) {
            paths.push(cache_path_for_slice(cache_root, service, url_path, start, end));
        }
    } else {
        paths.push(cache_path_for_slice(
            cache_root,
            service,
            url_path,
            0,
            SLICE_SIZE - 1,
        ));
    }
    paths
}

/// Read the `KEY: <cache-key>` line out of a cached chunk's header.
///
/// Returns `None` when the marker is absent from the header window
/// (which the corruption scan treats as a failed file).
pub fn read_cache_key(path: &Path) -> std::io::Result<Option<String>> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; KEY_SCAN_WINDOW];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);

    let marker = b"\nKEY: ";
    let start = buf
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|p| p + marker.len());
    let Some(start) = start else {
        return Ok(None);
    };
    let end = buf[start..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(buf.len(), |p| start + p);
    Ok(Some(
        String::from_utf8_lossy(&buf[start..end]).into_owned(),
    ))
}

/// Split a Blizzard cache key back into `(archive_hash, slice_start)`.
///
/// Keys look like
/// `blizzard/tpr/wow/data/fe/ed/feedface…bytes=1048576-2097151`; the
/// archive hash is the final path segment, the offset the range start
/// (zero when the key carries no range).
pub fn parse_blizzard_key(key: &str) -> Option<(String, u64)> {
    let (path, offset) = match key.find("bytes=") {
        Some(range_at) => {
            let range = &key[range_at + "bytes=".len()..];
            let start = range.split('-').next()?.parse::<u64>().ok()?;
            (&key[..range_at], start)
        }
        None => (key, 0),
    };
    let archive = path.rsplit('/').next()?;
    if archive.len() < 8 || !archive.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((archive.to_string(), offset))
}
