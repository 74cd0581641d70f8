//! Cache-tree introspection: size, services, corruption, game chunks.
//!
//! Every walk checks the cancellation token as it goes and skips
//! unreadable entries, counting them instead of failing the scan.

use std::path::{Path, PathBuf};
use std::time::Instant;

use lancache_logs::service::KNOWN_SERVICES;
use lancache_tact::ChunkMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::layout::{parse_blizzard_key, read_cache_key};

/// Files-per-second factors for the deletion-time estimate.
///
/// Heuristics by deletion method; carried in configuration so
/// deployments on slow storage can adjust them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteRateConfig {
    pub preserve_files_per_sec: f64,
    pub full_files_per_sec: f64,
    pub rsync_files_per_sec: f64,
}

impl Default for DeleteRateConfig {
    fn default() -> Self {
        Self {
            preserve_files_per_sec: 3000.0,
            full_files_per_sec: 5000.0,
            rsync_files_per_sec: 8000.0,
        }
    }
}

/// Deletion-time estimate per method, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEstimate {
    pub preserve: f64,
    pub full: f64,
    pub rsync: f64,
}

/// Result of a full cache size walk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSizeReport {
    pub total_bytes: u64,
    pub total_files: u64,
    pub total_directories: u64,
    /// Directories whose name is a two-hex-char fan-out level.
    pub hex_directories: u64,
    pub unreadable_entries: u64,
    pub scan_ms: u64,
    pub estimated_delete_seconds: DeleteEstimate,
}

/// Walk the whole cache tree accumulating size and counts.
pub fn scan_cache_size(
    cache_root: &Path,
    rates: &DeleteRateConfig,
    cancel: &CancellationToken,
) -> Result<CacheSizeReport> {
    if !cache_root.is_dir() {
        return Err(Error::CachePathMissing(cache_root.to_path_buf()));
    }
    let started = Instant::now();

    let mut total_bytes = 0u64;
    let mut total_files = 0u64;
    let mut total_directories = 0u64;
    let mut hex_directories = 0u64;
    let mut unreadable = 0u64;

    for entry in WalkDir::new(cache_root).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping unreadable entry: {e}");
                unreadable += 1;
                continue;
            }
        };
        if entry.file_type().is_dir() {
            total_directories += 1;
            if is_hex_fanout_dir(entry.file_name().to_str()) {
                hex_directories += 1;
            }
        } else if entry.file_type().is_file() {
            total_files += 1;
            match entry.metadata() {
                Ok(metadata) => total_bytes += metadata.len(),
                Err(_) => unreadable += 1,
            }
        }
    }

    let scan_ms = started.elapsed().as_millis() as u64;
    let files = total_files as f64;
    let report = CacheSizeReport {
        total_bytes,
        total_files,
        total_directories,
        hex_directories,
        unreadable_entries: unreadable,
        scan_ms,
        estimated_delete_seconds: DeleteEstimate {
            preserve: files / rates.preserve_files_per_sec.max(1.0),
            full: files / rates.full_files_per_sec.max(1.0),
            rsync: files / rates.rsync_files_per_sec.max(1.0),
        },
    };
    debug!(
        bytes = report.total_bytes,
        files = report.total_files,
        ms = report.scan_ms,
        "cache size scan finished"
    );
    Ok(report)
}

fn is_hex_fanout_dir(name: Option<&str>) -> bool {
    name.is_some_and(|n| n.len() == 2 && n.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Top-level cache directories that correspond to known services.
pub fn enumerate_services(cache_root: &Path) -> Result<Vec<String>> {
    let mut services = Vec::new();
    for entry in std::fs::read_dir(cache_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if KNOWN_SERVICES.contains(&name) {
                services.push(name.to_string());
            }
        }
    }
    services.sort();
    Ok(services)
}

/// One chunk file that failed validation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorruptFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorruptionReport {
    pub files_scanned: u64,
    pub unreadable_files: u64,
    pub corrupt: Vec<CorruptFile>,
}

/// Validate chunk files under one service (or the whole cache).
///
/// A healthy nginx chunk carries its metadata header, including the
/// `KEY: <cache-key>` line, inside the first few KiB. Empty files and
/// files without the marker are flagged.
pub fn scan_corruption(
    cache_root: &Path,
    service: Option<&str>,
    cancel: &CancellationToken,
) -> Result<CorruptionReport> {
    let root = match service {
        Some(service) => cache_root.join(service),
        None => cache_root.to_path_buf(),
    };
    if !root.is_dir() {
        return Err(Error::CachePathMissing(root));
    }

    let mut report = CorruptionReport {
        files_scanned: 0,
        unreadable_files: 0,
        corrupt: Vec::new(),
    };

    for entry in WalkDir::new(&root).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Ok(entry) = entry else {
            report.unreadable_files += 1;
            continue;
        };
        if !entry.file_type().is_file() {
            continue;
        }
        report.files_scanned += 1;

        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(_) => {
                report.unreadable_files += 1;
                continue;
            }
        };
        if size == 0 {
            report.corrupt.push(CorruptFile {
                path: entry.path().to_path_buf(),
                reason: "empty chunk".to_string(),
            });
            continue;
        }

        match read_cache_key(entry.path()) {
            Ok(Some(_)) => {}
            Ok(None) => report.corrupt.push(CorruptFile {
                path: entry.path().to_path_buf(),
                reason: "missing KEY header".to_string(),
            }),
            Err(e) => {
                warn!("unreadable chunk {}: {e}", entry.path().display());
                report.unreadable_files += 1;
            }
        }
    }

    debug!(
        scanned = report.files_scanned,
        corrupt = report.corrupt.len(),
        "corruption scan finished"
    );
    Ok(report)
}

/// A cached chunk attributed to a game file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocatedChunk {
    pub path: PathBuf,
    pub file_name: String,
    pub archive_hash: String,
    pub offset: u64,
}

/// Find cached Blizzard chunks that belong to the chunk map's game.
///
/// Each chunk file's cache key names the archive and slice offset;
/// the chunk map answers whether that byte range is part of the game.
pub fn locate_blizzard_chunks(
    cache_root: &Path,
    chunk_map: &ChunkMap,
    cancel: &CancellationToken,
) -> Result<Vec<LocatedChunk>> {
    let root = cache_root.join("blizzard");
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut located = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(Some(key)) = read_cache_key(entry.path()) else {
            continue;
        };
        let Some((archive_hash, offset)) = parse_blizzard_key(&key) else {
            continue;
        };
        let Some(archive_index) = chunk_map.archive_index_of(&archive_hash) else {
            continue;
        };
        if let Some(file) = chunk_map.find_file(archive_index, offset) {
            located.push(LocatedChunk {
                path: entry.path().to_path_buf(),
                file_name: file.name.clone(),
                archive_hash,
                offset,
            });
        }
    }

    debug!(chunks = located.len(), "blizzard chunk location finished");
    Ok(located)
}
