//! Corruption scrub: scan then delete flagged chunks.

use std::path::Path;
use std::sync::Arc;

use lancache_ops::registry::OperationType;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::inspect::scan_corruption;
use crate::jobs::{JobContext, JobHandle};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorruptionRemovalSummary {
    pub files_scanned: u64,
    pub corrupt_found: usize,
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub failed_deletes: usize,
    pub cancelled: bool,
}

/// Scan a service (or the whole cache) for corrupt chunks and delete
/// what the scan flags.
pub async fn run_corruption_remove(
    ctx: &JobContext,
    cache_root: &Path,
    service: Option<String>,
) -> Result<CorruptionRemovalSummary> {
    let label = match &service {
        Some(service) => format!("scrub corruption in {service}"),
        None => "scrub corruption".to_string(),
    };
    let job = ctx.begin(OperationType::CorruptionRemove, label);

    let cache_root = cache_root.to_path_buf();
    let job_clone = Arc::clone(&job);
    let result = tokio::task::spawn_blocking(move || {
        scrub_inner(&job_clone, &cache_root, service.as_deref())
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    match &result {
        Ok(summary) => {
            info!(
                deleted = summary.files_deleted,
                found = summary.corrupt_found,
                "corruption removal finished"
            );
            job.finish(!summary.cancelled, None)?;
        }
        Err(e) => job.finish(false, Some(e.to_string()))?,
    }
    result
}

fn scrub_inner(
    job: &JobHandle,
    cache_root: &Path,
    service: Option<&str>,
) -> Result<CorruptionRemovalSummary> {
    job.progress(5.0, "scanning for corrupt chunks");
    let report = match scan_corruption(cache_root, service, &job.token) {
        Ok(report) => report,
        Err(Error::Cancelled) => {
            return Ok(CorruptionRemovalSummary {
                files_scanned: 0,
                corrupt_found: 0,
                files_deleted: 0,
                bytes_freed: 0,
                failed_deletes: 0,
                cancelled: true,
            })
        }
        Err(e) => return Err(e),
    };

    let total = report.corrupt.len();
    job.progress(50.0, &format!("deleting {total} corrupt chunks"));

    let mut summary = CorruptionRemovalSummary {
        files_scanned: report.files_scanned,
        corrupt_found: total,
        files_deleted: 0,
        bytes_freed: 0,
        failed_deletes: 0,
        cancelled: false,
    };

    for (index, corrupt) in report.corrupt.iter().enumerate() {
        if job.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        let size = std::fs::metadata(&corrupt.path).map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(&corrupt.path) {
            Ok(()) => {
                summary.files_deleted += 1;
                summary.bytes_freed += size;
            }
            Err(e) => {
                warn!("failed to delete corrupt chunk {}: {e}", corrupt.path.display());
                summary.failed_deletes += 1;
            }
        }
        if total > 0 {
            let percent = 50.0 + ((index + 1) as f64 / total as f64) * 50.0;
            job.progress(percent, &format!("deleted {}/{total}", summary.files_deleted));
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lancache_ops::events::EventBus;
    use lancache_ops::registry::OperationRegistry;
    use pretty_assertions::assert_eq;
    use std::fs;

    #[tokio::test]
    async fn deletes_only_flagged_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let chunk_dir = cache.join("steam").join("ab").join("cd");
        fs::create_dir_all(&chunk_dir).unwrap();

        // Healthy chunk.
        let mut healthy = vec![3u8; 32];
        healthy.extend_from_slice(b"\nKEY: steam/depot/1/chunk/a\n");
        healthy.resize(512, 0);
        fs::write(chunk_dir.join("good"), &healthy).unwrap();
        // Corrupt chunks.
        fs::write(chunk_dir.join("empty"), b"").unwrap();
        fs::write(chunk_dir.join("headerless"), vec![0u8; 128]).unwrap();

        let ctx = JobContext::new(
            OperationRegistry::new(EventBus::default()),
            dir.path().join("operations"),
        );
        let summary = run_corruption_remove(&ctx, &cache, Some("steam".to_string()))
            .await
            .unwrap();

        assert_eq!(summary.files_scanned, 3);
        assert_eq!(summary.corrupt_found, 2);
        assert_eq!(summary.files_deleted, 2);
        assert!(chunk_dir.join("good").exists());
        assert!(!chunk_dir.join("empty").exists());
        assert!(!chunk_dir.join("headerless").exists());
    }

    #[tokio::test]
    async fn events_announce_start_and_completion() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        fs::create_dir_all(cache.join("steam")).unwrap();

        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let ctx = JobContext::new(
            OperationRegistry::new(bus),
            dir.path().join("operations"),
        );
        run_corruption_remove(&ctx, &cache, Some("steam".to_string()))
            .await
            .unwrap();

        let mut topics = Vec::new();
        while let Ok(event) = rx.try_recv() {
            topics.push(event.topic());
        }
        assert!(topics.contains(&"CorruptionRemovalStarted"));
        assert_eq!(
            topics
                .iter()
                .filter(|t| **t == "CorruptionRemovalComplete")
                .count(),
            1
        );
    }
}
