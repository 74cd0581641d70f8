//! Cache clear and per-service removal.
//!
//! Deletion styles:
//! - `Preserve`: delete chunk files, keep the two-level hex skeleton
//! - `Full`: remove whole service directories
//! - `Rsync`: mirror an empty directory over the tree with an rsync
//!   child process (fastest on very large trees)
//!
//! File deletion runs on a bounded worker pool; workers check the
//! cancellation token between files, and an in-flight file is always
//! finished before the job stops.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use lancache_ops::registry::OperationType;
use lancache_ops::state::CacheDeleteMode;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::inspect::enumerate_services;
use crate::jobs::{JobContext, JobHandle};

/// Deletion worker-pool width.
const DELETE_WORKERS: usize = 4;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearSummary {
    pub services: Vec<String>,
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub failed_files: usize,
    pub cancelled: bool,
}

/// Clear the whole cache or a subset of services.
pub async fn run_cache_clear(
    ctx: &JobContext,
    cache_root: &Path,
    services: Option<Vec<String>>,
    mode: CacheDeleteMode,
) -> Result<ClearSummary> {
    let op_type = if services.is_some() {
        OperationType::ServiceRemove
    } else {
        OperationType::CacheClear
    };
    let label = match &services {
        Some(list) => format!("remove services: {}", list.join(", ")),
        None => "clear cache".to_string(),
    };
    let job = ctx.begin(op_type, label);

    let result = clear_inner(ctx, &job, cache_root, services, mode).await;
    match &result {
        Ok(summary) => {
            let success = !summary.cancelled;
            job.finish(success, None)?;
            info!(
                files = summary.files_deleted,
                bytes = summary.bytes_freed,
                cancelled = summary.cancelled,
                "cache clear finished"
            );
        }
        Err(e) => {
            job.finish(false, Some(e.to_string()))?;
        }
    }
    result
}

async fn clear_inner(
    _ctx: &JobContext,
    job: &Arc<JobHandle>,
    cache_root: &Path,
    services: Option<Vec<String>>,
    mode: CacheDeleteMode,
) -> Result<ClearSummary> {
    if !cache_root.is_dir() {
        return Err(Error::CachePathMissing(cache_root.to_path_buf()));
    }
    let targets = match services {
        Some(list) => list,
        None => enumerate_services(cache_root)?,
    };
    job.progress(1.0, "enumerating cache tree");

    match mode {
        CacheDeleteMode::Rsync => rsync_clear(job, cache_root, &targets).await,
        CacheDeleteMode::Preserve | CacheDeleteMode::Full => {
            let job = Arc::clone(job);
            let cache_root = cache_root.to_path_buf();
            let preserve = mode == CacheDeleteMode::Preserve;
            tokio::task::spawn_blocking(move || {
                pooled_clear(&job, &cache_root, &targets, preserve)
            })
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
        }
    }
}

/// Preserve/full clear on a bounded rayon pool.
fn pooled_clear(
    job: &JobHandle,
    cache_root: &Path,
    targets: &[String],
    preserve_skeleton: bool,
) -> Result<ClearSummary> {
    use rayon::prelude::*;

    let mut files = Vec::new();
    for service in targets {
        let root = cache_root.join(service);
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&root).min_depth(1) {
            if job.is_cancelled() {
                break;
            }
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
    }
    let total = files.len();
    job.progress(5.0, &format!("deleting {total} cache files"));

    let deleted = AtomicUsize::new(0);
    let bytes_freed = AtomicU64::new(0);
    let failed = AtomicUsize::new(0);
    let processed = AtomicUsize::new(0);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(DELETE_WORKERS)
        .build()
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    pool.install(|| {
        files.par_iter().for_each(|path| {
            let index = processed.fetch_add(1, Ordering::Relaxed);
            if index % JobHandle::CANCEL_CHECK_INTERVAL == 0 && job.is_cancelled() {
                return;
            }

            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            match std::fs::remove_file(path) {
                Ok(()) => {
                    bytes_freed.fetch_add(size, Ordering::Relaxed);
                    let count = deleted.fetch_add(1, Ordering::Relaxed) + 1;
                    if total > 0 && count % 500 == 0 {
                        let percent = 5.0 + (count as f64 / total as f64) * 90.0;
                        job.progress(percent, &format!("deleted {count}/{total} files"));
                    }
                }
                Err(e) => {
                    warn!("failed to delete {}: {e}", path.display());
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
    });

    let cancelled = job.is_cancelled();
    if !cancelled && !preserve_skeleton {
        for service in targets {
            let root = cache_root.join(service);
            if root.is_dir() {
                if let Err(e) = std::fs::remove_dir_all(&root) {
                    warn!("failed to remove {}: {e}", root.display());
                }
            }
        }
    }

    Ok(ClearSummary {
        services: targets.to_vec(),
        files_deleted: deleted.load(Ordering::Relaxed),
        bytes_freed: bytes_freed.load(Ordering::Relaxed),
        failed_files: failed.load(Ordering::Relaxed),
        cancelled,
    })
}

/// Mirror an empty directory over each service tree with rsync.
async fn rsync_clear(
    job: &Arc<JobHandle>,
    cache_root: &Path,
    targets: &[String],
) -> Result<ClearSummary> {
    let empty = tempfile::tempdir()?;
    let empty_arg = trailing_slash(empty.path());
    let mut summary = ClearSummary {
        services: targets.to_vec(),
        files_deleted: 0,
        bytes_freed: 0,
        failed_files: 0,
        cancelled: false,
    };

    for (index, service) in targets.iter().enumerate() {
        if job.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        let target = cache_root.join(service);
        if !target.is_dir() {
            continue;
        }

        let percent = (index as f64 / targets.len().max(1) as f64) * 100.0;
        job.progress(percent, &format!("rsync-clearing {service}"));

        let mut child = tokio::process::Command::new("rsync")
            .arg("--archive")
            .arg("--delete")
            .arg(&empty_arg)
            .arg(trailing_slash(&target))
            .kill_on_drop(true)
            .spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    warn!(service = %service, "rsync exited with {status}");
                    summary.failed_files += 1;
                }
            }
            () = job.token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                summary.cancelled = true;
                break;
            }
        }
    }

    Ok(summary)
}

fn trailing_slash(path: &Path) -> String {
    let mut s = path.to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}
