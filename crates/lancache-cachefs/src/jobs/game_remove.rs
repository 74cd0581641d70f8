//! Per-game cache removal.
//!
//! Given a Steam app id, delete every cache chunk attributable to the
//! game, strip its lines from the logs, and only then delete its store
//! rows. Permission failures on the filesystem abort before the store
//! mutation so disk and database never diverge.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use lancache_ops::registry::OperationType;
use lancache_store::Store;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::jobs::log_rewrite::{discover_log_files, rewrite_filtered};
use crate::jobs::{JobContext, JobHandle};
use crate::layout::candidate_paths;

/// Final report, also written as JSON next to the operation state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRemovalReport {
    pub game_app_id: u32,
    pub game_name: String,
    pub cache_files_deleted: usize,
    pub total_bytes_freed: u64,
    pub empty_dirs_removed: usize,
    pub log_entries_removed: u64,
    pub db_downloads_deleted: usize,
    pub depot_ids: Vec<u32>,
}

/// Remove one game's footprint from cache, logs and store.
pub async fn run_game_remove(
    ctx: &JobContext,
    store: Arc<Store>,
    cache_root: &Path,
    log_dir: &Path,
    app_id: u32,
) -> Result<GameRemovalReport> {
    let game_name = store
        .game_name_for_app(app_id)?
        .unwrap_or_else(|| format!("Game {app_id}"));
    let job = ctx.begin(
        OperationType::GameRemove,
        format!("remove '{game_name}' ({app_id})"),
    );

    let cache_root = cache_root.to_path_buf();
    let log_dir = log_dir.to_path_buf();
    let job_clone = Arc::clone(&job);
    let store_clone = Arc::clone(&store);
    let name_clone = game_name.clone();

    let result = tokio::task::spawn_blocking(move || {
        remove_inner(&job_clone, &store_clone, &cache_root, &log_dir, app_id, name_clone)
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    match &result {
        Ok(report) => {
            info!(
                app_id,
                files = report.cache_files_deleted,
                bytes = report.total_bytes_freed,
                "game removal finished"
            );
            job.finish(!job.is_cancelled(), None)?;
        }
        Err(e) => job.finish(false, Some(e.to_string()))?,
    }
    result
}

fn remove_inner(
    job: &JobHandle,
    store: &Store,
    cache_root: &Path,
    log_dir: &Path,
    app_id: u32,
    game_name: String,
) -> Result<GameRemovalReport> {
    if !cache_root.is_dir() {
        return Err(Error::CachePathMissing(cache_root.to_path_buf()));
    }

    job.progress(5.0, "querying store for depot ids and URLs");
    let depot_ids: HashSet<u32> = store.depot_ids_for_app(app_id)?.into_iter().collect();
    let urls = store.urls_for_app(app_id)?;

    // Phase 1: cache chunks (10% - 70%).
    job.progress(10.0, &format!("removing cache files for {} URLs", urls.len()));
    let (deleted, bytes_freed, parent_dirs, permission_errors) =
        delete_cache_files(job, cache_root, &urls);

    if job.is_cancelled() {
        return Ok(GameRemovalReport {
            game_app_id: app_id,
            game_name,
            cache_files_deleted: deleted,
            total_bytes_freed: bytes_freed,
            empty_dirs_removed: 0,
            log_entries_removed: 0,
            db_downloads_deleted: 0,
            depot_ids: depot_ids.into_iter().collect(),
        });
    }

    job.progress(70.0, "cleaning up empty directories");
    let empty_dirs_removed = cleanup_empty_directories(cache_root, parent_dirs);

    // Phase 2: log lines (80%).
    job.progress(80.0, "removing log entries");
    let url_set: HashSet<String> = urls.iter().map(|(_, url, _)| url.clone()).collect();
    let parser = lancache_logs::parser::LogParser::default();
    let mut log_entries_removed = 0u64;
    let mut log_permission_errors = 0usize;

    for file in discover_log_files(log_dir, "access.log")? {
        if job.is_cancelled() {
            break;
        }
        let outcome = rewrite_filtered(&file, |line| {
            match parser.parse(line) {
                lancache_logs::parser::ParseOutcome::Record(record) => {
                    if record.is_heartbeat() {
                        return true;
                    }
                    let by_url = url_set.contains(&record.url);
                    let by_depot = record
                        .depot_id
                        .is_some_and(|depot| depot_ids.contains(&depot));
                    !(by_url || by_depot)
                }
                lancache_logs::parser::ParseOutcome::Unparsed => true,
            }
        });
        match outcome {
            Ok(summary) => log_entries_removed += summary.lines_removed,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!("permission denied rewriting {}: {e}", file.path.display());
                log_permission_errors += 1;
            }
            Err(e) => {
                warn!("skipping log file {}: {e}", file.path.display());
            }
        }
    }

    // Phase 3: store rows (90%), gated on a clean filesystem pass so
    // the database never claims less than the disk still holds.
    let total_permission_errors = permission_errors + log_permission_errors;
    if total_permission_errors > 0 {
        job.progress(90.0, "aborting store deletion due to permission errors");
        return Err(Error::PermissionErrors {
            count: total_permission_errors,
        });
    }

    job.progress(90.0, "deleting store rows");
    let (_, db_downloads_deleted) = store.delete_game_rows(app_id)?;

    Ok(GameRemovalReport {
        game_app_id: app_id,
        game_name,
        cache_files_deleted: deleted,
        total_bytes_freed: bytes_freed,
        empty_dirs_removed,
        log_entries_removed,
        db_downloads_deleted,
        depot_ids: depot_ids.into_iter().collect(),
    })
}

/// Probe and delete every candidate path, in parallel, counting
/// permission failures separately from absence.
fn delete_cache_files(
    job: &JobHandle,
    cache_root: &Path,
    urls: &[(String, String, i64)],
) -> (usize, u64, HashSet<PathBuf>, usize) {
    use rayon::prelude::*;

    let paths: Vec<PathBuf> = urls
        .par_iter()
        .flat_map(|(service, url, bytes)| {
            candidate_paths(
                cache_root,
                &service.to_ascii_lowercase(),
                url,
                (*bytes).max(0) as u64,
            )
        })
        .collect();
    let total = paths.len();

    let deleted = AtomicUsize::new(0);
    let bytes_freed = AtomicU64::new(0);
    let permission_errors = AtomicUsize::new(0);
    let checked = AtomicUsize::new(0);
    let last_percent = AtomicUsize::new(0);
    let parent_dirs = parking_lot::Mutex::new(HashSet::new());

    paths.par_iter().for_each(|path| {
        let index = checked.fetch_add(1, Ordering::Relaxed) + 1;
        if index % JobHandle::CANCEL_CHECK_INTERVAL == 0 && job.is_cancelled() {
            return;
        }
        if !path.exists() {
            return;
        }

        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(path) {
            Ok(()) => {
                deleted.fetch_add(1, Ordering::Relaxed);
                bytes_freed.fetch_add(size, Ordering::Relaxed);
                if let Some(parent) = path.parent() {
                    parent_dirs.lock().insert(parent.to_path_buf());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                permission_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("failed to delete {}: {e}", path.display());
            }
        }

        // Report on whole-percent boundaries only; claims the boundary
        // with a compare-exchange so one thread wins.
        if total > 0 {
            let percent = (index * 100) / total;
            let previous = last_percent.load(Ordering::Relaxed);
            if percent > previous
                && last_percent
                    .compare_exchange(previous, percent, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
            {
                let overall = 10.0 + (index as f64 / total as f64) * 60.0;
                job.progress(
                    overall,
                    &format!(
                        "removing cache files: {} deleted, checked {index}/{total}",
                        deleted.load(Ordering::Relaxed)
                    ),
                );
            }
        }
    });

    (
        deleted.load(Ordering::Relaxed),
        bytes_freed.load(Ordering::Relaxed),
        parent_dirs.into_inner(),
        permission_errors.load(Ordering::Relaxed),
    )
}

/// Remove hex fan-out directories emptied by the delete pass, deepest
/// first, then their parents when those empty out too.
fn cleanup_empty_directories(cache_root: &Path, dirs: HashSet<PathBuf>) -> usize {
    let mut removed = 0;
    let mut sorted: Vec<PathBuf> = dirs.into_iter().collect();
    sorted.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));

    for dir in sorted {
        if !dir.starts_with(cache_root) {
            continue;
        }
        let Ok(mut entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        if entries.next().is_some() {
            continue;
        }
        if std::fs::remove_dir(&dir).is_ok() {
            removed += 1;
            if let Some(parent) = dir.parent() {
                if parent.starts_with(cache_root) && parent != cache_root {
                    let empty = std::fs::read_dir(parent)
                        .map(|mut entries| entries.next().is_none())
                        .unwrap_or(false);
                    if empty && std::fs::remove_dir(parent).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
    }
    removed
}

/// Write the removal report beside the operation state files.
pub fn write_report(path: &Path, report: &GameRemovalReport) -> Result<()> {
    lancache_ops::state::write_json_atomic(path, report)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lancache_logs::download::Download;
    use lancache_ops::events::EventBus;
    use lancache_ops::registry::OperationRegistry;
    use lancache_store::{DepotMappingUpdate, LogEntryRow, Store};
    use pretty_assertions::assert_eq;
    use std::fs;

    fn at() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn seed_store(store: &Store, url: &str) {
        store
            .merge_depot_mappings(&[DepotMappingUpdate {
                depot_id: 441,
                app_id: 440,
                app_name: Some("Team Fortress 2".into()),
                is_owner: true,
                source: "SteamKit".into(),
            }])
            .unwrap();

        store
            .with_writer(|w| {
                let download = Download {
                    id: None,
                    service: "steam".into(),
                    client_ip: "10.0.0.1".into(),
                    start_utc: at(),
                    end_utc: at(),
                    cache_hit_bytes: 100,
                    cache_miss_bytes: 0,
                    is_active: false,
                    last_url: Some(url.into()),
                    depot_id: Some(441),
                    app_id: Some(440),
                    game_name: Some("Team Fortress 2".into()),
                    image_url: None,
                    datasource: "default".into(),
                };
                let id = w.upsert_download(&download)?;
                let record = lancache_logs::record::LogRecord {
                    timestamp: at(),
                    client_ip: "10.0.0.1".into(),
                    service: "steam".into(),
                    method: "GET".into(),
                    url: url.into(),
                    status: 200,
                    bytes_served: 100,
                    cache_status: lancache_logs::record::CacheStatus::Hit,
                    depot_id: Some(441),
                };
                w.insert_log_entry(&LogEntryRow::from_record(&record, Some(id), "default"))?;
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn removes_cache_logs_and_store_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();

        let url = "/depot/441/chunk/abcdef";
        let store = Arc::new(Store::open(dir.path().join("db.sqlite")).unwrap());
        seed_store(&store, url);

        // Place the chunk where the layout says it lives.
        let chunk_path = crate::layout::cache_path_no_range(&cache, "steam", url);
        fs::create_dir_all(chunk_path.parent().unwrap()).unwrap();
        fs::write(&chunk_path, vec![0u8; 256]).unwrap();

        // One log file mixing the game's line with another service.
        fs::write(
            logs.join("access.log"),
            format!(
                "[steam] 10.0.0.1 / - - - [01/Jan/2025:10:00:00 +0000] \"GET {url} HTTP/1.1\" 200 100 \"-\" \"ua\" \"HIT\" \"up\" \"-\"\n\
                 [epic] 10.0.0.2 / - - - [01/Jan/2025:10:00:01 +0000] \"GET /other HTTP/1.1\" 200 50 \"-\" \"ua\" \"MISS\" \"up\" \"-\"\n"
            ),
        )
        .unwrap();

        let ctx = JobContext::new(
            OperationRegistry::new(EventBus::default()),
            dir.path().join("operations"),
        );
        let report = run_game_remove(&ctx, Arc::clone(&store), &cache, &logs, 440)
            .await
            .unwrap();

        assert_eq!(report.game_name, "Team Fortress 2");
        assert_eq!(report.cache_files_deleted, 1);
        assert_eq!(report.total_bytes_freed, 256);
        assert_eq!(report.log_entries_removed, 1);
        assert_eq!(report.db_downloads_deleted, 1);
        assert!(report.depot_ids.contains(&441));

        assert!(!chunk_path.exists());
        assert!(report.empty_dirs_removed >= 1);
        assert_eq!(store.download_count().unwrap(), 0);
        let remaining = fs::read_to_string(logs.join("access.log")).unwrap();
        assert!(remaining.contains("[epic]"));
        assert!(!remaining.contains("[steam]"));
    }

    #[tokio::test]
    async fn unknown_game_produces_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let logs = dir.path().join("logs");
        fs::create_dir_all(cache.join("steam")).unwrap();
        fs::create_dir_all(&logs).unwrap();

        let store = Arc::new(Store::open(dir.path().join("db.sqlite")).unwrap());
        let ctx = JobContext::new(
            OperationRegistry::new(EventBus::default()),
            dir.path().join("operations"),
        );

        let report = run_game_remove(&ctx, store, &cache, &logs, 999)
            .await
            .unwrap();
        assert_eq!(report.cache_files_deleted, 0);
        assert_eq!(report.game_name, "Game 999");
    }
}
