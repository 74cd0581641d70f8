//! `lancached`, the Lancache core daemon.
//!
//! Wires the store, event bus, operation registry and background
//! tasks together: one tail ingestor per enabled datasource, the live
//! speed tracker, a periodic cache-size snapshot, and startup recovery
//! of persisted operation state. The HTTP/WebSocket surface lives in a
//! separate process and talks to this core over its APIs.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lancache_cachefs::{scan_cache_size, JobContext};
use lancache_ingest::{
    spawn_supervised, Datasource, LogTailIngestor, SpeedTracker, TailerConfig,
};
use lancache_ops::events::EventBus;
use lancache_ops::registry::OperationRegistry;
use lancache_ops::state::{recover_operations, PositionStore, RecoveryDisposition};
use lancache_store::Store;
use parking_lot::Mutex;
use settings::Settings;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lancached", about = "Lancache cache ingestion and attribution core")]
struct Args {
    /// Path to the settings JSON file.
    #[arg(long, env = "LANCACHE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long, env = "LANCACHE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Override the cache directory.
    #[arg(long, env = "LANCACHE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Add a log directory as a datasource (name:path). Repeatable.
    #[arg(long = "log-dir")]
    log_dirs: Vec<String>,

    /// Print speed snapshots as JSON lines on stdout.
    #[arg(long)]
    speed_stdout: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(args.settings.as_deref())
        .context("failed to load settings")?;
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }
    if let Some(cache_dir) = args.cache_dir {
        settings.cache_dir = cache_dir;
    }
    for spec in &args.log_dirs {
        settings.datasources.push(parse_datasource(spec)?);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(settings, args.speed_stdout))
}

fn parse_datasource(spec: &str) -> anyhow::Result<Datasource> {
    match spec.split_once(':') {
        Some((name, path)) if !name.is_empty() => Ok(Datasource::new(name, path)),
        _ => anyhow::bail!("--log-dir expects name:path, got '{spec}'"),
    }
}

async fn run(settings: Settings, speed_stdout: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(&settings.data_dir)?;
    std::fs::create_dir_all(settings.operations_dir())?;

    let store = Arc::new(Store::open(settings.store_path())?);
    let bus = EventBus::new(settings.event_capacity);
    let registry = OperationRegistry::new(bus.clone());
    let positions = Arc::new(Mutex::new(PositionStore::load(settings.positions_path())));
    // The command API (external process) drives destructive jobs
    // through this context; the daemon owns its lifetime.
    let _job_context = JobContext::new(registry.clone(), settings.operations_dir());

    replay_recovered_operations(&settings, &bus)?;

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    // One ingestor per enabled datasource.
    for datasource in settings.datasources.iter().filter(|d| d.enabled) {
        let config = TailerConfig {
            session_gap: settings.session_gap(),
            ..TailerConfig::default()
        };
        let datasource = datasource.clone();
        let store = Arc::clone(&store);
        let bus = bus.clone();
        let positions = Arc::clone(&positions);
        let shutdown_for_task = shutdown.clone();

        tasks.push(spawn_supervised(
            format!("ingest:{}", datasource.name),
            shutdown.clone(),
            move || {
                let ingestor = LogTailIngestor::new(
                    datasource.clone(),
                    Arc::clone(&store),
                    bus.clone(),
                    Arc::clone(&positions),
                    config.clone(),
                );
                let token = shutdown_for_task.clone();
                async move { ingestor.run(token).await }
            },
        ));
    }

    // Live speed tracker over all datasource logs.
    let log_paths: Vec<PathBuf> = settings
        .datasources
        .iter()
        .filter(|d| d.enabled)
        .map(Datasource::log_path)
        .collect();
    if !log_paths.is_empty() {
        let store_for_speed = Arc::clone(&store);
        let bus_for_speed = bus.clone();
        let shutdown_for_task = shutdown.clone();
        let window = settings.speed_window();

        let line_tx = speed_stdout.then(|| {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    println!("{line}");
                }
            });
            tx
        });

        tasks.push(spawn_supervised("speed-tracker", shutdown.clone(), move || {
            let mut tracker = SpeedTracker::new(
                log_paths.clone(),
                Arc::clone(&store_for_speed),
                bus_for_speed.clone(),
            )
            .with_config(lancache_ingest::SpeedTrackerConfig {
                window,
                ..lancache_ingest::SpeedTrackerConfig::default()
            });
            if let Some(tx) = &line_tx {
                tracker = tracker.with_line_sink(tx.clone());
            }
            let token = shutdown_for_task.clone();
            async move { tracker.run(token).await }
        }));
    }

    // Periodic cache-size snapshots into the store.
    tasks.push(spawn_snapshot_task(&settings, Arc::clone(&store), shutdown.clone()));

    info!("lancached running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Announce terminal operations recovered from disk exactly once and
/// report orphans.
fn replay_recovered_operations(settings: &Settings, bus: &EventBus) -> anyhow::Result<()> {
    use lancache_ops::events::{wire_timestamp, OperationComplete};
    use lancache_ops::registry::{complete_event, OperationType};
    use lancache_ops::state::OperationStatus;

    let now = chrono::Utc::now().naive_utc();
    let recovered = recover_operations(&settings.operations_dir(), now)?;
    for operation in recovered {
        match operation.disposition {
            RecoveryDisposition::CompletedPendingEvent => {
                info!(
                    id = %operation.state.id,
                    op_type = %operation.state.op_type,
                    "announcing recovered operation"
                );
                let complete = OperationComplete {
                    operation_id: operation.state.id.clone(),
                    success: operation.state.status == OperationStatus::Completed,
                    cancelled: operation.state.status == OperationStatus::Cancelled,
                    message: operation.state.message.clone(),
                    error: None,
                    timestamp: wire_timestamp(),
                };
                if let Some(event) = OperationType::parse(&operation.state.op_type)
                    .and_then(|op_type| complete_event(op_type, complete))
                {
                    bus.publish(event);
                }
            }
            RecoveryDisposition::Orphaned => {
                warn!(id = %operation.state.id, "operation orphaned by restart");
            }
            RecoveryDisposition::Pruned => {}
        }
    }
    Ok(())
}

fn spawn_snapshot_task(
    settings: &Settings,
    store: Arc<Store>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let cache_dir = settings.cache_dir.clone();
    let rates = settings.delete_rates;
    let capacity = settings.cache_capacity_bytes;
    let interval = std::time::Duration::from_secs(settings.snapshot_interval_minutes.max(1) * 60);
    let retention = chrono::Duration::days(settings.snapshot_retention_days.max(1));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = shutdown.cancelled() => break,
            }

            let cache_dir = cache_dir.clone();
            let cancel = shutdown.clone();
            let scan = tokio::task::spawn_blocking(move || {
                scan_cache_size(&cache_dir, &rates, &cancel)
            })
            .await;

            match scan {
                Ok(Ok(report)) => {
                    let now = chrono::Utc::now().naive_utc();
                    let total = capacity.max(report.total_bytes);
                    if let Err(e) = store.insert_cache_snapshot(now, report.total_bytes, total) {
                        warn!("snapshot insert failed: {e}");
                    }
                    let _ = store.trim_snapshots(now - retention);
                }
                Ok(Err(e)) => warn!("cache size scan failed: {e}"),
                Err(e) => warn!("cache size scan panicked: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn datasource_spec_parses() {
        let parsed = parse_datasource("default:/logs").unwrap();
        assert_eq!(parsed.name, "default");
        assert_eq!(parsed.log_directory, PathBuf::from("/logs"));
        assert!(parse_datasource("nocolon").is_err());
        assert!(parse_datasource(":/logs").is_err());
    }
}
