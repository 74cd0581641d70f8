//! Hand-written schema and index set.
//!
//! Versioned through `PRAGMA user_version`; `initialize` is idempotent
//! and runs on every open.

use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS downloads (
    id               INTEGER PRIMARY KEY,
    service          TEXT NOT NULL,
    client_ip        TEXT NOT NULL,
    start_utc        TEXT NOT NULL,
    end_utc          TEXT NOT NULL,
    cache_hit_bytes  INTEGER NOT NULL DEFAULT 0,
    cache_miss_bytes INTEGER NOT NULL DEFAULT 0,
    is_active        INTEGER NOT NULL DEFAULT 1,
    last_url         TEXT,
    depot_id         INTEGER,
    app_id           INTEGER,
    game_name        TEXT,
    image_url        TEXT,
    datasource       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_downloads_client_service_active
    ON downloads (client_ip, service, is_active);
CREATE INDEX IF NOT EXISTS idx_downloads_start_utc ON downloads (start_utc DESC);
CREATE INDEX IF NOT EXISTS idx_downloads_is_active ON downloads (is_active);
CREATE INDEX IF NOT EXISTS idx_downloads_end_utc ON downloads (end_utc);
CREATE INDEX IF NOT EXISTS idx_downloads_datasource ON downloads (datasource);
CREATE INDEX IF NOT EXISTS idx_downloads_depot_id ON downloads (depot_id);

CREATE TABLE IF NOT EXISTS log_entries (
    id           INTEGER PRIMARY KEY,
    download_id  INTEGER REFERENCES downloads (id),
    timestamp    TEXT NOT NULL,
    client_ip    TEXT NOT NULL,
    service      TEXT NOT NULL,
    url          TEXT,
    status       INTEGER NOT NULL,
    bytes_served INTEGER NOT NULL,
    cache_status TEXT NOT NULL,
    depot_id     INTEGER,
    datasource   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_log_entries_client_service
    ON log_entries (client_ip, service);
CREATE INDEX IF NOT EXISTS idx_log_entries_timestamp ON log_entries (timestamp);
CREATE INDEX IF NOT EXISTS idx_log_entries_download_id ON log_entries (download_id);
CREATE INDEX IF NOT EXISTS idx_log_entries_dedup
    ON log_entries (client_ip, service, timestamp, url, bytes_served);

CREATE TABLE IF NOT EXISTS client_stats (
    client_ip         TEXT PRIMARY KEY,
    cache_hit_bytes   INTEGER NOT NULL DEFAULT 0,
    cache_miss_bytes  INTEGER NOT NULL DEFAULT 0,
    download_count    INTEGER NOT NULL DEFAULT 0,
    last_activity_utc TEXT
);

CREATE TABLE IF NOT EXISTS service_stats (
    service           TEXT PRIMARY KEY,
    cache_hit_bytes   INTEGER NOT NULL DEFAULT 0,
    cache_miss_bytes  INTEGER NOT NULL DEFAULT 0,
    download_count    INTEGER NOT NULL DEFAULT 0,
    last_activity_utc TEXT
);

CREATE TABLE IF NOT EXISTS depot_mappings (
    depot_id INTEGER NOT NULL,
    app_id   INTEGER NOT NULL,
    app_name TEXT,
    is_owner INTEGER NOT NULL DEFAULT 0,
    source   TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_depot_mappings_depot_app
    ON depot_mappings (depot_id, app_id);
CREATE INDEX IF NOT EXISTS idx_depot_mappings_app ON depot_mappings (app_id);

CREATE TABLE IF NOT EXISTS prefill_depots (
    depot_id    INTEGER NOT NULL,
    manifest_id INTEGER NOT NULL,
    app_id      INTEGER NOT NULL,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    cached_at   TEXT NOT NULL,
    cached_by   TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_prefill_depots_depot_manifest
    ON prefill_depots (depot_id, manifest_id);

CREATE TABLE IF NOT EXISTS cache_snapshots (
    id          INTEGER PRIMARY KEY,
    timestamp   TEXT NOT NULL,
    used_bytes  INTEGER NOT NULL,
    total_bytes INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_snapshots_timestamp
    ON cache_snapshots (timestamp);
";

/// Apply connection pragmas and create the schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    // journal_mode returns the resulting mode as a row.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    conn.execute_batch(SCHEMA)?;
    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        debug!("schema initialized at version {SCHEMA_VERSION}");
    }
    Ok(())
}
