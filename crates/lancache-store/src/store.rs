//! The store handle: one serialized writer, per-query readers.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use lancache_logs::download::Download;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{ClientStats, LogEntryRow, ServiceStats, StatDelta, TableClass};
use crate::schema;

/// Handle to the embedded store. Clone-free; share behind `Arc`.
pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        schema::initialize(&conn)?;
        info!("store opened at {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a read-only connection. WAL lets readers proceed while the
    /// writer holds its lock.
    fn reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(conn)
    }

    /// Run `f` against a fresh read-only connection.
    pub(crate) fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.reader()?;
        f(&conn)
    }

    /// Run `f` inside one write transaction. Commits on `Ok`, rolls
    /// back on `Err` so a failed batch leaves no partial rows behind.
    pub fn with_writer<T>(&self, f: impl FnOnce(&StoreWriter<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let writer = StoreWriter { tx };
        let out = f(&writer)?;
        writer.tx.commit()?;
        Ok(out)
    }

    // ---- download queries ------------------------------------------------

    /// Downloads whose last activity is at or after `since`, for
    /// re-seeding the aggregator after a restart.
    pub fn recent_downloads(
        &self,
        datasource: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<Download>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, service, client_ip, start_utc, end_utc, cache_hit_bytes,
                    cache_miss_bytes, is_active, last_url, depot_id, app_id,
                    game_name, image_url, datasource
             FROM downloads
             WHERE datasource = ?1 AND end_utc >= ?2",
        )?;
        let rows = stmt.query_map(params![datasource, since], download_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent downloads, newest first.
    pub fn latest_downloads(&self, limit: u32) -> Result<Vec<Download>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, service, client_ip, start_utc, end_utc, cache_hit_bytes,
                    cache_miss_bytes, is_active, last_url, depot_id, app_id,
                    game_name, image_url, datasource
             FROM downloads ORDER BY start_utc DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], download_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn active_downloads(&self) -> Result<Vec<Download>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, service, client_ip, start_utc, end_utc, cache_hit_bytes,
                    cache_miss_bytes, is_active, last_url, depot_id, app_id,
                    game_name, image_url, datasource
             FROM downloads WHERE is_active = 1 ORDER BY start_utc DESC",
        )?;
        let rows = stmt.query_map([], download_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Downloads within a time range, newest first.
    pub fn downloads_in_range(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
        limit: u32,
    ) -> Result<Vec<Download>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT id, service, client_ip, start_utc, end_utc, cache_hit_bytes,
                    cache_miss_bytes, is_active, last_url, depot_id, app_id,
                    game_name, image_url, datasource
             FROM downloads
             WHERE start_utc >= ?1 AND start_utc <= ?2
             ORDER BY start_utc DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![from, to, limit], download_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn download_count(&self) -> Result<i64> {
        let conn = self.reader()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM downloads", [], |row| row.get(0))?)
    }

    /// Seal every active download whose last record predates `before`.
    /// Belt for sessions that never make it back into memory.
    pub fn seal_stale_downloads(&self, before: NaiveDateTime) -> Result<usize> {
        let conn = self.writer.lock();
        let changed = conn.execute(
            "UPDATE downloads SET is_active = 0 WHERE is_active = 1 AND end_utc < ?1",
            params![before],
        )?;
        if changed > 0 {
            debug!("sealed {changed} stale downloads");
        }
        Ok(changed)
    }

    // ---- rollup queries --------------------------------------------------

    pub fn client_stats(&self) -> Result<Vec<ClientStats>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT client_ip, cache_hit_bytes, cache_miss_bytes, download_count,
                    last_activity_utc
             FROM client_stats ORDER BY cache_hit_bytes + cache_miss_bytes DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ClientStats {
                client_ip: row.get(0)?,
                cache_hit_bytes: row.get(1)?,
                cache_miss_bytes: row.get(2)?,
                download_count: row.get(3)?,
                last_activity_utc: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn service_stats(&self) -> Result<Vec<ServiceStats>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT service, cache_hit_bytes, cache_miss_bytes, download_count,
                    last_activity_utc
             FROM service_stats ORDER BY cache_hit_bytes + cache_miss_bytes DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ServiceStats {
                service: row.get(0)?,
                cache_hit_bytes: row.get(1)?,
                cache_miss_bytes: row.get(2)?,
                download_count: row.get(3)?,
                last_activity_utc: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ---- cache snapshots -------------------------------------------------

    pub fn insert_cache_snapshot(
        &self,
        timestamp: NaiveDateTime,
        used_bytes: u64,
        total_bytes: u64,
    ) -> Result<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO cache_snapshots (timestamp, used_bytes, total_bytes)
             VALUES (?1, ?2, ?3)",
            params![timestamp, used_bytes as i64, total_bytes as i64],
        )?;
        Ok(())
    }

    pub fn snapshots_since(
        &self,
        since: NaiveDateTime,
    ) -> Result<Vec<(NaiveDateTime, i64, i64)>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, used_bytes, total_bytes FROM cache_snapshots
             WHERE timestamp >= ?1 ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Snapshots are a time series: inserted, never updated, trimmed.
    pub fn trim_snapshots(&self, older_than: NaiveDateTime) -> Result<usize> {
        let conn = self.writer.lock();
        Ok(conn.execute(
            "DELETE FROM cache_snapshots WHERE timestamp < ?1",
            params![older_than],
        )?)
    }

    // ---- raw row queries for removal jobs --------------------------------

    /// Distinct `(service, url, max_bytes)` rows for every log entry
    /// attributed to `app_id` through the depot catalogue, including
    /// unmapped depots that match directly.
    pub fn urls_for_app(&self, app_id: u32) -> Result<Vec<(String, String, i64)>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT le.service, le.url, MAX(le.bytes_served)
             FROM log_entries le
             JOIN depot_mappings dm ON le.depot_id = dm.depot_id
             WHERE dm.app_id = ?1 AND le.url IS NOT NULL
             GROUP BY le.service, le.url",
        )?;
        let mut out: Vec<(String, String, i64)> = stmt
            .query_map(params![app_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        // Depots the crawler never mapped still match when the id is
        // used directly as the app id.
        let mut unmapped = conn.prepare(
            "SELECT le.service, le.url, MAX(le.bytes_served)
             FROM log_entries le
             WHERE le.depot_id = ?1 AND le.url IS NOT NULL
               AND le.depot_id NOT IN (SELECT depot_id FROM depot_mappings)
             GROUP BY le.service, le.url",
        )?;
        let extra = unmapped
            .query_map(params![app_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        out.extend(extra);
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Depot ids belonging to an app, from the catalogue and from
    /// attributed downloads.
    pub fn depot_ids_for_app(&self, app_id: u32) -> Result<Vec<u32>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT depot_id FROM depot_mappings WHERE app_id = ?1
             UNION
             SELECT DISTINCT depot_id FROM downloads
             WHERE app_id = ?1 AND depot_id IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![app_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn game_name_for_app(&self, app_id: u32) -> Result<Option<String>> {
        let conn = self.reader()?;
        let name = conn
            .query_row(
                "SELECT game_name FROM downloads
                 WHERE app_id = ?1 AND game_name IS NOT NULL LIMIT 1",
                params![app_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    /// Delete a game's downloads and their raw rows. Returns
    /// `(log_entries_deleted, downloads_deleted)`.
    pub fn delete_game_rows(&self, app_id: u32) -> Result<(usize, usize)> {
        self.with_writer(|writer| {
            let entries = writer.tx.execute(
                "DELETE FROM log_entries WHERE download_id IN
                 (SELECT id FROM downloads WHERE app_id = ?1)",
                params![app_id],
            )?;
            let downloads = writer
                .tx
                .execute("DELETE FROM downloads WHERE app_id = ?1", params![app_id])?;
            Ok((entries, downloads))
        })
    }

    /// Truncate the given table classes inside one transaction.
    pub fn reset_tables(&self, tables: &[TableClass]) -> Result<()> {
        self.with_writer(|writer| {
            // FK order: raw rows go before downloads.
            let mut ordered: Vec<TableClass> = TableClass::ALL
                .into_iter()
                .filter(|t| tables.contains(t))
                .collect();
            if ordered.is_empty() {
                ordered = tables.to_vec();
            }
            for table in ordered {
                let sql = format!("DELETE FROM {}", table.table_name());
                let deleted = writer.tx.execute(&sql, [])?;
                debug!("reset {}: {deleted} rows", table.table_name());
            }
            Ok(())
        })
    }
}

/// Write-transaction view handed to [`Store::with_writer`] closures.
pub struct StoreWriter<'a> {
    pub(crate) tx: Transaction<'a>,
}

impl StoreWriter<'_> {
    /// Insert or update a download, returning its rowid.
    ///
    /// `INSERT OR REPLACE` keyed on the rowid keeps this idempotent
    /// even when a previous transaction carrying the insert rolled
    /// back: replaying the batch re-creates the row under the id the
    /// aggregator already holds.
    pub fn upsert_download(&self, download: &Download) -> Result<i64> {
        self.tx.execute(
            "INSERT OR REPLACE INTO downloads
                 (id, service, client_ip, start_utc, end_utc, cache_hit_bytes,
                  cache_miss_bytes, is_active, last_url, depot_id, app_id,
                  game_name, image_url, datasource)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                download.id,
                download.service,
                download.client_ip,
                download.start_utc,
                download.end_utc,
                download.cache_hit_bytes,
                download.cache_miss_bytes,
                download.is_active,
                download.last_url,
                download.depot_id,
                download.app_id,
                download.game_name,
                download.image_url,
                download.datasource,
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Append one raw log row.
    pub fn insert_log_entry(&self, row: &LogEntryRow) -> Result<()> {
        self.tx.execute(
            "INSERT INTO log_entries
                 (download_id, timestamp, client_ip, service, url, status,
                  bytes_served, cache_status, depot_id, datasource)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                row.download_id,
                row.timestamp,
                row.client_ip,
                row.service,
                row.url,
                row.status,
                row.bytes_served,
                row.cache_status,
                row.depot_id,
                row.datasource,
            ],
        )?;
        Ok(())
    }

    /// Apply one batch's rollup deltas: one upsert per touched key.
    pub fn apply_stat_delta(&self, delta: &StatDelta) -> Result<()> {
        for (client_ip, bucket) in &delta.clients {
            self.tx.execute(
                "INSERT INTO client_stats
                     (client_ip, cache_hit_bytes, cache_miss_bytes, download_count,
                      last_activity_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (client_ip) DO UPDATE SET
                     cache_hit_bytes = cache_hit_bytes + excluded.cache_hit_bytes,
                     cache_miss_bytes = cache_miss_bytes + excluded.cache_miss_bytes,
                     download_count = download_count + excluded.download_count,
                     last_activity_utc = NULLIF(MAX(COALESCE(last_activity_utc, ''),
                                             COALESCE(excluded.last_activity_utc, '')), '')",
                params![
                    client_ip,
                    bucket.hit_bytes,
                    bucket.miss_bytes,
                    bucket.downloads_created,
                    bucket.last_activity,
                ],
            )?;
        }
        for (service, bucket) in &delta.services {
            self.tx.execute(
                "INSERT INTO service_stats
                     (service, cache_hit_bytes, cache_miss_bytes, download_count,
                      last_activity_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (service) DO UPDATE SET
                     cache_hit_bytes = cache_hit_bytes + excluded.cache_hit_bytes,
                     cache_miss_bytes = cache_miss_bytes + excluded.cache_miss_bytes,
                     download_count = download_count + excluded.download_count,
                     last_activity_utc = NULLIF(MAX(COALESCE(last_activity_utc, ''),
                                             COALESCE(excluded.last_activity_utc, '')), '')",
                params![
                    service,
                    bucket.hit_bytes,
                    bucket.miss_bytes,
                    bucket.downloads_created,
                    bucket.last_activity,
                ],
            )?;
        }
        Ok(())
    }
}

fn download_from_row(row: &Row<'_>) -> rusqlite::Result<Download> {
    Ok(Download {
        id: row.get(0)?,
        service: row.get(1)?,
        client_ip: row.get(2)?,
        start_utc: row.get(3)?,
        end_utc: row.get(4)?,
        cache_hit_bytes: row.get(5)?,
        cache_miss_bytes: row.get(6)?,
        is_active: row.get(7)?,
        last_url: row.get(8)?,
        depot_id: row.get(9)?,
        app_id: row.get(10)?,
        game_name: row.get(11)?,
        image_url: row.get(12)?,
        datasource: row.get(13)?,
    })
}
