//! Steam depot→app catalogue.
//!
//! The catalogue arrives from an external crawler and from prefill
//! runs. Merging is conservative: an existing `(depot, app)` row is
//! kept, and its name is replaced only when the incoming one is real
//! and the stored one is a placeholder (`App 12345`, `Steam App 12345`).

use regex::Regex;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::Store;

/// One incoming catalogue row.
#[derive(Debug, Clone)]
pub struct DepotMappingUpdate {
    pub depot_id: u32,
    pub app_id: u32,
    pub app_name: Option<String>,
    pub is_owner: bool,
    pub source: String,
}

impl DepotMappingUpdate {
    /// Row discovered by a prefill run; the prefill client only ever
    /// sees the owning app.
    pub fn from_prefill(depot_id: u32, app_id: u32, app_name: Option<String>) -> Self {
        Self {
            depot_id,
            app_id,
            app_name,
            is_owner: true,
            source: "Prefill".to_string(),
        }
    }
}

/// Counters describing what a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub renamed: usize,
    pub unchanged: usize,
}

fn placeholder_regex() -> Regex {
    #[allow(clippy::expect_used)]
    Regex::new(r"^(?:Steam )?App \d+$").expect("placeholder pattern is a valid regex")
}

fn is_placeholder(name: Option<&str>) -> bool {
    match name {
        None => true,
        Some(n) => placeholder_regex().is_match(n),
    }
}

impl Store {
    /// Merge a batch of catalogue rows.
    pub fn merge_depot_mappings(&self, updates: &[DepotMappingUpdate]) -> Result<MergeOutcome> {
        let placeholder = placeholder_regex();
        self.with_writer(|writer| {
            let mut outcome = MergeOutcome::default();
            for update in updates {
                let existing: Option<(Option<String>, bool)> = writer
                    .tx
                    .query_row(
                        "SELECT app_name, is_owner FROM depot_mappings
                         WHERE depot_id = ?1 AND app_id = ?2",
                        params![update.depot_id, update.app_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                match existing {
                    None => {
                        writer.tx.execute(
                            "INSERT INTO depot_mappings
                                 (depot_id, app_id, app_name, is_owner, source)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![
                                update.depot_id,
                                update.app_id,
                                update.app_name,
                                update.is_owner,
                                update.source,
                            ],
                        )?;
                        outcome.inserted += 1;
                    }
                    Some((existing_name, _)) => {
                        let incoming_real = update
                            .app_name
                            .as_deref()
                            .is_some_and(|n| !placeholder.is_match(n));
                        let existing_placeholder = is_placeholder(existing_name.as_deref());
                        if incoming_real && existing_placeholder {
                            writer.tx.execute(
                                "UPDATE depot_mappings SET app_name = ?3
                                 WHERE depot_id = ?1 AND app_id = ?2",
                                params![update.depot_id, update.app_id, update.app_name],
                            )?;
                            outcome.renamed += 1;
                        } else {
                            outcome.unchanged += 1;
                        }
                    }
                }
            }
            Ok(outcome)
        })
    }

    /// Owning app for a depot, if the catalogue knows one.
    pub fn owner_for_depot(&self, depot_id: u32) -> Result<Option<(u32, Option<String>)>> {
        self.with_reader(|conn| {
            Ok(conn
                .query_row(
                    "SELECT app_id, app_name FROM depot_mappings
                     WHERE depot_id = ?1 AND is_owner = 1 LIMIT 1",
                    params![depot_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })
    }

    /// Attach apps to historic downloads: the owner when one exists,
    /// otherwise a single unambiguous mapping. Returns rows updated.
    pub fn apply_mappings_to_downloads(&self) -> Result<usize> {
        self.with_writer(|writer| {
            let owned = writer.tx.execute(
                "UPDATE downloads SET
                     app_id = (SELECT dm.app_id FROM depot_mappings dm
                               WHERE dm.depot_id = downloads.depot_id AND dm.is_owner = 1
                               LIMIT 1),
                     game_name = (SELECT dm.app_name FROM depot_mappings dm
                                  WHERE dm.depot_id = downloads.depot_id AND dm.is_owner = 1
                                  LIMIT 1)
                 WHERE depot_id IS NOT NULL AND app_id IS NULL
                   AND EXISTS (SELECT 1 FROM depot_mappings dm
                               WHERE dm.depot_id = downloads.depot_id AND dm.is_owner = 1)",
                [],
            )?;

            let unambiguous = writer.tx.execute(
                "UPDATE downloads SET
                     app_id = (SELECT dm.app_id FROM depot_mappings dm
                               WHERE dm.depot_id = downloads.depot_id),
                     game_name = (SELECT dm.app_name FROM depot_mappings dm
                                  WHERE dm.depot_id = downloads.depot_id)
                 WHERE depot_id IS NOT NULL AND app_id IS NULL
                   AND (SELECT COUNT(*) FROM depot_mappings dm
                        WHERE dm.depot_id = downloads.depot_id) = 1",
                [],
            )?;

            let total = owned + unambiguous;
            if total > 0 {
                info!("attributed {total} downloads via depot mappings");
            }
            Ok(total)
        })
    }

    /// Record a prefill-cached depot manifest. A newer manifest for the
    /// same depot supersedes the previous row; the mapping side effect
    /// marks the depot's owner.
    pub fn upsert_prefill_depot(
        &self,
        depot_id: u32,
        manifest_id: u64,
        app_id: u32,
        total_bytes: u64,
        cached_by: Option<&str>,
    ) -> Result<()> {
        self.with_writer(|writer| {
            writer.tx.execute(
                "DELETE FROM prefill_depots WHERE depot_id = ?1",
                params![depot_id],
            )?;
            writer.tx.execute(
                "INSERT INTO prefill_depots
                     (depot_id, manifest_id, app_id, total_bytes, cached_at, cached_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    depot_id,
                    manifest_id as i64,
                    app_id,
                    total_bytes as i64,
                    chrono::Utc::now().naive_utc(),
                    cached_by,
                ],
            )?;
            Ok(())
        })?;

        let update = DepotMappingUpdate::from_prefill(depot_id, app_id, None);
        let outcome = self.merge_depot_mappings(std::slice::from_ref(&update))?;
        debug!(
            depot_id,
            manifest_id, app_id, ?outcome,
            "prefill depot recorded"
        );
        Ok(())
    }

    pub fn depot_mapping_count(&self) -> Result<i64> {
        self.with_reader(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM depot_mappings", [], |row| row.get(0))?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_patterns() {
        assert!(is_placeholder(Some("App 12345")));
        assert!(is_placeholder(Some("Steam App 12345")));
        assert!(is_placeholder(None));
        assert!(!is_placeholder(Some("Team Fortress 2")));
        assert!(!is_placeholder(Some("App 12345 Deluxe")));
    }
}
