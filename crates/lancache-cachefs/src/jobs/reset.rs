//! Database reset: truncate derived tables as a registered operation.
//!
//! Destructive by definition, so it runs through the registry like
//! every other job. Datasource byte positions are cleared alongside so
//! the next ingestor pass reprocesses from byte zero.

use std::sync::Arc;

use lancache_ops::registry::OperationType;
use lancache_ops::state::PositionStore;
use lancache_store::{Store, TableClass};
use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;
use crate::jobs::JobContext;

/// Truncate `tables` and clear the byte positions of `datasources`.
pub fn run_database_reset(
    ctx: &JobContext,
    store: &Store,
    positions: &Arc<Mutex<PositionStore>>,
    tables: &[TableClass],
    datasources: &[String],
) -> Result<()> {
    let job = ctx.begin(OperationType::DatabaseReset, "reset database tables");

    let result = (|| -> Result<()> {
        job.progress(10.0, "truncating tables");
        store.reset_tables(tables)?;

        job.progress(70.0, "clearing datasource positions");
        {
            let mut positions = positions.lock();
            for datasource in datasources {
                positions.clear(datasource)?;
            }
        }
        job.progress(100.0, "reset complete");
        Ok(())
    })();

    match &result {
        Ok(()) => {
            info!(tables = tables.len(), "database reset finished");
            job.finish(true, None)?;
        }
        Err(e) => job.finish(false, Some(e.to_string()))?,
    }
    result
}
