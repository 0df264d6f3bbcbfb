//! Run store implementations.

mod memory;
mod sqlite;

use std::sync::Arc;

use switchyard_config::StoreSection;
use switchyard_types::{RunStore, StoreResult};

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;

/// Open the run store described by `section`: SQLite when `runs_db` is set,
/// memory otherwise.
pub fn open_run_store(section: &StoreSection) -> StoreResult<Arc<dyn RunStore>> {
    match &section.runs_db {
        Some(path) => {
            tracing::info!(path = %path.display(), "Opening SQLite run store");
            Ok(Arc::new(SqliteRunStore::open(path)?))
        }
        None => {
            tracing::debug!("Using in-memory run store");
            Ok(Arc::new(MemoryRunStore::new()))
        }
    }
}
