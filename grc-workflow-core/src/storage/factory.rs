use std::sync::Arc;

use crate::config::schema::{Config, StorageBackendKind};
use crate::error::Result;
use crate::storage::memory::MemoryStore;
use crate::storage::sqlite::SqliteStore;
use crate::storage::WorkflowStore;

pub fn create_workflow_store(config: &Config) -> Result<Arc<dyn WorkflowStore>> {
    match config.storage.backend {
        StorageBackendKind::Sqlite => {
            let connection_string = config.storage.connection_string();
            tracing::debug!(connection = %connection_string, "opening sqlite workflow store");

            let store = SqliteStore::new(
                &connection_string,
                config.storage.pool_size,
                &config.storage.sqlite,
            )?;
            Ok(Arc::new(store))
        }
        StorageBackendKind::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
