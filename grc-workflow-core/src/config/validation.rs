use crate::config::schema::{Config, StorageBackendKind};
use crate::error::{Error, Result};

const JOURNAL_MODES: [&str; 6] = ["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];
const SYNCHRONOUS_MODES: [&str; 4] = ["OFF", "NORMAL", "FULL", "EXTRA"];

pub fn validate_config(config: &Config) -> Result<()> {
    let storage = &config.storage;
    if storage.pool_size == 0 {
        return Err(Error::Validation(
            "storage.pool_size must be at least 1".to_owned(),
        ));
    }

    if matches!(storage.backend, StorageBackendKind::Sqlite) {
        if storage.database_url.is_none() && storage.database_file.trim().is_empty() {
            return Err(Error::Validation(
                "storage.database_file cannot be empty for the sqlite backend".to_owned(),
            ));
        }

        let journal = storage.sqlite.journal_mode.to_ascii_uppercase();
        if !JOURNAL_MODES.contains(&journal.as_str()) {
            return Err(Error::Validation(format!(
                "unknown sqlite journal_mode '{}'",
                storage.sqlite.journal_mode
            )));
        }

        let synchronous = storage.sqlite.synchronous.to_ascii_uppercase();
        if !SYNCHRONOUS_MODES.contains(&synchronous.as_str()) {
            return Err(Error::Validation(format!(
                "unknown sqlite synchronous mode '{}'",
                storage.sqlite.synchronous
            )));
        }
    }

    let engine = &config.engine;
    if engine.max_route_steps == 0 {
        return Err(Error::Validation(
            "engine.max_route_steps must be at least 1".to_owned(),
        ));
    }
    if engine.expression_max_length == 0 || engine.expression_max_depth == 0 {
        return Err(Error::Validation(
            "expression limits must be greater than zero".to_owned(),
        ));
    }

    if config.logging.level.trim().is_empty() {
        return Err(Error::Validation("logging.level cannot be empty".to_owned()));
    }

    Ok(())
}
