use std::path::Path;

use crate::config::schema::{Config, StorageBackendKind};
use crate::error::{Error, Result};

pub const DATABASE_URL_ENV: &str = "GRC_WORKFLOW_DATABASE_URL";
pub const LOG_LEVEL_ENV: &str = "GRC_WORKFLOW_LOG_LEVEL";

/// Loads the config file if given (defaults otherwise) and applies
/// environment overrides on top.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => load_from_file(path)?,
        None => Config::default(),
    };
    Ok(apply_env_overrides(config, |key| std::env::var(key).ok()))
}

pub fn load_from_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|err| {
        Error::Config(format!("failed to read config '{}': {err}", path.display()))
    })?;

    toml::from_str(&content).map_err(|err| {
        Error::Config(format!(
            "failed to parse config '{}': {err}",
            path.display()
        ))
    })
}

pub fn apply_env_overrides<F>(mut config: Config, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup(DATABASE_URL_ENV).filter(|value| !value.trim().is_empty()) {
        config.storage.backend = StorageBackendKind::Sqlite;
        config.storage.database_url = Some(url);
    }
    if let Some(level) = lookup(LOG_LEVEL_ENV).filter(|value| !value.trim().is_empty()) {
        config.logging.level = level;
    }
    config
}
