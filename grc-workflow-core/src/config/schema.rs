use serde::{Deserialize, Serialize};

use crate::workflows::conditions::{AmountParsing, EvaluatorOptions};
use crate::workflows::expressions::EvaluationOptions;
use crate::workflows::parallel::RejectionPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    /// Full connection URL. Overrides `database_file` when set.
    pub database_url: Option<String>,
    pub database_file: String,
    pub connection_string_prefix: String,
    pub pool_size: usize,
    pub sqlite: SqliteStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Sqlite,
            database_url: None,
            database_file: "grc-workflow.db".to_owned(),
            connection_string_prefix: "sqlite://".to_owned(),
            pool_size: 5,
            sqlite: SqliteStorageConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn connection_string(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!("{}{}", self.connection_string_prefix, self.database_file),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteStorageConfig {
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
    pub synchronous: String,
    pub foreign_keys: bool,
    pub create_if_missing: bool,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            journal_mode: "WAL".to_owned(),
            synchronous: "NORMAL".to_owned(),
            foreign_keys: true,
            create_if_missing: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on steps visited by a route walk.
    pub max_route_steps: usize,
    pub rejection_policy: RejectionPolicy,
    /// Reject execution status changes outside
    /// `pending -> in_progress -> completed | rejected`.
    pub enforce_transitions: bool,
    pub allow_cyclic_routes: bool,
    pub amount_parsing: AmountParsing,
    pub expression_max_length: usize,
    pub expression_max_depth: usize,
    /// Freeze the workflow graph for each instance when it starts.
    pub snapshot_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let expression = EvaluationOptions::default();
        Self {
            max_route_steps: 256,
            rejection_policy: RejectionPolicy::Strict,
            enforce_transitions: true,
            allow_cyclic_routes: false,
            amount_parsing: AmountParsing::Strict,
            expression_max_length: expression.max_length,
            expression_max_depth: expression.max_depth,
            snapshot_on_start: true,
        }
    }
}

impl EngineConfig {
    pub fn expression_options(&self) -> EvaluationOptions {
        EvaluationOptions {
            max_length: self.expression_max_length,
            max_depth: self.expression_max_depth,
        }
    }

    pub fn evaluator_options(&self) -> EvaluatorOptions {
        EvaluatorOptions {
            amount_parsing: self.amount_parsing,
            expression: self.expression_options(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}
