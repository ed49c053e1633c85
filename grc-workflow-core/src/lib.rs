pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod storage;
pub mod workflows;

pub use config::Config;
pub use error::{Error, Result};
pub use storage::WorkflowStore;
pub use workflows::{RoutingDecision, WorkflowEngine};

/// A configured engine over the store selected in `Config`.
pub struct GrcWorkflow {
    config: Config,
    engine: workflows::WorkflowEngine,
}

impl GrcWorkflow {
    pub fn new(config: Config) -> Result<Self> {
        config::validate_config(&config)?;
        let store = storage::create_workflow_store(&config)?;
        let engine = workflows::WorkflowEngine::new(store, config.engine.clone());
        Ok(Self { config, engine })
    }

    pub fn from_config_path(path: Option<&std::path::Path>) -> Result<Self> {
        let config = config::load(path)?;
        Self::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &workflows::WorkflowEngine {
        &self.engine
    }
}
