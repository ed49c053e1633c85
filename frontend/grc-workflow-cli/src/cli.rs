use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "grc-workflow",
    about = "Conditional and parallel approval workflow engine"
)]
pub struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Database URL, overriding the config file.
    #[arg(long)]
    pub database: Option<String>,

    #[arg(long)]
    pub log_level: Option<String>,

    /// Print single-line JSON instead of pretty output.
    #[arg(long)]
    pub compact: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create the database schema if needed.
    Init,
    /// Import a workflow bundle from YAML or JSON.
    Import { file: PathBuf },
    Workflows,
    Deactivate { workflow: Uuid },
    /// Report configuration problems in a workflow.
    Validate { workflow: Uuid },
    Steps { workflow: Uuid },
    Conditions {
        workflow: Uuid,
        #[arg(long)]
        step: Option<Uuid>,
    },
    /// Evaluate one condition against an entity snapshot.
    Evaluate {
        condition: Uuid,
        /// JSON object, or @path to a JSON file.
        #[arg(long)]
        snapshot: String,
    },
    NextStep {
        workflow: Uuid,
        step: Uuid,
        #[arg(long)]
        snapshot: String,
    },
    /// Follow routing from a step to completion.
    Walk {
        workflow: Uuid,
        step: Uuid,
        #[arg(long)]
        snapshot: String,
    },
    Start { instance: Uuid, workflow: Uuid },
    Advance {
        instance: Uuid,
        workflow: Uuid,
        step: Uuid,
        #[arg(long)]
        snapshot: String,
    },
    Executions {
        instance: Uuid,
        #[arg(long)]
        group: Option<String>,
    },
    UpdateExecution {
        execution: Uuid,
        /// pending, in_progress, completed or rejected.
        status: String,
        #[arg(long)]
        by: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    GroupComplete { instance: Uuid, group: String },
    Status { instance: Uuid, workflow: Uuid },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Import { .. } => "import",
            Self::Workflows => "workflows",
            Self::Deactivate { .. } => "deactivate",
            Self::Validate { .. } => "validate",
            Self::Steps { .. } => "steps",
            Self::Conditions { .. } => "conditions",
            Self::Evaluate { .. } => "evaluate",
            Self::NextStep { .. } => "next-step",
            Self::Walk { .. } => "walk",
            Self::Start { .. } => "start",
            Self::Advance { .. } => "advance",
            Self::Executions { .. } => "executions",
            Self::UpdateExecution { .. } => "update-execution",
            Self::GroupComplete { .. } => "group-complete",
            Self::Status { .. } => "status",
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_execution() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "grc-workflow",
            "--database",
            "sqlite::memory:",
            "update-execution",
            &id.to_string(),
            "completed",
            "--by",
            "auditor",
        ])
        .expect("parse");

        assert_eq!(cli.database.as_deref(), Some("sqlite::memory:"));
        match cli.command {
            Command::UpdateExecution {
                execution, status, by, ..
            } => {
                assert_eq!(execution, id);
                assert_eq!(status, "completed");
                assert_eq!(by.as_deref(), Some("auditor"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(Cli::try_parse_from(["grc-workflow", "steps", "not-a-uuid"]).is_err());
    }
}
