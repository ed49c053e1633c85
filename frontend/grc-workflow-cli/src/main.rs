mod cli;

use std::path::Path;

use grc_workflow_core::config::StorageBackendKind;
use grc_workflow_core::workflows::{BundleLoader, ExecutionStatus, ExecutionUpdate};
use grc_workflow_core::{GrcWorkflow, WorkflowEngine};
use serde::Serialize;
use serde_json::{json, Value};

const OUTPUT_SCHEMA: &str = "grc-workflow/output/v1";

fn main() {
    if let Err(error) = run() {
        eprintln!("grc-workflow failed: {error}");
        std::process::exit(1);
    }
}

fn run() -> grc_workflow_core::Result<()> {
    let args = cli::Cli::parse_args();

    let mut config = grc_workflow_core::config::load(args.config.as_deref())?;
    if let Some(url) = args.database {
        config.storage.backend = StorageBackendKind::Sqlite;
        config.storage.database_url = Some(url);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    grc_workflow_core::logging::init_tracing(&config.logging.level);

    let runtime = tokio::runtime::Runtime::new().map_err(|err| {
        grc_workflow_core::Error::Config(format!("failed to create tokio runtime: {err}"))
    })?;
    // The sqlx pool spawns its maintenance tasks on the current runtime.
    let _guard = runtime.enter();
    let app = GrcWorkflow::new(config)?;

    let command_name = args.command.name();
    tracing::debug!(command = command_name, "dispatching command");
    match runtime.block_on(execute(app.engine(), args.command)) {
        Ok(data) => print_json_envelope(command_name, &data, args.compact),
        Err(error) => {
            print_json_error_envelope(command_name, &error, args.compact)?;
            std::process::exit(1);
        }
    }
}

/// Reads a snapshot given inline or as `@path`.
fn parse_snapshot(raw: &str) -> grc_workflow_core::Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path)).map_err(|err| {
            grc_workflow_core::Error::Validation(format!(
                "failed to read snapshot '{path}': {err}"
            ))
        })?,
        None => raw.to_owned(),
    };
    let value: Value = serde_json::from_str(&text).map_err(|err| {
        grc_workflow_core::Error::Validation(format!("snapshot is not valid JSON: {err}"))
    })?;
    if !value.is_object() {
        return Err(grc_workflow_core::Error::Validation(
            "snapshot must be a JSON object".to_owned(),
        ));
    }
    Ok(value)
}

async fn execute(
    engine: &WorkflowEngine,
    command: cli::Command,
) -> grc_workflow_core::Result<Value> {
    let data = match command {
        cli::Command::Init => {
            let workflows = engine.list_workflows().await?;
            json!({ "initialized": true, "workflows": workflows.len() })
        }
        cli::Command::Import { file } => {
            let bundle = BundleLoader::parse_file(&file)?;
            serde_json::to_value(engine.import_bundle(&bundle).await?)?
        }
        cli::Command::Workflows => serde_json::to_value(engine.list_workflows().await?)?,
        cli::Command::Deactivate { workflow } => {
            serde_json::to_value(engine.deactivate_workflow(workflow).await?)?
        }
        cli::Command::Validate { workflow } => {
            let issues = engine.validate_workflow(workflow).await?;
            let messages: Vec<String> = issues.iter().map(ToString::to_string).collect();
            json!({ "valid": issues.is_empty(), "issues": issues, "messages": messages })
        }
        cli::Command::Steps { workflow } => {
            serde_json::to_value(engine.get_conditional_steps(workflow).await?)?
        }
        cli::Command::Conditions { workflow, step } => {
            let conditions = match step {
                Some(step) => engine.get_step_conditions(step).await?,
                None => engine.get_workflow_conditions(workflow).await?,
            };
            serde_json::to_value(conditions)?
        }
        cli::Command::Evaluate {
            condition,
            snapshot,
        } => {
            let snapshot = parse_snapshot(&snapshot)?;
            let condition = engine.get_condition(condition).await?;
            json!({
                "condition_id": condition.id,
                "matched": engine.evaluate_condition(&condition, &snapshot),
            })
        }
        cli::Command::NextStep {
            workflow,
            step,
            snapshot,
        } => {
            let snapshot = parse_snapshot(&snapshot)?;
            let next = engine.get_next_step(workflow, step, &snapshot).await?;
            json!({ "current_step_id": step, "next_step_id": next })
        }
        cli::Command::Walk {
            workflow,
            step,
            snapshot,
        } => {
            let snapshot = parse_snapshot(&snapshot)?;
            json!({ "path": engine.preview_route(workflow, step, &snapshot).await? })
        }
        cli::Command::Start { instance, workflow } => {
            serde_json::to_value(engine.start_instance(instance, workflow).await?)?
        }
        cli::Command::Advance {
            instance,
            workflow,
            step,
            snapshot,
        } => {
            let snapshot = parse_snapshot(&snapshot)?;
            serde_json::to_value(engine.advance(instance, workflow, step, &snapshot).await?)?
        }
        cli::Command::Executions { instance, group } => {
            let rows = match group {
                Some(group) => engine.get_parallel_group_executions(instance, &group).await?,
                None => engine.get_parallel_executions(instance).await?,
            };
            serde_json::to_value(rows)?
        }
        cli::Command::UpdateExecution {
            execution,
            status,
            by,
            notes,
        } => {
            let update = ExecutionUpdate {
                status: ExecutionStatus::parse(&status)?,
                completed_by: by,
                notes,
            };
            serde_json::to_value(engine.update_parallel_execution(execution, update).await?)?
        }
        cli::Command::GroupComplete { instance, group } => {
            let status = engine.parallel_group_status(instance, &group).await?;
            let complete = engine.check_parallel_group_completion(instance, &group).await?;
            json!({ "group": group, "complete": complete, "status": status })
        }
        cli::Command::Status { instance, workflow } => {
            serde_json::to_value(engine.instance_status(instance, workflow).await?)?
        }
    };
    Ok(data)
}

fn render<T: Serialize>(value: &T, compact: bool) -> grc_workflow_core::Result<String> {
    let text = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    Ok(text)
}

fn print_json_envelope<T: Serialize>(
    command: &str,
    data: &T,
    compact: bool,
) -> grc_workflow_core::Result<()> {
    let envelope = CliJsonEnvelope {
        schema: OUTPUT_SCHEMA,
        status: "ok",
        command,
        data,
    };
    println!("{}", render(&envelope, compact)?);
    Ok(())
}

fn print_json_error_envelope(
    command: &str,
    error: &grc_workflow_core::Error,
    compact: bool,
) -> grc_workflow_core::Result<()> {
    let envelope = CliJsonErrorEnvelope {
        schema: OUTPUT_SCHEMA,
        status: "error",
        command,
        error: CliJsonErrorPayload {
            code: error_code(error),
            message: error.to_string(),
        },
    };
    println!("{}", render(&envelope, compact)?);
    Ok(())
}

fn error_code(error: &grc_workflow_core::Error) -> &'static str {
    match error {
        grc_workflow_core::Error::Config(_) => "config_error",
        grc_workflow_core::Error::Validation(_) => "validation_error",
        grc_workflow_core::Error::NotFound(_) => "not_found",
        grc_workflow_core::Error::Storage(_) => "storage_error",
        grc_workflow_core::Error::InvalidState(_) => "invalid_state",
        grc_workflow_core::Error::InvalidTransition { .. } => "invalid_transition",
        grc_workflow_core::Error::Conflict(_) => "conflict",
        grc_workflow_core::Error::RouteLimit { .. } => "route_limit",
    }
}

#[derive(Debug, Serialize)]
struct CliJsonEnvelope<'a, T: Serialize> {
    schema: &'a str,
    status: &'a str,
    command: &'a str,
    data: &'a T,
}

#[derive(Debug, Serialize)]
struct CliJsonErrorEnvelope<'a> {
    schema: &'a str,
    status: &'a str,
    command: &'a str,
    error: CliJsonErrorPayload,
}

#[derive(Debug, Serialize)]
struct CliJsonErrorPayload {
    code: &'static str,
    message: String,
}
