use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::config::schema::SqliteStorageConfig;
use crate::error::{Error, Result};
use crate::storage::WorkflowStore;
use crate::workflows::types::{
    Condition, ConditionRule, ExecutionStatus, ExecutionType, ParallelExecution, RuleColumns,
    StepDefinition, WorkflowDefinition, WorkflowGraph,
};

const SCHEMA_V1: [&str; 11] = [
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL PRIMARY KEY)",
    "INSERT INTO schema_version(version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
    "CREATE TABLE IF NOT EXISTS workflows (id TEXT PRIMARY KEY, name TEXT NOT NULL, entity_type TEXT NOT NULL, is_active INTEGER NOT NULL, execution_type TEXT NOT NULL, convergence_step_id TEXT, created_at TEXT NOT NULL, updated_at TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS workflow_steps (id TEXT PRIMARY KEY, workflow_id TEXT NOT NULL, step_order INTEGER NOT NULL, name TEXT NOT NULL, assignee_role TEXT NOT NULL, required INTEGER NOT NULL, is_parallel INTEGER NOT NULL, parallel_group TEXT, parallel_order INTEGER, created_at TEXT NOT NULL, FOREIGN KEY(workflow_id) REFERENCES workflows(id) ON DELETE CASCADE)",
    "CREATE TABLE IF NOT EXISTS workflow_conditions (id TEXT PRIMARY KEY, step_id TEXT NOT NULL, name TEXT NOT NULL, condition_type TEXT NOT NULL, operator TEXT NOT NULL, condition_value TEXT NOT NULL, condition_metadata TEXT, next_step_id TEXT, is_active INTEGER NOT NULL, sequence INTEGER NOT NULL, created_at TEXT NOT NULL, FOREIGN KEY(step_id) REFERENCES workflow_steps(id) ON DELETE CASCADE)",
    "CREATE TABLE IF NOT EXISTS parallel_workflow_executions (id TEXT PRIMARY KEY, approval_request_id TEXT NOT NULL, parallel_group TEXT NOT NULL, step_id TEXT NOT NULL, status TEXT NOT NULL, execution_order INTEGER NOT NULL, started_at TEXT, completed_at TEXT, completed_by TEXT, notes TEXT, created_at TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS workflow_instance_snapshots (approval_request_id TEXT PRIMARY KEY, workflow_id TEXT NOT NULL, graph_json TEXT NOT NULL, created_at TEXT NOT NULL)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_steps_workflow_order ON workflow_steps(workflow_id, step_order)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_conditions_step_sequence ON workflow_conditions(step_id, sequence)",
    "CREATE INDEX IF NOT EXISTS idx_parallel_executions_instance_group ON parallel_workflow_executions(approval_request_id, parallel_group, execution_order)",
    "UPDATE schema_version SET version = 1",
];

const WORKFLOW_COLUMNS: &str =
    "id, name, entity_type, is_active, execution_type, convergence_step_id, created_at, updated_at";
const STEP_COLUMNS: &str =
    "id, workflow_id, step_order, name, assignee_role, required, is_parallel, parallel_group, parallel_order, created_at";
const EXECUTION_COLUMNS: &str =
    "id, approval_request_id, parallel_group, step_id, status, execution_order, started_at, completed_at, completed_by, notes, created_at";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: sqlx::SqlitePool,
    initialized: std::sync::Arc<OnceCell<()>>,
}

impl SqliteStore {
    pub fn new(
        connection_string: &str,
        pool_size: usize,
        sqlite: &SqliteStorageConfig,
    ) -> Result<Self> {
        let journal_mode = SqliteJournalMode::from_str(&sqlite.journal_mode).map_err(|err| {
            Error::Config(format!(
                "invalid sqlite journal_mode '{}': {err}",
                sqlite.journal_mode
            ))
        })?;
        let synchronous = SqliteSynchronous::from_str(&sqlite.synchronous).map_err(|err| {
            Error::Config(format!(
                "invalid sqlite synchronous mode '{}': {err}",
                sqlite.synchronous
            ))
        })?;

        let options = SqliteConnectOptions::from_str(connection_string)
            .map_err(|err| {
                Error::Storage(format!(
                    "invalid SQLite connection string '{connection_string}': {err}"
                ))
            })?
            .create_if_missing(sqlite.create_if_missing)
            .foreign_keys(sqlite.foreign_keys)
            .busy_timeout(Duration::from_millis(sqlite.busy_timeout_ms))
            .journal_mode(journal_mode)
            .synchronous(synchronous);

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1) as u32)
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            initialized: std::sync::Arc::new(OnceCell::new()),
        })
    }

    /// A private in-memory database. The pool holds a single connection that
    /// is never recycled, since each SQLite memory connection is its own
    /// database.
    pub fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|err| Error::Storage(format!("failed to configure SQLite memory db: {err}")))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_lazy_with(options);

        Ok(Self {
            pool,
            initialized: std::sync::Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                for statement in SCHEMA_V1 {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(Error::from)
            .map(|_| ())
    }

    pub async fn schema_version(&self) -> Result<Option<u32>> {
        self.ensure_initialized().await?;

        let row = sqlx::query("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|value| value.get::<i64, _>("version") as u32))
    }

    fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|timestamp| timestamp.with_timezone(&Utc))
            .map_err(|err| Error::Storage(format!("failed to parse timestamp '{value}': {err}")))
    }

    fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
        value.as_deref().map(Self::parse_timestamp).transpose()
    }

    fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
        Uuid::parse_str(value)
            .map_err(|err| Error::Storage(format!("invalid {what} uuid '{value}': {err}")))
    }

    fn parse_optional_uuid(value: Option<String>, what: &str) -> Result<Option<Uuid>> {
        value.as_deref().map(|id| Self::parse_uuid(id, what)).transpose()
    }

    fn workflow_from_row(row: &SqliteRow) -> Result<WorkflowDefinition> {
        Ok(WorkflowDefinition {
            id: Self::parse_uuid(&row.get::<String, _>("id"), "workflow")?,
            name: row.get::<String, _>("name"),
            entity_type: row.get::<String, _>("entity_type"),
            is_active: row.get::<bool, _>("is_active"),
            execution_type: ExecutionType::parse(&row.get::<String, _>("execution_type"))?,
            convergence_step_id: Self::parse_optional_uuid(
                row.get::<Option<String>, _>("convergence_step_id"),
                "convergence step",
            )?,
            created_at: Self::parse_timestamp(&row.get::<String, _>("created_at"))?,
            updated_at: Self::parse_timestamp(&row.get::<String, _>("updated_at"))?,
        })
    }

    fn step_from_row(row: &SqliteRow) -> Result<StepDefinition> {
        Ok(StepDefinition {
            id: Self::parse_uuid(&row.get::<String, _>("id"), "step")?,
            workflow_id: Self::parse_uuid(&row.get::<String, _>("workflow_id"), "workflow")?,
            step_order: row.get::<i32, _>("step_order"),
            name: row.get::<String, _>("name"),
            assignee_role: row.get::<String, _>("assignee_role"),
            required: row.get::<bool, _>("required"),
            is_parallel: row.get::<bool, _>("is_parallel"),
            parallel_group: row.get::<Option<String>, _>("parallel_group"),
            parallel_order: row.get::<Option<i32>, _>("parallel_order"),
            created_at: Self::parse_timestamp(&row.get::<String, _>("created_at"))?,
        })
    }

    fn condition_from_row(row: &SqliteRow) -> Result<Condition> {
        let metadata = row
            .get::<Option<String>, _>("condition_metadata")
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;
        let columns = RuleColumns {
            condition_type: row.get::<String, _>("condition_type"),
            operator: row.get::<String, _>("operator"),
            condition_value: row.get::<String, _>("condition_value"),
            condition_metadata: metadata,
        };

        Ok(Condition {
            id: Self::parse_uuid(&row.get::<String, _>("id"), "condition")?,
            step_id: Self::parse_uuid(&row.get::<String, _>("step_id"), "step")?,
            name: row.get::<String, _>("name"),
            rule: ConditionRule::from_columns(&columns)?,
            next_step_id: Self::parse_optional_uuid(
                row.get::<Option<String>, _>("next_step_id"),
                "next step",
            )?,
            is_active: row.get::<bool, _>("is_active"),
            sequence: row.get::<i64, _>("sequence"),
            created_at: Self::parse_timestamp(&row.get::<String, _>("created_at"))?,
        })
    }

    fn execution_from_row(row: &SqliteRow) -> Result<ParallelExecution> {
        Ok(ParallelExecution {
            id: Self::parse_uuid(&row.get::<String, _>("id"), "execution")?,
            approval_request_id: Self::parse_uuid(
                &row.get::<String, _>("approval_request_id"),
                "approval request",
            )?,
            parallel_group: row.get::<String, _>("parallel_group"),
            step_id: Self::parse_uuid(&row.get::<String, _>("step_id"), "step")?,
            status: ExecutionStatus::parse(&row.get::<String, _>("status"))?,
            execution_order: row.get::<i32, _>("execution_order"),
            started_at: Self::parse_optional_timestamp(row.get::<Option<String>, _>("started_at"))?,
            completed_at: Self::parse_optional_timestamp(
                row.get::<Option<String>, _>("completed_at"),
            )?,
            completed_by: row.get::<Option<String>, _>("completed_by"),
            notes: row.get::<Option<String>, _>("notes"),
            created_at: Self::parse_timestamp(&row.get::<String, _>("created_at"))?,
        })
    }

    fn insert_error(err: sqlx::Error, what: &str) -> Error {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("{what} already exists"))
            }
            _ => Error::from(err),
        }
    }

    async fn insert_workflow_row(
        conn: &mut SqliteConnection,
        workflow: &WorkflowDefinition,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflows(id, name, entity_type, is_active, execution_type, convergence_step_id, created_at, updated_at) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.entity_type)
        .bind(workflow.is_active)
        .bind(workflow.execution_type.as_str())
        .bind(workflow.convergence_step_id.map(|id| id.to_string()))
        .bind(workflow.created_at.to_rfc3339())
        .bind(workflow.updated_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|err| Self::insert_error(err, &format!("workflow '{}'", workflow.id)))?;
        Ok(())
    }

    async fn insert_step_row(conn: &mut SqliteConnection, step: &StepDefinition) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflow_steps(id, workflow_id, step_order, name, assignee_role, required, is_parallel, parallel_group, parallel_order, created_at) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(step.id.to_string())
        .bind(step.workflow_id.to_string())
        .bind(step.step_order)
        .bind(&step.name)
        .bind(&step.assignee_role)
        .bind(step.required)
        .bind(step.is_parallel)
        .bind(&step.parallel_group)
        .bind(step.parallel_order)
        .bind(step.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|err| Self::insert_error(err, &format!("workflow step '{}'", step.id)))?;
        Ok(())
    }

    async fn next_condition_sequence(conn: &mut SqliteConnection) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) + 1 AS next_sequence FROM workflow_conditions",
        )
        .fetch_one(&mut *conn)
        .await?;
        Ok(row.get::<i64, _>("next_sequence"))
    }

    async fn insert_condition_row(
        conn: &mut SqliteConnection,
        condition: &Condition,
        sequence: i64,
    ) -> Result<()> {
        let columns = condition.rule.to_columns();
        let metadata = columns
            .condition_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO workflow_conditions(id, step_id, name, condition_type, operator, condition_value, condition_metadata, next_step_id, is_active, sequence, created_at) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(condition.id.to_string())
        .bind(condition.step_id.to_string())
        .bind(&condition.name)
        .bind(&columns.condition_type)
        .bind(&columns.operator)
        .bind(&columns.condition_value)
        .bind(metadata)
        .bind(condition.next_step_id.map(|id| id.to_string()))
        .bind(condition.is_active)
        .bind(sequence)
        .bind(condition.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|err| {
            Self::insert_error(err, &format!("workflow condition '{}'", condition.id))
        })?;
        Ok(())
    }

    async fn insert_execution_row(
        conn: &mut SqliteConnection,
        execution: &ParallelExecution,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO parallel_workflow_executions(id, approval_request_id, parallel_group, step_id, status, execution_order, started_at, completed_at, completed_by, notes, created_at) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(execution.id.to_string())
        .bind(execution.approval_request_id.to_string())
        .bind(&execution.parallel_group)
        .bind(execution.step_id.to_string())
        .bind(execution.status.as_str())
        .bind(execution.execution_order)
        .bind(execution.started_at.map(|at| at.to_rfc3339()))
        .bind(execution.completed_at.map(|at| at.to_rfc3339()))
        .bind(&execution.completed_by)
        .bind(&execution.notes)
        .bind(execution.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .map_err(|err| {
            Self::insert_error(err, &format!("parallel execution '{}'", execution.id))
        })?;
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn create_workflow(&self, workflow: WorkflowDefinition) -> Result<()> {
        self.ensure_initialized().await?;

        let mut conn = self.pool.acquire().await?;
        Self::insert_workflow_row(&mut conn, &workflow).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowDefinition>> {
        self.ensure_initialized().await?;

        let row = sqlx::query(&format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::workflow_from_row).transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at ASC, name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::workflow_from_row).collect()
    }

    async fn update_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        self.ensure_initialized().await?;

        let result = sqlx::query(
            "UPDATE workflows SET name = ?, entity_type = ?, is_active = ?, execution_type = ?, convergence_step_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&workflow.name)
        .bind(&workflow.entity_type)
        .bind(workflow.is_active)
        .bind(workflow.execution_type.as_str())
        .bind(workflow.convergence_step_id.map(|id| id.to_string()))
        .bind(workflow.updated_at.to_rfc3339())
        .bind(workflow.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("workflow '{}'", workflow.id)));
        }
        Ok(())
    }

    async fn create_step(&self, step: StepDefinition) -> Result<()> {
        self.ensure_initialized().await?;

        if self.get_workflow(step.workflow_id).await?.is_none() {
            return Err(Error::NotFound(format!("workflow '{}'", step.workflow_id)));
        }

        let mut conn = self.pool.acquire().await?;
        Self::insert_step_row(&mut conn, &step).await
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepDefinition>> {
        self.ensure_initialized().await?;

        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM workflow_steps WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::step_from_row).transpose()
    }

    async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<StepDefinition>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = ? ORDER BY step_order ASC, created_at ASC"
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::step_from_row).collect()
    }

    async fn update_step(&self, step: &StepDefinition) -> Result<()> {
        self.ensure_initialized().await?;

        let result = sqlx::query(
            "UPDATE workflow_steps SET step_order = ?, name = ?, assignee_role = ?, required = ?, is_parallel = ?, parallel_group = ?, parallel_order = ? WHERE id = ?",
        )
        .bind(step.step_order)
        .bind(&step.name)
        .bind(&step.assignee_role)
        .bind(step.required)
        .bind(step.is_parallel)
        .bind(&step.parallel_group)
        .bind(step.parallel_order)
        .bind(step.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("workflow step '{}'", step.id)));
        }
        Ok(())
    }

    async fn insert_condition(&self, mut condition: Condition) -> Result<Condition> {
        self.ensure_initialized().await?;

        let mut tx = self.pool.begin().await?;

        let step = sqlx::query("SELECT id FROM workflow_steps WHERE id = ?")
            .bind(condition.step_id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if step.is_none() {
            return Err(Error::NotFound(format!(
                "workflow step '{}'",
                condition.step_id
            )));
        }

        let sequence = Self::next_condition_sequence(&mut tx).await?;
        Self::insert_condition_row(&mut tx, &condition, sequence).await?;
        tx.commit().await?;

        condition.sequence = sequence;
        Ok(condition)
    }

    async fn get_condition(&self, id: Uuid) -> Result<Option<Condition>> {
        self.ensure_initialized().await?;

        let row = sqlx::query("SELECT * FROM workflow_conditions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::condition_from_row).transpose()
    }

    async fn list_step_conditions(&self, step_id: Uuid) -> Result<Vec<Condition>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query(
            "SELECT * FROM workflow_conditions WHERE step_id = ? ORDER BY sequence ASC",
        )
        .bind(step_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::condition_from_row).collect()
    }

    async fn list_workflow_conditions(&self, workflow_id: Uuid) -> Result<Vec<Condition>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query(
            "SELECT c.* FROM workflow_conditions c JOIN workflow_steps s ON s.id = c.step_id WHERE s.workflow_id = ? ORDER BY c.sequence ASC",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::condition_from_row).collect()
    }

    async fn update_condition(&self, condition: &Condition) -> Result<()> {
        self.ensure_initialized().await?;

        let columns = condition.rule.to_columns();
        let metadata = columns
            .condition_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            "UPDATE workflow_conditions SET name = ?, condition_type = ?, operator = ?, condition_value = ?, condition_metadata = ?, next_step_id = ?, is_active = ? WHERE id = ?",
        )
        .bind(&condition.name)
        .bind(&columns.condition_type)
        .bind(&columns.operator)
        .bind(&columns.condition_value)
        .bind(metadata)
        .bind(condition.next_step_id.map(|id| id.to_string()))
        .bind(condition.is_active)
        .bind(condition.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "workflow condition '{}'",
                condition.id
            )));
        }
        Ok(())
    }

    async fn delete_condition(&self, id: Uuid) -> Result<bool> {
        self.ensure_initialized().await?;

        let result = sqlx::query("DELETE FROM workflow_conditions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_executions(&self, executions: &[ParallelExecution]) -> Result<()> {
        self.ensure_initialized().await?;

        let mut tx = self.pool.begin().await?;
        for execution in executions {
            Self::insert_execution_row(&mut tx, execution).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ParallelExecution>> {
        self.ensure_initialized().await?;

        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM parallel_workflow_executions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::execution_from_row).transpose()
    }

    async fn list_executions(&self, approval_request_id: Uuid) -> Result<Vec<ParallelExecution>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM parallel_workflow_executions WHERE approval_request_id = ? ORDER BY parallel_group ASC, execution_order ASC"
        ))
        .bind(approval_request_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::execution_from_row).collect()
    }

    async fn list_group_executions(
        &self,
        approval_request_id: Uuid,
        group: &str,
    ) -> Result<Vec<ParallelExecution>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM parallel_workflow_executions WHERE approval_request_id = ? AND parallel_group = ? ORDER BY execution_order ASC"
        ))
        .bind(approval_request_id.to_string())
        .bind(group)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::execution_from_row).collect()
    }

    async fn update_execution(&self, execution: &ParallelExecution) -> Result<()> {
        self.ensure_initialized().await?;

        let result = sqlx::query(
            "UPDATE parallel_workflow_executions SET status = ?, started_at = ?, completed_at = ?, completed_by = ?, notes = ? WHERE id = ?",
        )
        .bind(execution.status.as_str())
        .bind(execution.started_at.map(|at| at.to_rfc3339()))
        .bind(execution.completed_at.map(|at| at.to_rfc3339()))
        .bind(&execution.completed_by)
        .bind(&execution.notes)
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "parallel execution '{}'",
                execution.id
            )));
        }
        Ok(())
    }

    async fn save_instance_graph(
        &self,
        approval_request_id: Uuid,
        graph: &WorkflowGraph,
    ) -> Result<()> {
        self.ensure_initialized().await?;

        let graph_json = serde_json::to_string(graph)?;
        sqlx::query(
            "INSERT INTO workflow_instance_snapshots(approval_request_id, workflow_id, graph_json, created_at) VALUES(?, ?, ?, ?) ON CONFLICT(approval_request_id) DO UPDATE SET workflow_id = excluded.workflow_id, graph_json = excluded.graph_json",
        )
        .bind(approval_request_id.to_string())
        .bind(graph.workflow.id.to_string())
        .bind(graph_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_instance_graph(
        &self,
        approval_request_id: Uuid,
    ) -> Result<Option<WorkflowGraph>> {
        self.ensure_initialized().await?;

        let row = sqlx::query(
            "SELECT graph_json FROM workflow_instance_snapshots WHERE approval_request_id = ?",
        )
        .bind(approval_request_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let graph = serde_json::from_str(&row.get::<String, _>("graph_json"))?;
        Ok(Some(graph))
    }

    async fn import_workflow(
        &self,
        workflow: &WorkflowDefinition,
        steps: &[StepDefinition],
        conditions: &[Condition],
    ) -> Result<Vec<Condition>> {
        self.ensure_initialized().await?;

        let mut tx = self.pool.begin().await?;
        Self::insert_workflow_row(&mut tx, workflow).await?;
        for step in steps {
            Self::insert_step_row(&mut tx, step).await?;
        }

        let mut sequence = Self::next_condition_sequence(&mut tx).await?;
        let mut stored = Vec::with_capacity(conditions.len());
        for condition in conditions {
            Self::insert_condition_row(&mut tx, condition, sequence).await?;
            let mut condition = condition.clone();
            condition.sequence = sequence;
            stored.push(condition);
            sequence += 1;
        }
        tx.commit().await?;

        Ok(stored)
    }

    async fn begin_instance(
        &self,
        approval_request_id: Uuid,
        executions: &[ParallelExecution],
        graph: Option<&WorkflowGraph>,
    ) -> Result<()> {
        self.ensure_initialized().await?;

        let instance = approval_request_id.to_string();
        let mut tx = self.pool.begin().await?;

        let started = sqlx::query(
            "SELECT 1 FROM workflow_instance_snapshots WHERE approval_request_id = ? UNION ALL SELECT 1 FROM parallel_workflow_executions WHERE approval_request_id = ? LIMIT 1",
        )
        .bind(&instance)
        .bind(&instance)
        .fetch_optional(&mut *tx)
        .await?;
        if started.is_some() {
            return Err(Error::Conflict(format!(
                "instance '{approval_request_id}' has already started"
            )));
        }

        for execution in executions {
            if execution.approval_request_id != approval_request_id {
                return Err(Error::Validation(format!(
                    "parallel execution '{}' belongs to another instance",
                    execution.id
                )));
            }
            Self::insert_execution_row(&mut tx, execution).await?;
        }

        if let Some(graph) = graph {
            sqlx::query(
                "INSERT INTO workflow_instance_snapshots(approval_request_id, workflow_id, graph_json, created_at) VALUES(?, ?, ?, ?)",
            )
            .bind(&instance)
            .bind(graph.workflow.id.to_string())
            .bind(serde_json::to_string(graph)?)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                Self::insert_error(err, &format!("snapshot for instance '{approval_request_id}'"))
            })?;
        }
        tx.commit().await?;

        Ok(())
    }
}
