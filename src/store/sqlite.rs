/// SQLite persistence for workflows, executions, profiles and logs
///
/// Workflow definitions are stored as JSON, like the execution outputs.
/// Get-or-create operations insert with `ON CONFLICT DO NOTHING` and read
/// back, so concurrent workers racing on the same id converge on one row.

use super::{LogEntry, Store, UserProfile};
use crate::workflow::types::{Execution, ExecutionStatus, NodeExecutionRecord, NodeStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

/// Open a SQLite pool, creating the database file (and its directory) if needed.
///
/// In-memory URLs get a single long-lived connection: every connection to
/// `sqlite::memory:` would otherwise see its own empty database.
pub async fn connect_pool(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let in_memory = url.contains(":memory:");

    if !in_memory {
        let path = url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        let path = path.split('?').next().unwrap_or(path);
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
                })?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections)
    };

    Ok(pool_options.connect_with(options).await?)
}

/// SQLite-backed `Store`
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and make sure the schema exists
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("🗄️ Opening persistence database: {}", url);
        let pool = connect_pool(url, 8).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes. Safe to call repeatedly.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                resume_from_node_id TEXT,
                outputs TEXT NOT NULL DEFAULT '{}',
                error TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS node_executions (
                execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                output TEXT,
                error TEXT,
                PRIMARY KEY (execution_id, node_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_profiles (
                user_id TEXT PRIMARY KEY,
                executions_used INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                node_id TEXT,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_logs_execution ON execution_logs(execution_id)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow::anyhow!("Invalid timestamp '{}': {}", raw, e))?
        .with_timezone(&Utc))
}

fn parse_opt_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

fn execution_from_row(row: &SqliteRow) -> Result<Execution> {
    let status: String = row.try_get("status")?;
    let outputs: String = row.try_get("outputs")?;
    Ok(Execution {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        user_id: row.try_get("user_id")?,
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown execution status '{}'", status))?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        started_at: parse_opt_time(row.try_get("started_at")?)?,
        finished_at: parse_opt_time(row.try_get("finished_at")?)?,
        resume_from_node_id: row.try_get("resume_from_node_id")?,
        outputs: serde_json::from_str(&outputs)?,
        error: row.try_get("error")?,
    })
}

fn node_record_from_row(row: &SqliteRow) -> Result<NodeExecutionRecord> {
    let status: String = row.try_get("status")?;
    let output: Option<String> = row.try_get("output")?;
    Ok(NodeExecutionRecord {
        node_id: row.try_get("node_id")?,
        execution_id: row.try_get("execution_id")?,
        status: NodeStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown node status '{}'", status))?,
        started_at: parse_time(&row.try_get::<String, _>("started_at")?)?,
        finished_at: parse_opt_time(row.try_get("finished_at")?)?,
        output: output.map(|raw| serde_json::from_str(&raw)).transpose()?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_workflow_definition(&self, workflow_id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.try_get("definition")?;
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    async fn save_workflow(&self, workflow_id: &str, name: &str, definition: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(workflow_id)
        .bind(name)
        .bind(definition.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn get_or_create_execution(
        &self,
        execution_id: &str,
        workflow_id: &str,
        user_id: &str,
    ) -> Result<Execution> {
        let fresh = Execution::new(execution_id, workflow_id, user_id);
        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, user_id, status, created_at, outputs)
            VALUES (?, ?, ?, ?, ?, '{}')
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&fresh.id)
        .bind(&fresh.workflow_id)
        .bind(&fresh.user_id)
        .bind(fresh.status.as_str())
        .bind(fresh.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_execution(execution_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Execution {} vanished after insert", execution_id))
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE executions SET
                status = ?,
                started_at = ?,
                finished_at = ?,
                resume_from_node_id = ?,
                outputs = ?,
                error = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(execution.started_at.map(|t| t.to_rfc3339()))
        .bind(execution.finished_at.map(|t| t.to_rfc3339()))
        .bind(&execution.resume_from_node_id)
        .bind(serde_json::to_string(&execution.outputs)?)
        .bind(&execution.error)
        .bind(&execution.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_node_execution(&self, record: &NodeExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_executions
                (execution_id, node_id, status, started_at, finished_at, output, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(execution_id, node_id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                output = excluded.output,
                error = excluded.error
            "#,
        )
        .bind(&record.execution_id)
        .bind(&record.node_id)
        .bind(record.status.as_str())
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.map(|t| t.to_rfc3339()))
        .bind(record.output.as_ref().map(Value::to_string))
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_node_executions(&self, execution_id: &str) -> Result<Vec<NodeExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM node_executions WHERE execution_id = ? ORDER BY started_at ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_record_from_row).collect()
    }

    async fn get_or_create_user_profile(&self, user_id: &str) -> Result<UserProfile> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (user_id, executions_used, created_at)
            VALUES (?, 0, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM user_profiles WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(UserProfile {
            user_id: row.try_get("user_id")?,
            executions_used: row.try_get("executions_used")?,
            created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        })
    }

    async fn record_execution_usage(&self, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE user_profiles SET executions_used = executions_used + 1 WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs (execution_id, node_id, level, message, data, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.execution_id)
        .bind(&entry.node_id)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(entry.data.to_string())
        .bind(entry.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
