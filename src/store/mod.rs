/// Persistence layer
///
/// The engine talks to persistence through the `Store` trait so the worker can
/// run against SQLite in production and an in-memory store in tests.

pub mod memory;
pub mod sqlite;

use crate::workflow::types::{Execution, NodeExecutionRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Per-user quota/profile record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub executions_used: i64,
    pub created_at: DateTime<Utc>,
}

/// Severity of a persisted log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Execution-level log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub execution_id: String,
    pub node_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(execution_id: &str, level: LogLevel, message: impl Into<String>, data: Value) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            node_id: None,
            level,
            message: message.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Persistence service consumed by the worker and the scheduler
#[async_trait]
pub trait Store: Send + Sync {
    /// Raw stored definition; shape resolution happens in `workflow::definition`
    async fn get_workflow_definition(&self, workflow_id: &str) -> Result<Option<Value>>;

    async fn save_workflow(&self, workflow_id: &str, name: &str, definition: &Value) -> Result<()>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>>;

    /// Idempotent: concurrent callers for the same id all get the one record
    async fn get_or_create_execution(
        &self,
        execution_id: &str,
        workflow_id: &str,
        user_id: &str,
    ) -> Result<Execution>;

    async fn update_execution(&self, execution: &Execution) -> Result<()>;

    async fn upsert_node_execution(&self, record: &NodeExecutionRecord) -> Result<()>;

    async fn list_node_executions(&self, execution_id: &str) -> Result<Vec<NodeExecutionRecord>>;

    /// Idempotent and race-tolerant like `get_or_create_execution`
    async fn get_or_create_user_profile(&self, user_id: &str) -> Result<UserProfile>;

    async fn record_execution_usage(&self, user_id: &str) -> Result<()>;

    async fn append_log(&self, entry: &LogEntry) -> Result<()>;
}
