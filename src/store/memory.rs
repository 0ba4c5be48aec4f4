/// In-memory store for tests and single-process development runs

use super::{LogEntry, Store, UserProfile};
use crate::workflow::types::{Execution, NodeExecutionRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<String, Value>>,
    executions: RwLock<HashMap<String, Execution>>,
    node_executions: RwLock<HashMap<(String, String), NodeExecutionRecord>>,
    profiles: RwLock<HashMap<String, UserProfile>>,
    logs: RwLock<Vec<LogEntry>>,
    /// Makes every write fail; used to exercise bookkeeping failure paths
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn logs(&self) -> Vec<LogEntry> {
        self.logs.read().await.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("store is rejecting writes"));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_workflow_definition(&self, workflow_id: &str) -> Result<Option<Value>> {
        Ok(self.workflows.read().await.get(workflow_id).cloned())
    }

    async fn save_workflow(&self, workflow_id: &str, _name: &str, definition: &Value) -> Result<()> {
        self.check_writable()?;
        self.workflows
            .write()
            .await
            .insert(workflow_id.to_string(), definition.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        Ok(self.executions.read().await.get(execution_id).cloned())
    }

    async fn get_or_create_execution(
        &self,
        execution_id: &str,
        workflow_id: &str,
        user_id: &str,
    ) -> Result<Execution> {
        let mut executions = self.executions.write().await;
        let execution = executions
            .entry(execution_id.to_string())
            .or_insert_with(|| Execution::new(execution_id, workflow_id, user_id));
        Ok(execution.clone())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<()> {
        self.check_writable()?;
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn upsert_node_execution(&self, record: &NodeExecutionRecord) -> Result<()> {
        self.check_writable()?;
        self.node_executions.write().await.insert(
            (record.execution_id.clone(), record.node_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn list_node_executions(&self, execution_id: &str) -> Result<Vec<NodeExecutionRecord>> {
        let mut records: Vec<NodeExecutionRecord> = self
            .node_executions
            .read()
            .await
            .values()
            .filter(|record| record.execution_id == execution_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.started_at);
        Ok(records)
    }

    async fn get_or_create_user_profile(&self, user_id: &str) -> Result<UserProfile> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles.entry(user_id.to_string()).or_insert_with(|| UserProfile {
            user_id: user_id.to_string(),
            executions_used: 0,
            created_at: Utc::now(),
        });
        Ok(profile.clone())
    }

    async fn record_execution_usage(&self, user_id: &str) -> Result<()> {
        self.check_writable()?;
        if let Some(profile) = self.profiles.write().await.get_mut(user_id) {
            profile.executions_used += 1;
        }
        Ok(())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.check_writable()?;
        self.logs.write().await.push(entry.clone());
        Ok(())
    }
}
