/// Message broker
///
/// Durable MAIN / RETRY / DLQ queues on SQLite. Jobs are `QueueMessage`s;
/// consumers get a `Delivery` per message and must settle it with exactly one
/// of `ack`, `nack` or `reject`.

pub mod sqlite;
pub mod stats;
pub mod topology;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use sqlite::{ConsumerHandle, MessageBroker};
pub use stats::{
    estimate_throughput, scaling_recommendations, BrokerHealth, QueueDepths, QueueStats,
    Recommendation, RecommendationKind, RecommendationPriority, Throughput,
};
pub use topology::{QueueArguments, QueueKind, QueueSpec, Topology};

pub const PRIORITY_DEFAULT: u8 = 1;
pub const PRIORITY_RETRY: u8 = 5;
pub const PRIORITY_MAX: u8 = 10;

/// A workflow job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Explicit priority, wins over the retry default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Resume the execution at this node instead of starting over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_node_id: Option<String>,
}

impl QueueMessage {
    pub fn new(execution_id: &str, workflow_id: &str, user_id: &str, payload: Value) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            payload,
            retry_count: 0,
            timestamp: Utc::now(),
            priority: None,
            resume_from_node_id: None,
        }
    }

    /// A message that resumes `execution_id` at `node_id`
    pub fn resume(mut self, node_id: &str) -> Self {
        self.resume_from_node_id = Some(node_id.to_string());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Deterministic per attempt: the same job at the same retry count always
    /// carries the same id.
    pub fn message_id(&self) -> String {
        format!("{}-{}", self.execution_id, self.retry_count)
    }

    /// explicit > retry > default
    pub fn effective_priority(&self) -> u8 {
        match self.priority {
            Some(priority) => priority.clamp(PRIORITY_DEFAULT, PRIORITY_MAX),
            None if self.retry_count > 0 => PRIORITY_RETRY,
            None => PRIORITY_DEFAULT,
        }
    }

    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    pub fn to_body(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One leased message. Dropping it unsettled lets the consumer loop requeue it.
#[derive(Debug)]
pub struct Delivery {
    message: QueueMessage,
    delivery_tag: String,
    redelivered: bool,
    broker: MessageBroker,
    settled: Arc<AtomicBool>,
}

impl Delivery {
    pub(crate) fn new(
        message: QueueMessage,
        delivery_tag: String,
        redelivered: bool,
        broker: MessageBroker,
    ) -> Self {
        Self {
            message,
            delivery_tag,
            redelivered,
            broker,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    pub fn delivery_tag(&self) -> &str {
        &self.delivery_tag
    }

    /// True when an earlier lease of this message was released unsettled
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub(crate) fn settled_flag(&self) -> Arc<AtomicBool> {
        self.settled.clone()
    }

    pub async fn ack(&self) -> Result<()> {
        self.settled.store(true, Ordering::SeqCst);
        self.broker.ack(&self.delivery_tag).await
    }

    /// `requeue = false` dead-letters the message
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.settled.store(true, Ordering::SeqCst);
        if requeue {
            self.broker.requeue(&self.delivery_tag).await
        } else {
            self.broker.dead_letter(&self.delivery_tag, "rejected").await
        }
    }

    pub async fn reject(&self) -> Result<()> {
        self.nack(false).await
    }

    /// Dead-letter with a reason kept next to the original body
    pub async fn reject_with_reason(&self, reason: &str) -> Result<()> {
        self.settled.store(true, Ordering::SeqCst);
        self.broker.dead_letter(&self.delivery_tag, reason).await
    }
}

/// Consumer callback
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery);

    /// While false, the consumer leaves new messages in the queue
    fn accepting(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_prefers_explicit_then_retry() {
        let mut message = QueueMessage::new("e1", "wf", "u", json!({}));
        assert_eq!(message.effective_priority(), 1);
        message.retry_count = 2;
        assert_eq!(message.effective_priority(), 5);
        assert_eq!(message.clone().with_priority(10).effective_priority(), 10);
        assert_eq!(message.with_priority(42).effective_priority(), 10);
    }

    #[test]
    fn message_id_is_deterministic_per_attempt() {
        let mut message = QueueMessage::new("exec-7", "wf", "u", json!({}));
        assert_eq!(message.message_id(), "exec-7-0");
        message.retry_count += 1;
        assert_eq!(message.message_id(), "exec-7-1");
    }

    #[test]
    fn wire_format_is_camel_case() {
        let body = r#"{"executionId":"e","workflowId":"w","userId":"u","retryCount":2,"timestamp":"2024-01-01T00:00:00Z"}"#;
        let message = QueueMessage::parse(body).unwrap();
        assert_eq!(message.retry_count, 2);
        assert_eq!(message.payload, Value::Null);
        assert!(message.resume_from_node_id.is_none());

        let encoded: Value = serde_json::from_str(&message.clone().resume("n2").to_body().unwrap()).unwrap();
        assert_eq!(encoded["resumeFromNodeId"], json!("n2"));
        assert_eq!(encoded["executionId"], json!("e"));
        assert!(encoded.get("priority").is_none());
    }

    #[test]
    fn malformed_bodies_fail_to_parse() {
        assert!(QueueMessage::parse("not json").is_err());
        assert!(QueueMessage::parse(r#"{"executionId":"e"}"#).is_err());
    }
}
