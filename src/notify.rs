/// User notifications
///
/// The scheduler sends exactly one notification per run. Delivery is
/// fire-and-forget: a failing notifier never changes the run's outcome.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionPaused,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ExecutionCompleted => "execution_completed",
            NotificationKind::ExecutionFailed => "execution_failed",
            NotificationKind::ExecutionPaused => "execution_paused",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_notification(&self, user_id: &str, kind: NotificationKind, data: Value) -> Result<()>;
}

/// Writes notifications to the log only
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_notification(&self, user_id: &str, kind: NotificationKind, data: Value) -> Result<()> {
        tracing::info!("📣 Notification for {}: {} {}", user_id, kind.as_str(), data);
        Ok(())
    }
}

/// Keeps every notification in memory; can be told to fail
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, NotificationKind, Value)>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that records and then reports a delivery failure
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub async fn sent(&self) -> Vec<(String, NotificationKind, Value)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_notification(&self, user_id: &str, kind: NotificationKind, data: Value) -> Result<()> {
        self.sent.lock().await.push((user_id.to_string(), kind, data));
        if self.fail {
            return Err(anyhow::anyhow!("notification channel unavailable"));
        }
        Ok(())
    }
}
