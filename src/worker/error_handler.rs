/// Failed-job routing
///
/// The only place that decides between retry and dead-letter:
/// - permanent errors are dead-lettered at once
/// - transient errors are retried through the RETRY queue with exponential
///   backoff until `max_retries`, then dead-lettered
///
/// Execution bookkeeping (status FAILED plus the error) is attempted before
/// the message is settled, and a bookkeeping failure never prevents settling.

use crate::broker::{Delivery, MessageBroker, QueueMessage};
use crate::config::WorkerConfig;
use crate::error::JobError;
use crate::store::Store;
use crate::workflow::types::ExecutionStatus;
use std::sync::Arc;

/// Exponential backoff: `base * 2^retry_count`, capped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let factor = 2u64.saturating_pow(retry_count);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }
}

/// What happened to a failed message
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Republished to RETRY as attempt `retry_count`
    Retried { retry_count: u32, delay_ms: u64 },
    /// Moved to the DLQ
    DeadLettered { reason: String },
    /// Could not schedule a retry; handed back to MAIN
    Requeued,
}

pub struct ErrorHandler {
    broker: MessageBroker,
    store: Arc<dyn Store>,
    max_retries: u32,
    backoff: Backoff,
}

impl ErrorHandler {
    pub fn new(broker: MessageBroker, store: Arc<dyn Store>, config: &WorkerConfig) -> Self {
        Self {
            broker,
            store,
            max_retries: config.max_retries,
            backoff: Backoff {
                base_ms: config.base_backoff_ms,
                max_ms: config.max_backoff_ms,
            },
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn handle_failure(&self, delivery: &Delivery, error: &JobError) -> Disposition {
        let message = delivery.message();
        tracing::error!(
            "❌ Job {} (attempt {}) failed: {}",
            message.execution_id,
            message.retry_count,
            error
        );

        if error.is_permanent() {
            let reason = error.to_string();
            self.mark_failed(message, &reason).await;
            return self.dead_letter(delivery, reason).await;
        }

        if message.retry_count < self.max_retries {
            let delay_ms = self.backoff.delay_ms(message.retry_count);
            if self.broker.publish_retry(message, delay_ms).await {
                if let Err(e) = delivery.ack().await {
                    tracing::error!("❌ Could not ack {} after scheduling retry: {}", message.execution_id, e);
                }
                return Disposition::Retried {
                    retry_count: message.retry_count + 1,
                    delay_ms,
                };
            }
            tracing::warn!("↩️ Retry publish failed for {}; requeueing", message.execution_id);
            if let Err(e) = delivery.nack(true).await {
                tracing::error!("❌ Could not requeue {}: {}", message.execution_id, e);
            }
            return Disposition::Requeued;
        }

        let reason = format!("retries exhausted after {} attempt(s): {}", message.retry_count, error);
        self.mark_failed(message, &reason).await;
        self.dead_letter(delivery, reason).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: String) -> Disposition {
        if let Err(e) = delivery.reject_with_reason(&reason).await {
            tracing::error!(
                "❌ Could not dead-letter {}: {}",
                delivery.message().execution_id,
                e
            );
        }
        Disposition::DeadLettered { reason }
    }

    /// Best-effort: persist FAILED and the error. Never fails.
    async fn mark_failed(&self, message: &QueueMessage, reason: &str) {
        let result = async {
            let mut execution = self
                .store
                .get_or_create_execution(&message.execution_id, &message.workflow_id, &message.user_id)
                .await?;
            if execution.transition(ExecutionStatus::Failed, false) {
                execution.error = Some(reason.to_string());
                self.store.update_execution(&execution).await?;
            }
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                "⚠️ Could not record failure of execution {}: {}",
                message.execution_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            base_ms: 1_000,
            max_ms: 60_000,
        };
        assert_eq!(backoff.delay_ms(0), 1_000);
        assert_eq!(backoff.delay_ms(1), 2_000);
        assert_eq!(backoff.delay_ms(2), 4_000);
        assert_eq!(backoff.delay_ms(10), 60_000);
        assert_eq!(backoff.delay_ms(200), 60_000);
    }

    async fn setup() -> (MessageBroker, Arc<MemoryStore>, ErrorHandler) {
        let broker = MessageBroker::connect(BrokerConfig {
            url: "sqlite::memory:".into(),
            ..BrokerConfig::default()
        })
        .await
        .unwrap();
        broker.assert_topology().await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let handler = ErrorHandler::new(broker.clone(), store.clone(), &WorkerConfig::default());
        (broker, store, handler)
    }

    async fn deliver(broker: &MessageBroker, retry_count: u32) -> Delivery {
        let mut message = QueueMessage::new("exec-1", "wf", "user", json!({}));
        message.retry_count = retry_count;
        assert!(broker.publish(&message).await);
        broker.next_delivery().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn last_allowed_retry_goes_to_retry_queue() {
        let (broker, store, handler) = setup().await;
        let delivery = deliver(&broker, handler.max_retries() - 1).await;

        let disposition = handler
            .handle_failure(&delivery, &JobError::Transient(anyhow::anyhow!("db timeout")))
            .await;
        assert_eq!(
            disposition,
            Disposition::Retried {
                retry_count: 3,
                delay_ms: 4_000
            }
        );

        let stats = broker.queue_stats().await.unwrap();
        assert_eq!((stats[0].messages, stats[0].in_flight), (0, 0));
        assert_eq!(stats[1].messages, 1);
        assert!(store.get_execution("exec-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exhausted_retries_are_dead_lettered_and_failed() {
        let (broker, store, handler) = setup().await;
        let delivery = deliver(&broker, handler.max_retries()).await;

        let disposition = handler
            .handle_failure(&delivery, &JobError::Transient(anyhow::anyhow!("db timeout")))
            .await;
        assert!(matches!(disposition, Disposition::DeadLettered { .. }));

        let stats = broker.queue_stats().await.unwrap();
        assert_eq!(stats[1].messages, 0);
        assert_eq!(stats[2].messages, 1);

        let execution = store.get_execution("exec-1").await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("retries exhausted"));
    }

    #[tokio::test]
    async fn permanent_errors_skip_retries() {
        let (broker, _store, handler) = setup().await;
        let delivery = deliver(&broker, 0).await;
        let disposition = handler
            .handle_failure(&delivery, &JobError::Permanent(anyhow::anyhow!("no such workflow")))
            .await;
        assert!(matches!(disposition, Disposition::DeadLettered { .. }));
        assert_eq!(broker.dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bookkeeping_failure_does_not_block_settlement() {
        let (broker, store, handler) = setup().await;
        store.set_fail_writes(true);
        let delivery = deliver(&broker, 0).await;
        let disposition = handler
            .handle_failure(&delivery, &JobError::Permanent(anyhow::anyhow!("bad definition")))
            .await;
        assert!(matches!(disposition, Disposition::DeadLettered { .. }));
        let stats = broker.queue_stats().await.unwrap();
        assert_eq!((stats[0].messages, stats[0].in_flight), (0, 0));
        assert_eq!(stats[2].messages, 1);
    }
}
