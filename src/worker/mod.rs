/// Execution worker
///
/// Consumes workflow jobs from MAIN. Per message: resolve the graph, load or
/// create the execution and the user's profile, skip duplicates of runs that
/// already finished or paused, run (or resume) the workflow, persist the
/// outcome and acknowledge. Every error is routed to the `ErrorHandler`, so
/// each delivery ends acked, retried or dead-lettered.

pub mod breaker;
pub mod error_handler;

use crate::broker::{ConsumerHandle, Delivery, MessageBroker, MessageHandler, QueueMessage};
use crate::config::Config;
use crate::error::{DefinitionError, JobError};
use crate::runtime::{ResumePoint, RunRequest, WorkflowExecutor};
use crate::store::Store;
use crate::workflow::{ExecutionStatus, WorkflowSource};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use breaker::{BreakerState, CircuitBreaker};
pub use error_handler::{Backoff, Disposition, ErrorHandler};

/// Result of processing one job
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The workflow ran; a FAILED run is still a processed job
    Finished {
        status: ExecutionStatus,
        error: Option<String>,
    },
    /// Duplicate delivery for a run that already finished or paused
    Skipped { status: ExecutionStatus },
}

/// How a delivery was settled
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Acked(ProcessOutcome),
    Failed(Disposition),
}

pub struct ExecutionWorker {
    broker: MessageBroker,
    store: Arc<dyn Store>,
    workflows: Arc<dyn WorkflowSource>,
    executor: Arc<WorkflowExecutor>,
    errors: ErrorHandler,
    breaker: CircuitBreaker,
    ready_timeout: Duration,
}

impl ExecutionWorker {
    pub fn new(
        config: &Config,
        broker: MessageBroker,
        store: Arc<dyn Store>,
        workflows: Arc<dyn WorkflowSource>,
        executor: Arc<WorkflowExecutor>,
    ) -> Self {
        Self {
            errors: ErrorHandler::new(broker.clone(), store.clone(), &config.worker),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            ready_timeout: Duration::from_millis(config.broker.ready_timeout_ms),
            broker,
            store,
            workflows,
            executor,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Wait for the broker, declare the queues and start consuming
    pub async fn start(self: Arc<Self>) -> Result<ConsumerHandle> {
        self.broker.wait_ready(self.ready_timeout).await?;
        self.broker.assert_topology().await?;
        tracing::info!("🏭 Execution worker starting");
        self.broker.consume(self.clone()).await
    }

    /// Process and settle one delivery
    pub async fn handle_delivery(&self, delivery: Delivery) -> Settlement {
        if delivery.redelivered() {
            tracing::warn!(
                "🔁 Execution {} redelivered after an unsettled lease",
                delivery.message().execution_id
            );
        }
        match self.process(delivery.message()).await {
            Ok(outcome) => {
                self.breaker.record_success();
                if let Err(e) = delivery.ack().await {
                    tracing::error!(
                        "❌ Could not ack execution {}: {}",
                        delivery.message().execution_id,
                        e
                    );
                }
                Settlement::Acked(outcome)
            }
            Err(err) => {
                self.breaker.record_failure();
                Settlement::Failed(self.errors.handle_failure(&delivery, &err).await)
            }
        }
    }

    pub async fn process(&self, message: &QueueMessage) -> Result<ProcessOutcome, JobError> {
        let started = std::time::Instant::now();
        tracing::info!(
            "📨 Processing execution {} (workflow {}, attempt {})",
            message.execution_id,
            message.workflow_id,
            message.retry_count
        );

        let graph = self
            .workflows
            .get_workflow(&message.workflow_id)
            .await
            .map_err(classify)?;

        let mut execution = self
            .store
            .get_or_create_execution(&message.execution_id, &message.workflow_id, &message.user_id)
            .await?;
        self.store.get_or_create_user_profile(&message.user_id).await?;

        let resume_from = message.resume_from_node_id.clone();
        let duplicate = match execution.status {
            ExecutionStatus::Completed => true,
            ExecutionStatus::Paused | ExecutionStatus::Failed => resume_from.is_none(),
            ExecutionStatus::Pending | ExecutionStatus::Running => false,
        };
        if duplicate {
            tracing::info!(
                "⏭️ Execution {} is already {}; skipping delivery",
                execution.id,
                execution.status.as_str()
            );
            return Ok(ProcessOutcome::Skipped {
                status: execution.status,
            });
        }

        if !execution.transition(ExecutionStatus::Running, resume_from.is_some()) {
            return Err(JobError::Permanent(anyhow::anyhow!(
                "execution {} cannot move from {} to running",
                execution.id,
                execution.status.as_str()
            )));
        }
        execution.resume_from_node_id = resume_from.clone();
        self.store.update_execution(&execution).await?;

        let request = RunRequest {
            execution_id: message.execution_id.clone(),
            workflow_id: message.workflow_id.clone(),
            user_id: message.user_id.clone(),
            payload: message.payload.clone(),
        };
        let report = match resume_from {
            Some(from_node_id) => {
                let resume = ResumePoint {
                    from_node_id,
                    outputs: execution.outputs.clone(),
                };
                self.executor.resume_workflow(&graph, request, resume).await
            }
            None => self.executor.execute_workflow(&graph, request).await,
        };

        execution.transition(report.status, false);
        execution.outputs = report.outputs;
        execution.error = report.error.clone();
        execution.resume_from_node_id = report.paused_at;
        self.store.update_execution(&execution).await?;

        if let Err(e) = self.store.record_execution_usage(&message.user_id).await {
            tracing::warn!("⚠️ Usage for {} not recorded: {}", message.user_id, e);
        }

        tracing::info!(
            "🏁 Execution {} finished as {} in {:?}",
            execution.id,
            report.status.as_str(),
            started.elapsed()
        );
        Ok(ProcessOutcome::Finished {
            status: report.status,
            error: report.error,
        })
    }
}

#[async_trait]
impl MessageHandler for ExecutionWorker {
    async fn handle(&self, delivery: Delivery) {
        self.handle_delivery(delivery).await;
    }

    fn accepting(&self) -> bool {
        self.breaker.allow_request()
    }
}

/// Definition problems will not fix themselves on retry
fn classify(err: anyhow::Error) -> JobError {
    match err.downcast::<DefinitionError>() {
        Ok(definition) => definition.into(),
        Err(other) => JobError::Transient(other),
    }
}
