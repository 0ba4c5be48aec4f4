/// Workflow executor (scheduler)
///
/// Owns a run's state machine: validates the graph, computes a ready-set
/// schedule (Kahn's algorithm with ties broken by node declaration order),
/// dispatches nodes one at a time, and handles pause, failure cleanup and
/// resume. Every run ends with one execution log entry and one notification.

use crate::error::NodeError;
use crate::notify::{NotificationKind, Notifier};
use crate::runtime::executor::{get_relevant_outputs, NodeExecutor};
use crate::runtime::handler::{NodeOutcome, RunContext};
use crate::store::{LogEntry, LogLevel, Store};
use crate::workflow::graph::{build_dependency_map, validate, GraphIndex};
use crate::workflow::types::{
    ExecutionStatus, Node, NodeExecutionRecord, NodeStatus, WorkflowGraph,
};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;

/// Identity and input of a run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub execution_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub payload: Value,
}

/// Where and with what state a halted run picks up again
#[derive(Debug, Clone, Default)]
pub struct ResumePoint {
    pub from_node_id: String,
    /// Outputs captured for upstream nodes before the run halted
    pub outputs: HashMap<String, Value>,
}

/// Final state of a run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub outputs: HashMap<String, Value>,
    pub error: Option<String>,
    /// Nodes dispatched during this run, in dispatch order
    pub dispatched: Vec<String>,
    /// Node that suspended the run
    pub paused_at: Option<String>,
    pub pause_reason: Option<String>,
    pub duration: Duration,
}

impl RunReport {
    fn new(execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Running,
            outputs: HashMap::new(),
            error: None,
            dispatched: Vec::new(),
            paused_at: None,
            pause_reason: None,
            duration: Duration::ZERO,
        }
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.into());
    }
}

pub struct WorkflowExecutor {
    executor: Arc<NodeExecutor>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    run_timeout: Duration,
}

impl WorkflowExecutor {
    pub fn new(
        executor: Arc<NodeExecutor>,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            notifier,
            run_timeout,
        }
    }

    /// Run a workflow from its roots
    pub async fn execute_workflow(&self, graph: &WorkflowGraph, request: RunRequest) -> RunReport {
        self.run(graph, request, None).await
    }

    /// Resume a paused or failed run at `resume.from_node_id`.
    ///
    /// The resume node, its descendants and every node without a captured
    /// output are dispatched; nodes with captured outputs are not re-run.
    pub async fn resume_workflow(
        &self,
        graph: &WorkflowGraph,
        request: RunRequest,
        resume: ResumePoint,
    ) -> RunReport {
        self.run(graph, request, Some(resume)).await
    }

    async fn run(&self, graph: &WorkflowGraph, request: RunRequest, resume: Option<ResumePoint>) -> RunReport {
        let started = std::time::Instant::now();
        tracing::info!(
            "🚀 Starting workflow execution {} (workflow {}, {} nodes, {} edges{})",
            request.execution_id,
            request.workflow_id,
            graph.nodes.len(),
            graph.edges.len(),
            resume
                .as_ref()
                .map(|point| format!(", resuming at {}", point.from_node_id))
                .unwrap_or_default()
        );

        let mut report = RunReport::new(&request.execution_id);
        self.schedule(graph, &request, resume, &mut report).await;
        report.duration = started.elapsed();

        match report.status {
            ExecutionStatus::Completed => tracing::info!(
                "🎉 Workflow execution {} completed in {:?}",
                request.execution_id,
                report.duration
            ),
            ExecutionStatus::Paused => tracing::info!(
                "⏸️ Workflow execution {} paused at {:?} after {:?}",
                request.execution_id,
                report.paused_at,
                report.duration
            ),
            _ => tracing::error!(
                "❌ Workflow execution {} failed after {:?}: {}",
                request.execution_id,
                report.duration,
                report.error.as_deref().unwrap_or("unknown error")
            ),
        }

        self.finish(&request, &report).await;
        report
    }

    async fn schedule(
        &self,
        graph: &WorkflowGraph,
        request: &RunRequest,
        resume: Option<ResumePoint>,
        report: &mut RunReport,
    ) {
        if let Err(err) = validate(graph) {
            tracing::error!("❌ Workflow {} rejected: {}", request.workflow_id, err);
            report.fail(err.to_string());
            return;
        }

        let deps = build_dependency_map(graph);
        let mut run = RunContext::new(
            &request.execution_id,
            &request.workflow_id,
            &request.user_id,
            request.payload.clone(),
        );

        let run_set: HashSet<String> = match resume {
            Some(point) => {
                if graph.node(&point.from_node_id).is_none() {
                    report.fail(format!("resume node not found: {}", point.from_node_id));
                    return;
                }
                // The resume node and everything below it run again; any other
                // node without a captured output (a sibling branch that never
                // ran) runs too. Only captured outputs count as satisfied.
                let mut run_set = GraphIndex::new(graph).descendants_inclusive(&point.from_node_id);
                run_set.extend(
                    graph
                        .nodes
                        .iter()
                        .filter(|node| !point.outputs.contains_key(&node.id))
                        .map(|node| node.id.clone()),
                );
                run.resume_from_node_id = Some(point.from_node_id);
                report.outputs = point.outputs;
                run_set
            }
            None => graph.nodes.iter().map(|node| node.id.clone()).collect(),
        };

        // Kahn's algorithm restricted to the run set. Dependencies outside it
        // (ancestors of a resume node) count as satisfied.
        let mut pending: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, node) in graph.nodes.iter().enumerate() {
            if !run_set.contains(&node.id) {
                continue;
            }
            let mut count = 0;
            for dep in deps.dependencies(&node.id) {
                if run_set.contains(dep) {
                    count += 1;
                    dependents.entry(dep.as_str()).or_default().push(idx);
                }
            }
            pending.insert(node.id.as_str(), count);
        }

        let mut ready: BTreeSet<usize> = graph
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| pending.get(node.id.as_str()) == Some(&0))
            .map(|(idx, _)| idx)
            .collect();

        let deadline = Instant::now() + self.run_timeout;
        let mut active: HashMap<String, NodeExecutionRecord> = HashMap::new();

        while let Some(idx) = ready.pop_first() {
            let node = &graph.nodes[idx];

            if Instant::now() >= deadline {
                let reason = format!("workflow run exceeded its {:?} timeout", self.run_timeout);
                run.cancellation.cancel();
                report.fail(reason.clone());
                self.cleanup_active_nodes(&mut active, &reason).await;
                return;
            }

            tracing::info!(
                "📍 Step {}/{}: dispatching node '{}' (type: {})",
                report.dispatched.len() + 1,
                run_set.len(),
                node.id,
                node.block_type
            );

            let record = NodeExecutionRecord::started(&request.execution_id, &node.id);
            self.persist_node(&record).await;
            active.insert(node.id.clone(), record);

            let relevant = get_relevant_outputs(&node.id, &deps, &report.outputs);
            let result = self
                .dispatch(node, &run, relevant, deps.dependencies(&node.id), deadline)
                .await;

            match result {
                Ok(NodeOutcome::Completed(output)) => {
                    if let Some(record) = active.remove(&node.id) {
                        let done = record.complete(NodeStatus::Completed, Some(output.clone()), None);
                        self.persist_node(&done).await;
                    }
                    report.outputs.insert(node.id.clone(), output);
                    report.dispatched.push(node.id.clone());

                    if let Some(children) = dependents.get(node.id.as_str()) {
                        for &child in children {
                            if let Some(count) = pending.get_mut(graph.nodes[child].id.as_str()) {
                                *count -= 1;
                                if *count == 0 {
                                    ready.insert(child);
                                }
                            }
                        }
                    }
                }
                Ok(NodeOutcome::Paused { reason }) => {
                    // Remaining nodes stay undispatched; nothing is marked failed.
                    if let Some(record) = active.remove(&node.id) {
                        let paused = record.complete(NodeStatus::Paused, None, Some(reason.clone()));
                        self.persist_node(&paused).await;
                    }
                    report.dispatched.push(node.id.clone());
                    report.status = ExecutionStatus::Paused;
                    report.paused_at = Some(node.id.clone());
                    report.pause_reason = Some(reason);
                    return;
                }
                Err(err) => {
                    let reason = err.to_string();
                    report.dispatched.push(node.id.clone());
                    report.fail(reason.clone());
                    self.cleanup_active_nodes(&mut active, &reason).await;
                    return;
                }
            }
        }

        let completed_in_run = report
            .dispatched
            .iter()
            .filter(|id| run_set.contains(*id))
            .count();
        if completed_in_run == run_set.len() {
            report.status = ExecutionStatus::Completed;
        } else {
            report.fail(format!(
                "{} node(s) could not be scheduled",
                run_set.len() - completed_in_run
            ));
        }
    }

    /// Invoke one node, racing it against the run deadline. On expiry the run
    /// token is cancelled and the in-flight handler is awaited until it
    /// notices (or hits its own node timeout).
    async fn dispatch(
        &self,
        node: &Node,
        run: &RunContext,
        relevant: HashMap<String, Value>,
        dependency_order: &[String],
        deadline: Instant,
    ) -> Result<NodeOutcome, NodeError> {
        let execution = self.executor.execute(node, run, relevant, dependency_order);
        tokio::pin!(execution);

        tokio::select! {
            result = &mut execution => result,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::error!(
                    "⏱️ Workflow run {} exceeded {:?} while '{}' was running",
                    run.execution_id,
                    self.run_timeout,
                    node.id
                );
                run.cancellation.cancel();
                let _ = execution.await;
                Err(NodeError::Cancelled {
                    node_id: node.id.clone(),
                    reason: format!("workflow run exceeded its {:?} timeout", self.run_timeout),
                })
            }
        }
    }

    /// Mark every still-active node failed with the triggering reason.
    /// Never fails; a no-op when nothing is active.
    async fn cleanup_active_nodes(&self, active: &mut HashMap<String, NodeExecutionRecord>, reason: &str) {
        if active.is_empty() {
            return;
        }
        tracing::warn!("🧹 Cleaning up {} active node(s): {}", active.len(), reason);
        for (node_id, record) in active.drain() {
            let failed = record.complete(NodeStatus::Failed, None, Some(reason.to_string()));
            if let Err(e) = self.store.upsert_node_execution(&failed).await {
                tracing::warn!("⚠️ Cleanup of node {} could not be persisted: {}", node_id, e);
            }
        }
    }

    async fn persist_node(&self, record: &NodeExecutionRecord) {
        if let Err(e) = self.store.upsert_node_execution(record).await {
            tracing::warn!(
                "⚠️ Failed to persist node record {}/{}: {}",
                record.execution_id,
                record.node_id,
                e
            );
        }
    }

    /// One log entry and one notification per run; failures are swallowed.
    async fn finish(&self, request: &RunRequest, report: &RunReport) {
        let (level, kind) = match report.status {
            ExecutionStatus::Completed => (LogLevel::Info, NotificationKind::ExecutionCompleted),
            ExecutionStatus::Paused => (LogLevel::Warn, NotificationKind::ExecutionPaused),
            _ => (LogLevel::Error, NotificationKind::ExecutionFailed),
        };
        let data = json!({
            "executionId": request.execution_id,
            "workflowId": request.workflow_id,
            "status": report.status.as_str(),
            "error": report.error,
            "pausedAt": report.paused_at,
            "dispatched": report.dispatched,
            "durationMs": report.duration.as_millis() as u64,
        });

        let entry = LogEntry::new(
            &request.execution_id,
            level,
            format!("Workflow execution {}", report.status.as_str()),
            data.clone(),
        );
        if let Err(e) = self.store.append_log(&entry).await {
            tracing::warn!("⚠️ Execution log for {} dropped: {}", request.execution_id, e);
        }

        if let Err(e) = self
            .notifier
            .send_notification(&request.user_id, kind, data)
            .await
        {
            tracing::warn!("⚠️ Notification for {} dropped: {}", request.execution_id, e);
        }
    }
}
