/// End-to-end runs through the consumer loop: publish, execute, settle.

use flowrelay::broker::{MessageBroker, QueueMessage};
use flowrelay::config::{BrokerConfig, Config};
use flowrelay::notify::RecordingNotifier;
use flowrelay::runtime::{HandlerRegistry, NodeExecutor, WorkflowExecutor};
use flowrelay::store::{MemoryStore, Store};
use flowrelay::worker::ExecutionWorker;
use flowrelay::workflow::{ExecutionStatus, WorkflowRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    broker: MessageBroker,
    store: Arc<MemoryStore>,
    worker: Arc<ExecutionWorker>,
}

async fn harness() -> Harness {
    let mut config = Config::default();
    config.broker = BrokerConfig {
        url: "sqlite::memory:".into(),
        poll_interval_ms: 10,
        ready_timeout_ms: 1_000,
        ..config.broker
    };

    let broker = MessageBroker::connect(config.broker.clone()).await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(WorkflowExecutor::new(
        Arc::new(NodeExecutor::new(
            Arc::new(HandlerRegistry::with_builtins()),
            config.execution.node_timeout(),
        )),
        store.clone(),
        Arc::new(RecordingNotifier::new()),
        config.execution.run_timeout(),
    ));
    let workflows = Arc::new(WorkflowRegistry::new(store.clone()));
    let worker = Arc::new(ExecutionWorker::new(
        &config,
        broker.clone(),
        store.clone(),
        workflows,
        executor,
    ));
    Harness { broker, store, worker }
}

async fn wait_for_status(store: &MemoryStore, execution_id: &str, status: ExecutionStatus) {
    for _ in 0..300 {
        if let Some(execution) = store.get_execution(execution_id).await.unwrap() {
            if execution.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {execution_id} never reached {status:?}");
}

#[tokio::test]
async fn published_message_runs_to_completion() {
    let h = harness().await;
    h.store
        .save_workflow(
            "wf-sum",
            "sum",
            &json!({
                "nodes": [
                    {"id": "hook", "type": "webhook", "role": "trigger"},
                    {"id": "add", "type": "script", "config": {"script": "return { total = payload.a + payload.b }"}},
                    {"id": "out", "type": "output", "role": "terminal"}
                ],
                "edges": [
                    {"source": "hook", "target": "add"},
                    {"source": "add", "target": "out"}
                ]
            }),
        )
        .await
        .unwrap();

    let consumer = h.worker.clone().start().await.unwrap();
    assert!(h
        .broker
        .publish(&QueueMessage::new("exec-sum", "wf-sum", "erin", json!({"a": 2, "b": 3})))
        .await);

    wait_for_status(&h.store, "exec-sum", ExecutionStatus::Completed).await;
    let execution = h.store.get_execution("exec-sum").await.unwrap().unwrap();
    assert_eq!(execution.outputs["out"], json!({"add": {"total": 5}}));

    consumer.shutdown().await.unwrap();
    let stats = h.broker.queue_stats().await.unwrap();
    assert!(stats.iter().all(|q| q.messages == 0 && q.in_flight == 0));
}

#[tokio::test]
async fn approval_pauses_then_resumes_through_the_queue() {
    let h = harness().await;
    h.store
        .save_workflow(
            "wf-review",
            "review",
            &json!({
                "nodes": [
                    {"id": "hook", "type": "manual", "role": "trigger"},
                    {"id": "review", "type": "approval", "config": {"message": "sign off"}},
                    {"id": "out", "type": "output", "role": "terminal"}
                ],
                "edges": [
                    {"source": "hook", "target": "review"},
                    {"source": "review", "target": "out"}
                ]
            }),
        )
        .await
        .unwrap();

    let consumer = h.worker.clone().start().await.unwrap();
    let message = QueueMessage::new("exec-review", "wf-review", "frank", json!({"doc": 7}));
    assert!(h.broker.publish(&message).await);
    wait_for_status(&h.store, "exec-review", ExecutionStatus::Paused).await;

    let paused = h.store.get_execution("exec-review").await.unwrap().unwrap();
    assert_eq!(paused.resume_from_node_id.as_deref(), Some("review"));

    assert!(h.broker.publish(&message.clone().resume("review")).await);
    wait_for_status(&h.store, "exec-review", ExecutionStatus::Completed).await;

    let execution = h.store.get_execution("exec-review").await.unwrap().unwrap();
    assert_eq!(execution.outputs["review"]["approved"], json!(true));

    consumer.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_workflow_lands_in_the_dead_letter_queue() {
    let h = harness().await;
    let consumer = h.worker.clone().start().await.unwrap();

    assert!(h
        .broker
        .publish(&QueueMessage::new("exec-ghost", "nowhere", "gina", json!({})))
        .await);
    wait_for_status(&h.store, "exec-ghost", ExecutionStatus::Failed).await;

    consumer.shutdown().await.unwrap();
    let dead = h.broker.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message_id, "exec-ghost-0");
}
