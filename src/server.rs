/// Worker process setup
///
/// Wires together all components: store, broker, workflow registry, handler
/// registry, workflow executor and the execution worker.

use crate::{
    broker::MessageBroker,
    config::Config,
    notify::LogNotifier,
    runtime::{HandlerRegistry, NodeExecutor, WorkflowExecutor},
    store::{SqliteStore, Store},
    worker::ExecutionWorker,
    workflow::WorkflowRegistry,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Fully wired process components
pub struct App {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub broker: MessageBroker,
    pub workflows: Arc<WorkflowRegistry>,
    pub handlers: Arc<HandlerRegistry>,
    pub worker: Arc<ExecutionWorker>,
}

/// Connect storage and broker and build the execution stack
pub async fn create_app(config: Config) -> Result<App> {
    tracing::info!("🗄️ Initializing persistence store");
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::connect(&config.database.url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open persistence store: {}", e))?,
    );

    tracing::info!("📬 Initializing message broker");
    let broker = MessageBroker::connect(config.broker.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect message broker: {}", e))?;

    tracing::info!("📊 Initializing workflow registry");
    let workflows = Arc::new(WorkflowRegistry::new(store.clone()));

    tracing::info!("⚙️ Initializing node executor");
    let handlers = Arc::new(HandlerRegistry::with_builtins());
    let node_executor = Arc::new(NodeExecutor::new(handlers.clone(), config.execution.node_timeout()));

    tracing::info!("🚀 Initializing workflow executor");
    let executor = Arc::new(WorkflowExecutor::new(
        node_executor,
        store.clone(),
        Arc::new(LogNotifier),
        config.execution.run_timeout(),
    ));

    let worker = Arc::new(ExecutionWorker::new(
        &config,
        broker.clone(),
        store.clone(),
        workflows.clone(),
        executor,
    ));

    tracing::info!("✅ Application initialized successfully");
    Ok(App {
        config,
        store,
        broker,
        workflows,
        handlers,
        worker,
    })
}

/// Run the worker until Ctrl-C
pub async fn start_worker(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowrelay worker...");

    let app = create_app(config).await?;
    let consumer = app.worker.clone().start().await?;

    let broker = app.broker.clone();
    let health = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);
        loop {
            ticker.tick().await;
            let snapshot = broker.health().await;
            tracing::info!(
                "🩺 Broker connected={} queues={} utilization={:.2}",
                snapshot.connected,
                snapshot
                    .queues
                    .iter()
                    .map(|q| format!("{}:{}/{}", q.name, q.messages, q.in_flight))
                    .collect::<Vec<_>>()
                    .join(" "),
                snapshot.throughput.utilization
            );
            for recommendation in &snapshot.recommendations {
                tracing::warn!(
                    "📈 [{:?}] {}",
                    recommendation.priority,
                    recommendation.message
                );
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested; draining in-flight executions");
    health.abort();
    consumer.shutdown().await?;
    tracing::info!("👋 Worker stopped");
    Ok(())
}
