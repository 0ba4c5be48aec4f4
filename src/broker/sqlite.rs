/// SQLite-backed message broker
///
/// Queues live in `broker_queues`, messages in `broker_messages`. A consumer
/// leases ready messages by stamping a delivery tag on them; settling deletes
/// the row (ack), clears the lease (requeue) or moves the row to the queue's
/// dead-letter target (reject). Leases held by consumers whose heartbeat went
/// stale are released, so nothing is lost when a worker dies mid-message.
///
/// Retry delays use the RETRY queue: a retried message becomes due after its
/// expiration and the pump moves it back to MAIN, in due order.

use super::stats::{estimate_throughput, scaling_recommendations, BrokerHealth, QueueDepths, QueueStats};
use super::topology::{QueueArguments, Topology};
use super::{Delivery, MessageHandler, QueueMessage};
use crate::config::BrokerConfig;
use crate::store::sqlite::connect_pool;
use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CONSUMER_STALE_AFTER_MS: i64 = 30_000;
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A dead-lettered message kept for inspection or manual replay
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub reason: Option<String>,
    pub enqueued_at: i64,
}

struct Leased {
    body: String,
    delivery_tag: String,
    redelivered: bool,
}

/// Shared broker handle. Cloning is cheap; all clones share one pool,
/// topology and health flag.
#[derive(Clone)]
pub struct MessageBroker {
    pool: SqlitePool,
    config: Arc<BrokerConfig>,
    topology: Arc<ArcSwap<Topology>>,
    connected: Arc<AtomicBool>,
}

impl std::fmt::Debug for MessageBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBroker")
            .field("url", &self.config.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MessageBroker {
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        tracing::info!("📬 Connecting message broker: {}", config.url);
        let pool = connect_pool(&config.url, 8).await?;
        let broker = Self::with_pool(pool, config);
        broker.init_schema().await?;
        broker.connected.store(true, Ordering::SeqCst);
        Ok(broker)
    }

    /// Wrap an existing pool. Call `init_schema` before use.
    pub fn with_pool(pool: SqlitePool, config: BrokerConfig) -> Self {
        let topology = Topology::from_config(&config);
        Self {
            pool,
            config: Arc::new(config),
            topology: Arc::new(ArcSwap::from_pointee(topology)),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS broker_queues (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                arguments TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS broker_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                queue TEXT NOT NULL,
                body TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 1,
                persistent INTEGER NOT NULL DEFAULT 1,
                expiration_ms INTEGER,
                available_at INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                delivery_tag TEXT,
                consumer_tag TEXT,
                leased_at INTEGER,
                redelivered INTEGER NOT NULL DEFAULT 0,
                dead_letter_reason TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_broker_messages_ready ON broker_messages(queue, delivery_tag, priority, available_at)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_broker_messages_tag ON broker_messages(delivery_tag)",
            r#"
            CREATE TABLE IF NOT EXISTS broker_consumers (
                consumer_tag TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                prefetch INTEGER NOT NULL,
                heartbeat_at INTEGER NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load_full()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Ping the database and update the health flag. The pool reconnects on
    /// its own; this only observes it.
    pub async fn check_connection(&self) -> bool {
        let ok = sqlx::query("SELECT 1").execute(&self.pool).await.is_ok();
        let was = self.connected.swap(ok, Ordering::SeqCst);
        if was != ok {
            if ok {
                tracing::info!("🔌 Broker connection established");
            } else {
                tracing::warn!("🔌 Broker connection lost");
            }
        }
        ok
    }

    /// Poll until the broker answers or `timeout` passes
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let pause = Duration::from_millis(self.config.poll_interval_ms.max(10));
        loop {
            if self.check_connection().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("message broker not ready after {:?}", timeout));
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Declare MAIN, RETRY and DLQ. Existing queues keep the arguments they
    /// were created with.
    pub async fn assert_topology(&self) -> Result<Arc<Topology>> {
        let desired = Topology::from_config(&self.config);
        let created_at = Utc::now().to_rfc3339();

        for spec in desired.queues() {
            let arguments = serde_json::to_string(&spec.arguments)?;
            let result = sqlx::query(
                "INSERT INTO broker_queues (name, kind, arguments, created_at) VALUES (?, ?, ?, ?) ON CONFLICT(name) DO NOTHING",
            )
            .bind(&spec.name)
            .bind(spec.kind.as_str())
            .bind(arguments)
            .bind(&created_at)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                tracing::info!("📦 Declared queue {} ({})", spec.name, spec.kind.as_str());
            } else {
                tracing::debug!("📦 Queue {} already declared; keeping its arguments", spec.name);
            }
        }

        let rows = sqlx::query("SELECT name, arguments FROM broker_queues")
            .fetch_all(&self.pool)
            .await?;
        let mut declared = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let raw: String = row.try_get("arguments")?;
            let arguments: QueueArguments = serde_json::from_str(&raw)
                .map_err(|e| anyhow!("queue {} has unreadable arguments: {}", name, e))?;
            declared.push((name, arguments));
        }

        let topology = Arc::new(desired.with_declared(&declared));
        self.topology.store(topology.clone());
        Ok(topology)
    }

    /// Publish a job to MAIN. Never fails; returns whether it was stored.
    pub async fn publish(&self, message: &QueueMessage) -> bool {
        let queue = self.topology().main.name.clone();
        match self
            .insert(&queue, message, message.effective_priority(), None)
            .await
        {
            Ok(()) => {
                tracing::debug!("📤 Published {} to {}", message.message_id(), queue);
                if let Err(e) = self.enforce_max_length(&queue).await {
                    tracing::warn!("⚠️ Could not enforce max length on {}: {}", queue, e);
                }
                true
            }
            Err(e) => {
                tracing::error!("❌ Failed to publish {}: {}", message.message_id(), e);
                false
            }
        }
    }

    /// Republish to RETRY with `retry_count + 1`, due after `delay_ms`
    pub async fn publish_retry(&self, message: &QueueMessage, delay_ms: u64) -> bool {
        let mut retry = message.clone();
        retry.retry_count += 1;
        retry.timestamp = Utc::now();
        let queue = self.topology().retry.name.clone();
        let delay = i64::try_from(delay_ms).unwrap_or(i64::MAX / 2);

        match self
            .insert(&queue, &retry, retry.effective_priority(), Some(delay))
            .await
        {
            Ok(()) => {
                tracing::info!(
                    "🔁 Scheduled retry {} of execution {} in {}ms",
                    retry.retry_count,
                    retry.execution_id,
                    delay_ms
                );
                true
            }
            Err(e) => {
                tracing::error!("❌ Failed to schedule retry for {}: {}", retry.execution_id, e);
                false
            }
        }
    }

    async fn insert(
        &self,
        queue: &str,
        message: &QueueMessage,
        priority: u8,
        expiration_ms: Option<i64>,
    ) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO broker_messages
                (message_id, queue, body, priority, persistent, expiration_ms, available_at, enqueued_at)
            VALUES (?, ?, ?, ?, 1, ?, ?, ?)
            "#,
        )
        .bind(message.message_id())
        .bind(queue)
        .bind(message.to_body()?)
        .bind(i64::from(priority))
        .bind(expiration_ms)
        .bind(now.saturating_add(expiration_ms.unwrap_or(0)))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop the oldest ready messages beyond the queue's max length into its
    /// dead-letter target
    async fn enforce_max_length(&self, queue: &str) -> Result<u64> {
        let topology = self.topology();
        let Some(spec) = topology.find(queue) else {
            return Ok(0);
        };
        let Some(max_length) = spec.arguments.max_length else {
            return Ok(0);
        };

        let ready: i64 = sqlx::query("SELECT COUNT(*) AS n FROM broker_messages WHERE queue = ? AND delivery_tag IS NULL")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        if ready <= max_length {
            return Ok(0);
        }
        let overflow = ready - max_length;

        let result = match &spec.arguments.dead_letter_queue {
            Some(target) => {
                sqlx::query(
                    r#"
                    UPDATE broker_messages
                    SET queue = ?, dead_letter_reason = 'maxlen', enqueued_at = ?, expiration_ms = NULL
                    WHERE seq IN (
                        SELECT seq FROM broker_messages
                        WHERE queue = ? AND delivery_tag IS NULL
                        ORDER BY available_at, seq LIMIT ?
                    )
                    "#,
                )
                .bind(target)
                .bind(now_ms())
                .bind(queue)
                .bind(overflow)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM broker_messages WHERE seq IN (
                        SELECT seq FROM broker_messages
                        WHERE queue = ? AND delivery_tag IS NULL
                        ORDER BY available_at, seq LIMIT ?
                    )
                    "#,
                )
                .bind(queue)
                .bind(overflow)
                .execute(&self.pool)
                .await?
            }
        };

        tracing::warn!(
            "⚠️ Queue {} over its max length {}; dropped {} oldest message(s)",
            queue,
            max_length,
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }

    /// Lease up to `limit` ready messages, highest priority first, then by due time
    async fn claim(&self, queue: &str, consumer_tag: &str, limit: usize) -> Result<Vec<Leased>> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let candidates = sqlx::query(
            r#"
            SELECT seq, body, redelivered FROM broker_messages
            WHERE queue = ? AND delivery_tag IS NULL AND available_at <= ?
            ORDER BY priority DESC, available_at, seq
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut leased = Vec::with_capacity(candidates.len());
        for row in candidates {
            let seq: i64 = row.try_get("seq")?;
            let delivery_tag = Uuid::new_v4().to_string();
            let result = sqlx::query(
                "UPDATE broker_messages SET delivery_tag = ?, consumer_tag = ?, leased_at = ? WHERE seq = ? AND delivery_tag IS NULL",
            )
            .bind(&delivery_tag)
            .bind(consumer_tag)
            .bind(now)
            .bind(seq)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                leased.push(Leased {
                    body: row.try_get("body")?,
                    delivery_tag,
                    redelivered: row.try_get::<i64, _>("redelivered")? != 0,
                });
            }
        }

        tx.commit().await?;
        Ok(leased)
    }

    pub(crate) async fn ack(&self, delivery_tag: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM broker_messages WHERE delivery_tag = ?")
            .bind(delivery_tag)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("unknown delivery tag {}", delivery_tag));
        }
        Ok(())
    }

    pub(crate) async fn requeue(&self, delivery_tag: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE broker_messages SET delivery_tag = NULL, consumer_tag = NULL, leased_at = NULL, redelivered = 1 WHERE delivery_tag = ?",
        )
        .bind(delivery_tag)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("unknown delivery tag {}", delivery_tag));
        }
        Ok(())
    }

    /// Move a leased message to its queue's dead-letter target, or drop it
    /// when the queue has none
    pub(crate) async fn dead_letter(&self, delivery_tag: &str, reason: &str) -> Result<()> {
        let queue: String = sqlx::query("SELECT queue FROM broker_messages WHERE delivery_tag = ?")
            .bind(delivery_tag)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("unknown delivery tag {}", delivery_tag))?
            .try_get("queue")?;

        let target = self
            .topology()
            .find(&queue)
            .and_then(|spec| spec.arguments.dead_letter_queue.clone());

        match target {
            Some(target) => {
                sqlx::query(
                    r#"
                    UPDATE broker_messages
                    SET queue = ?, delivery_tag = NULL, consumer_tag = NULL, leased_at = NULL,
                        dead_letter_reason = ?, enqueued_at = ?, available_at = ?, expiration_ms = NULL
                    WHERE delivery_tag = ?
                    "#,
                )
                .bind(&target)
                .bind(reason)
                .bind(now_ms())
                .bind(now_ms())
                .bind(delivery_tag)
                .execute(&self.pool)
                .await?;
                tracing::warn!("☠️ Dead-lettered delivery {} from {} to {}: {}", delivery_tag, queue, target, reason);
            }
            None => {
                sqlx::query("DELETE FROM broker_messages WHERE delivery_tag = ?")
                    .bind(delivery_tag)
                    .execute(&self.pool)
                    .await?;
                tracing::warn!("🗑️ Dropped delivery {} from {}: {}", delivery_tag, queue, reason);
            }
        }
        Ok(())
    }

    /// Move due RETRY messages back to MAIN. Their due time is kept, so they
    /// are leased in the order they became due.
    pub async fn promote_due_retries(&self) -> Result<u64> {
        let topology = self.topology();
        let target = topology
            .retry
            .arguments
            .dead_letter_queue
            .clone()
            .unwrap_or_else(|| topology.main.name.clone());

        let result = sqlx::query(
            "UPDATE broker_messages SET queue = ?, expiration_ms = NULL WHERE queue = ? AND delivery_tag IS NULL AND available_at <= ?",
        )
        .bind(&target)
        .bind(&topology.retry.name)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        let moved = result.rows_affected();
        if moved > 0 {
            tracing::debug!("🔁 Moved {} due retr{} to {}", moved, if moved == 1 { "y" } else { "ies" }, target);
            self.enforce_max_length(&target).await?;
        }
        Ok(moved)
    }

    /// Drop DLQ entries older than the DLQ retention
    pub async fn purge_dead_letters(&self) -> Result<u64> {
        let topology = self.topology();
        let Some(ttl) = topology.dead_letter.arguments.message_ttl_ms else {
            return Ok(0);
        };
        let result = sqlx::query("DELETE FROM broker_messages WHERE queue = ? AND enqueued_at < ?")
            .bind(&topology.dead_letter.name)
            .bind(now_ms().saturating_sub(ttl))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            tracing::info!("🧹 Purged {} expired dead letter(s)", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    /// Release leases whose consumer stopped heartbeating
    pub async fn release_stale_leases(&self) -> Result<u64> {
        let cutoff = now_ms() - CONSUMER_STALE_AFTER_MS;
        sqlx::query("DELETE FROM broker_consumers WHERE heartbeat_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query(
            r#"
            UPDATE broker_messages
            SET delivery_tag = NULL, consumer_tag = NULL, leased_at = NULL, redelivered = 1
            WHERE delivery_tag IS NOT NULL
              AND (consumer_tag IS NULL OR consumer_tag NOT IN (SELECT consumer_tag FROM broker_consumers))
            "#,
        )
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            tracing::warn!("↩️ Released {} orphaned lease(s) for redelivery", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    async fn register_consumer(&self, consumer_tag: &str, queue: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO broker_consumers (consumer_tag, queue, prefetch, heartbeat_at) VALUES (?, ?, ?, ?) ON CONFLICT(consumer_tag) DO UPDATE SET heartbeat_at = excluded.heartbeat_at",
        )
        .bind(consumer_tag)
        .bind(queue)
        .bind(self.config.prefetch as i64)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeat(&self, consumer_tag: &str) -> Result<()> {
        sqlx::query("UPDATE broker_consumers SET heartbeat_at = ? WHERE consumer_tag = ?")
            .bind(now_ms())
            .bind(consumer_tag)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn deregister_consumer(&self, consumer_tag: &str) -> Result<()> {
        sqlx::query("DELETE FROM broker_consumers WHERE consumer_tag = ?")
            .bind(consumer_tag)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Start consuming MAIN. Messages are leased up to the prefetch window and
    /// each is handled on its own task.
    pub async fn consume(&self, handler: Arc<dyn MessageHandler>) -> Result<ConsumerHandle> {
        if !self.is_connected() {
            self.wait_ready(Duration::from_millis(self.config.ready_timeout_ms))
                .await?;
        }

        let queue = self.topology().main.name.clone();
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        self.release_stale_leases().await?;
        self.register_consumer(&consumer_tag, &queue).await?;

        tracing::info!(
            "👂 Consumer {} listening on {} (prefetch {})",
            consumer_tag,
            queue,
            self.config.prefetch
        );

        let shutdown = CancellationToken::new();
        let task = ConsumerTask {
            broker: self.clone(),
            handler,
            queue,
            consumer_tag: consumer_tag.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(async move {
            let result = task.run().await;
            if let Err(err) = &result {
                tracing::error!("❌ Consumer terminated with error: {}", err);
            }
            result
        });

        Ok(ConsumerHandle {
            consumer_tag,
            shutdown,
            handle,
        })
    }

    /// Pull a single message from MAIN outside any consumer loop. The lease
    /// belongs to no registered consumer, so an unsettled pull is released by
    /// the next maintenance pass.
    pub async fn next_delivery(&self) -> Result<Option<Delivery>> {
        let queue = self.topology().main.name.clone();
        let Some(lease) = self.claim(&queue, "pull", 1).await?.into_iter().next() else {
            return Ok(None);
        };
        match QueueMessage::parse(&lease.body) {
            Ok(message) => Ok(Some(Delivery::new(
                message,
                lease.delivery_tag,
                lease.redelivered,
                self.clone(),
            ))),
            Err(err) => {
                self.dead_letter(&lease.delivery_tag, &format!("malformed message: {err}"))
                    .await?;
                Err(anyhow!("malformed message dead-lettered: {}", err))
            }
        }
    }

    async fn queue_counts(&self, queue: &str) -> Result<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN delivery_tag IS NULL THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN delivery_tag IS NOT NULL THEN 1 ELSE 0 END), 0) AS in_flight
            FROM broker_messages WHERE queue = ?
            "#,
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("ready")?, row.try_get("in_flight")?))
    }

    async fn consumer_count(&self, queue: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM broker_consumers WHERE queue = ? AND heartbeat_at >= ?")
            .bind(queue)
            .bind(now_ms() - CONSUMER_STALE_AFTER_MS)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Per-queue message and consumer counts
    pub async fn queue_stats(&self) -> Result<Vec<QueueStats>> {
        let topology = self.topology();
        let mut stats = Vec::with_capacity(3);
        for spec in topology.queues() {
            let (ready, in_flight) = self.queue_counts(&spec.name).await?;
            let consumers = self.consumer_count(&spec.name).await?;
            stats.push(QueueStats::new(
                &spec.name,
                spec.kind,
                ready,
                in_flight,
                consumers,
                spec.arguments.max_length,
            ));
        }
        Ok(stats)
    }

    /// Health snapshot. Never fails: an unreachable database reports
    /// `connected = false` with no queue data.
    pub async fn health(&self) -> BrokerHealth {
        let connected = self.check_connection().await;
        let queues = if connected {
            self.queue_stats().await.unwrap_or_else(|e| {
                tracing::warn!("⚠️ Queue stats unavailable: {}", e);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let topology = self.topology();
        let find = |name: &str| queues.iter().find(|q| q.name == name);
        let main = find(&topology.main.name);
        let depths = QueueDepths {
            main: main.map(|q| q.messages).unwrap_or(0),
            retry: find(&topology.retry.name).map(|q| q.messages).unwrap_or(0),
            dead_letter: find(&topology.dead_letter.name).map(|q| q.messages).unwrap_or(0),
            main_consumers: main.map(|q| q.consumers).unwrap_or(0),
        };
        let throughput = estimate_throughput(
            depths.main_consumers,
            self.config.prefetch,
            main.map(|q| q.in_flight).unwrap_or(0),
            depths.main,
            self.config.assumed_processing_ms,
        );

        BrokerHealth {
            connected,
            recommendations: scaling_recommendations(&depths),
            throughput,
            queues,
        }
    }

    /// Most recent DLQ entries, newest first
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT message_id, body, dead_letter_reason, enqueued_at FROM broker_messages WHERE queue = ? ORDER BY enqueued_at DESC, seq DESC LIMIT ?",
        )
        .bind(&self.topology().dead_letter.name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DeadLetter {
                    message_id: row.try_get("message_id")?,
                    body: row.try_get("body")?,
                    reason: row.try_get("dead_letter_reason")?,
                    enqueued_at: row.try_get("enqueued_at")?,
                })
            })
            .collect()
    }
}

/// Running consumer
pub struct ConsumerHandle {
    consumer_tag: String,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop leasing, wait for in-flight deliveries, deregister
    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("consumer task panicked: {err}")),
        }
    }
}

struct ConsumerTask {
    broker: MessageBroker,
    handler: Arc<dyn MessageHandler>,
    queue: String,
    consumer_tag: String,
    shutdown: CancellationToken,
}

impl ConsumerTask {
    async fn run(self) -> Result<()> {
        let prefetch = self.broker.config.prefetch.max(1);
        let semaphore = Arc::new(Semaphore::new(prefetch));

        let mut poll = interval(Duration::from_millis(self.broker.config.poll_interval_ms.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut gated = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("🛑 Consumer {} shutting down", self.consumer_tag);
                    break;
                }
                _ = poll.tick() => {
                    if let Err(err) = self.broker.promote_due_retries().await {
                        tracing::warn!("⚠️ Retry pump failed: {}", err);
                    }
                    if !self.handler.accepting() {
                        if !gated {
                            tracing::warn!("⏸️ Consumer {} holding off: handler is not accepting work", self.consumer_tag);
                            gated = true;
                        }
                        continue;
                    }
                    if gated {
                        tracing::info!("▶️ Consumer {} accepting work again", self.consumer_tag);
                        gated = false;
                    }
                    if let Err(err) = self.poll_and_dispatch(&semaphore).await {
                        tracing::error!("❌ Consumer poll failed: {}", err);
                        self.broker.check_connection().await;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = self.broker.heartbeat(&self.consumer_tag).await {
                        tracing::warn!("⚠️ Consumer heartbeat failed: {}", err);
                    }
                }
                _ = maintenance.tick() => {
                    if let Err(err) = self.broker.purge_dead_letters().await {
                        tracing::warn!("⚠️ Dead-letter purge failed: {}", err);
                    }
                    if let Err(err) = self.broker.release_stale_leases().await {
                        tracing::warn!("⚠️ Lease release failed: {}", err);
                    }
                }
            }
        }

        // wait for in-flight deliveries
        let _ = semaphore.acquire_many(prefetch as u32).await;
        self.broker.deregister_consumer(&self.consumer_tag).await?;
        Ok(())
    }

    async fn poll_and_dispatch(&self, semaphore: &Arc<Semaphore>) -> Result<()> {
        let available = semaphore.available_permits();
        if available == 0 {
            return Ok(());
        }

        let leased = self
            .broker
            .claim(&self.queue, &self.consumer_tag, available)
            .await?;
        if leased.is_empty() {
            return Ok(());
        }
        tracing::debug!("📥 Leased {} message(s)", leased.len());

        for lease in leased {
            let permit = semaphore.clone().acquire_owned().await?;

            let message = match QueueMessage::parse(&lease.body) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!("🗑️ Rejecting malformed message {}: {}", lease.delivery_tag, err);
                    if let Err(e) = self
                        .broker
                        .dead_letter(&lease.delivery_tag, &format!("malformed message: {err}"))
                        .await
                    {
                        tracing::error!("❌ Could not reject {}: {}", lease.delivery_tag, e);
                    }
                    continue;
                }
            };

            let delivery = Delivery::new(
                message,
                lease.delivery_tag.clone(),
                lease.redelivered,
                self.broker.clone(),
            );
            let settled = delivery.settled_flag();
            let handler = self.handler.clone();
            let broker = self.broker.clone();
            let delivery_tag = lease.delivery_tag;

            tokio::spawn(async move {
                let _permit = permit;
                // inner task so a panicking handler cannot leak the lease
                let outcome = tokio::spawn(async move { handler.handle(delivery).await }).await;
                if let Err(err) = outcome {
                    tracing::error!("❌ Message handler panicked on {}: {}", delivery_tag, err);
                }
                if !settled.load(Ordering::SeqCst) {
                    tracing::warn!("↩️ Delivery {} left unsettled; requeueing", delivery_tag);
                    if let Err(err) = broker.requeue(&delivery_tag).await {
                        tracing::error!("❌ Could not requeue {}: {}", delivery_tag, err);
                    }
                }
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    fn config() -> BrokerConfig {
        BrokerConfig {
            url: "sqlite::memory:".into(),
            poll_interval_ms: 10,
            ..BrokerConfig::default()
        }
    }

    async fn broker_with(config: BrokerConfig) -> MessageBroker {
        let broker = MessageBroker::connect(config).await.unwrap();
        broker.assert_topology().await.unwrap();
        broker
    }

    async fn broker() -> MessageBroker {
        broker_with(config()).await
    }

    fn message(id: &str) -> QueueMessage {
        QueueMessage::new(id, "wf", "user", json!({"n": 1}))
    }

    async fn depth(broker: &MessageBroker, queue: &str) -> i64 {
        broker.queue_counts(queue).await.unwrap().0
    }

    #[tokio::test]
    async fn topology_keeps_first_declared_arguments() {
        let broker = broker_with(BrokerConfig {
            max_queue_length: 100,
            ..config()
        })
        .await;

        let redeployed = MessageBroker::with_pool(
            broker.pool.clone(),
            BrokerConfig {
                max_queue_length: 5,
                ..config()
            },
        );
        redeployed.init_schema().await.unwrap();
        let topology = redeployed.assert_topology().await.unwrap();
        assert_eq!(topology.main.arguments.max_length, Some(100));
    }

    #[tokio::test]
    async fn leases_follow_priority_then_age() {
        let broker = broker().await;
        assert!(broker.publish(&message("low-1")).await);
        assert!(broker.publish(&message("low-2")).await);
        assert!(broker.publish(&message("urgent").with_priority(10)).await);

        let leased = broker.claim("workflow.execute", "c1", 10).await.unwrap();
        let order: Vec<String> = leased
            .iter()
            .map(|l| QueueMessage::parse(&l.body).unwrap().execution_id)
            .collect();
        assert_eq!(order, vec!["urgent", "low-1", "low-2"]);
        // leased messages are not handed out twice
        assert!(broker.claim("workflow.execute", "c2", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_waits_for_its_delay_then_returns_to_main() {
        let broker = broker().await;
        let original = message("exec-r");

        assert!(broker.publish_retry(&original, 60_000).await);
        assert_eq!(depth(&broker, "workflow.execute.retry").await, 1);
        assert_eq!(broker.promote_due_retries().await.unwrap(), 0);
        assert_eq!(depth(&broker, "workflow.execute").await, 0);

        assert!(broker.publish_retry(&original, 0).await);
        assert_eq!(broker.promote_due_retries().await.unwrap(), 1);

        let leased = broker.claim("workflow.execute", "c1", 10).await.unwrap();
        assert_eq!(leased.len(), 1);
        let redelivered = QueueMessage::parse(&leased[0].body).unwrap();
        assert_eq!(redelivered.retry_count, 1);
        assert_eq!(redelivered.effective_priority(), 5);
        assert_eq!(redelivered.message_id(), "exec-r-1");
    }

    #[tokio::test]
    async fn reject_moves_message_to_dead_letter_queue() {
        let broker = broker().await;
        broker.publish(&message("doomed")).await;
        let leased = broker.claim("workflow.execute", "c1", 1).await.unwrap();
        broker.dead_letter(&leased[0].delivery_tag, "permanent failure").await.unwrap();

        assert_eq!(depth(&broker, "workflow.execute").await, 0);
        let dead = broker.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason.as_deref(), Some("permanent failure"));
        assert_eq!(QueueMessage::parse(&dead[0].body).unwrap().execution_id, "doomed");
    }

    #[tokio::test]
    async fn requeued_messages_are_flagged_redelivered() {
        let broker = broker().await;
        broker.publish(&message("again")).await;
        let first = broker.claim("workflow.execute", "c1", 1).await.unwrap();
        assert!(!first[0].redelivered);
        broker.requeue(&first[0].delivery_tag).await.unwrap();
        assert!(broker.ack(&first[0].delivery_tag).await.is_err());

        let second = broker.claim("workflow.execute", "c1", 1).await.unwrap();
        assert!(second[0].redelivered);
        broker.ack(&second[0].delivery_tag).await.unwrap();
        assert_eq!(broker.queue_counts("workflow.execute").await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_into_dead_letters() {
        let broker = broker_with(BrokerConfig {
            max_queue_length: 2,
            ..config()
        })
        .await;
        for id in ["a", "b", "c"] {
            assert!(broker.publish(&message(id)).await);
        }
        assert_eq!(depth(&broker, "workflow.execute").await, 2);
        let dead = broker.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, "a-0");
        assert_eq!(dead[0].reason.as_deref(), Some("maxlen"));
    }

    #[tokio::test]
    async fn orphaned_leases_are_released() {
        let broker = broker().await;
        broker.publish(&message("orphan")).await;
        let leased = broker.claim("workflow.execute", "dead-consumer", 1).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(broker.release_stale_leases().await.unwrap(), 1);
        let again = broker.claim("workflow.execute", "c2", 1).await.unwrap();
        assert!(again[0].redelivered);
    }

    async fn reject_one(broker: &MessageBroker, id: &str) {
        assert!(broker.publish(&message(id)).await);
        let delivery = broker.next_delivery().await.unwrap().unwrap();
        delivery.reject_with_reason("test").await.unwrap();
    }

    #[tokio::test]
    async fn pulled_delivery_reports_redelivery() {
        let broker = broker().await;
        assert!(broker.publish(&message("again")).await);
        let first = broker.next_delivery().await.unwrap().unwrap();
        assert!(!first.redelivered());
        first.nack(true).await.unwrap();

        let second = broker.next_delivery().await.unwrap().unwrap();
        assert!(second.redelivered());
        assert_eq!(second.message().execution_id, "again");
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn old_dead_letters_are_purged() {
        let broker = broker_with(BrokerConfig {
            dead_letter_ttl_ms: 1_000,
            ..config()
        })
        .await;
        reject_one(&broker, "stale").await;
        sqlx::query("UPDATE broker_messages SET enqueued_at = enqueued_at - 5000")
            .execute(&broker.pool)
            .await
            .unwrap();
        reject_one(&broker, "fresh").await;
        assert_eq!(broker.purge_dead_letters().await.unwrap(), 1);
        assert_eq!(broker.dead_letters(10).await.unwrap()[0].message_id, "fresh-0");
    }

    #[derive(Default)]
    struct Collector {
        seen: Mutex<Vec<String>>,
        ack: bool,
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn handle(&self, delivery: Delivery) {
            self.seen.lock().await.push(delivery.message().execution_id.clone());
            if self.ack {
                delivery.ack().await.unwrap();
            }
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn consumer_delivers_and_acks() {
        let broker = broker().await;
        let collector = Arc::new(Collector {
            ack: true,
            ..Collector::default()
        });
        let consumer = broker.consume(collector.clone()).await.unwrap();

        for id in ["m1", "m2", "m3"] {
            broker.publish(&message(id)).await;
        }
        wait_for(|| {
            let collector = collector.clone();
            async move { collector.seen.lock().await.len() == 3 }
        })
        .await;
        wait_for(|| {
            let broker = broker.clone();
            async move { broker.queue_counts("workflow.execute").await.unwrap() == (0, 0) }
        })
        .await;

        let stats = broker.queue_stats().await.unwrap();
        assert_eq!(stats[0].consumers, 1);
        consumer.shutdown().await.unwrap();
        assert_eq!(broker.queue_stats().await.unwrap()[0].consumers, 0);
    }

    #[tokio::test]
    async fn malformed_bodies_go_to_dead_letters() {
        let broker = broker().await;
        sqlx::query(
            "INSERT INTO broker_messages (message_id, queue, body, available_at, enqueued_at) VALUES ('bad', 'workflow.execute', 'not json', 0, 0)",
        )
        .execute(&broker.pool)
        .await
        .unwrap();

        let collector = Arc::new(Collector::default());
        let consumer = broker.consume(collector.clone()).await.unwrap();
        wait_for(|| {
            let broker = broker.clone();
            async move { broker.dead_letters(10).await.unwrap().len() == 1 }
        })
        .await;
        consumer.shutdown().await.unwrap();

        assert!(collector.seen.lock().await.is_empty());
        let dead = broker.dead_letters(10).await.unwrap();
        assert!(dead[0].reason.as_deref().unwrap().starts_with("malformed message"));
    }

    #[tokio::test]
    async fn unsettled_deliveries_are_requeued() {
        let broker = broker().await;
        broker.publish(&message("forgotten")).await;
        let collector = Arc::new(Collector::default());
        let consumer = broker.consume(collector.clone()).await.unwrap();

        // delivered again and again because the handler never settles
        wait_for(|| {
            let collector = collector.clone();
            async move { collector.seen.lock().await.len() >= 2 }
        })
        .await;
        consumer.shutdown().await.unwrap();
        assert_eq!(depth(&broker, "workflow.execute").await, 1);
    }

    #[tokio::test]
    async fn health_reports_recommendations_and_throughput() {
        let broker = broker().await;
        let health = broker.health().await;
        assert!(health.connected);
        assert_eq!(health.queues.len(), 3);
        assert!(health.recommendations.is_empty());
        assert_eq!(health.throughput.consumers, 0);
        broker.wait_ready(Duration::from_millis(100)).await.unwrap();
    }
}
