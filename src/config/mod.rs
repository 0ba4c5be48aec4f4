/// Configuration management for the flowrelay engine
///
/// Handles persistence and broker connections, worker retry policy,
/// execution timeouts and circuit breaker thresholds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Persistence database configuration
    pub database: DatabaseConfig,
    /// Message broker configuration
    pub broker: BrokerConfig,
    /// Execution worker configuration
    pub worker: WorkerConfig,
    /// Per-node and per-run execution limits
    pub execution: ExecutionConfig,
    /// Process-wide circuit breaker
    pub breaker: BreakerConfig,
}

/// Database configuration for workflow, execution and profile records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (e.g., "sqlite://data/flowrelay.db")
    pub url: String,
}

/// Durable queue topology and consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// sqlx connection URL of the broker database
    pub url: String,
    /// Main work queue name
    pub main_queue: String,
    /// Delay queue that dead-letters back into the main queue
    pub retry_queue: String,
    /// Dead-letter queue for manual inspection
    pub dead_letter_queue: String,
    /// Maximum unacknowledged messages held by one consumer
    pub prefetch: usize,
    /// Main queue length cap (only applied when the queue is first created)
    pub max_queue_length: i64,
    /// Retention for dead-lettered messages, in milliseconds
    pub dead_letter_ttl_ms: i64,
    /// How often the consumer polls for new deliveries
    pub poll_interval_ms: u64,
    /// How long consumer setup waits for the initial connection
    pub ready_timeout_ms: u64,
    /// Assumed processing time per message, used for throughput estimates
    pub assumed_processing_ms: u64,
}

/// Worker retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Attempts allowed before a job is dead-lettered
    pub max_retries: u32,
    /// First retry delay; doubles for every further attempt
    pub base_backoff_ms: u64,
    /// Upper bound for the retry delay
    pub max_backoff_ms: u64,
}

/// Execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Bound on a single handler invocation
    pub node_timeout_ms: u64,
    /// Bound on a whole workflow run
    pub run_timeout_ms: u64,
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// When false the worker never stops accepting work
    pub enabled: bool,
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// How long the breaker stays open before probing
    pub reset_timeout_ms: u64,
}

impl ExecutionConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env_or("FLOWRELAY_DATABASE_URL", "sqlite://data/flowrelay.db"),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: env_or("FLOWRELAY_BROKER_URL", "sqlite://data/broker.db"),
            main_queue: env_or("FLOWRELAY_MAIN_QUEUE", "workflow.execute"),
            retry_queue: env_or("FLOWRELAY_RETRY_QUEUE", "workflow.execute.retry"),
            dead_letter_queue: env_or("FLOWRELAY_DLQ", "workflow.execute.dlq"),
            prefetch: env_parse("FLOWRELAY_PREFETCH", 50),
            max_queue_length: env_parse("FLOWRELAY_MAX_QUEUE_LENGTH", 100_000),
            dead_letter_ttl_ms: env_parse("FLOWRELAY_DLQ_TTL_MS", 7 * 24 * 60 * 60 * 1000),
            poll_interval_ms: env_parse("FLOWRELAY_POLL_INTERVAL_MS", 200),
            ready_timeout_ms: env_parse("FLOWRELAY_BROKER_READY_TIMEOUT_MS", 30_000),
            assumed_processing_ms: env_parse("FLOWRELAY_ASSUMED_PROCESSING_MS", 2_000),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: env_parse("FLOWRELAY_MAX_RETRIES", 3),
            base_backoff_ms: env_parse("FLOWRELAY_BASE_BACKOFF_MS", 1_000),
            max_backoff_ms: env_parse("FLOWRELAY_MAX_BACKOFF_MS", 60_000),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            node_timeout_ms: env_parse("FLOWRELAY_NODE_TIMEOUT_MS", 5 * 60 * 1000),
            run_timeout_ms: env_parse("FLOWRELAY_RUN_TIMEOUT_MS", 60 * 60 * 1000),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: env_parse("FLOWRELAY_BREAKER_ENABLED", true),
            failure_threshold: env_parse("FLOWRELAY_BREAKER_FAILURE_THRESHOLD", 5),
            success_threshold: env_parse("FLOWRELAY_BREAKER_SUCCESS_THRESHOLD", 2),
            reset_timeout_ms: env_parse("FLOWRELAY_BREAKER_RESET_TIMEOUT_MS", 60_000),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
            execution: ExecutionConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = Config::default();
        assert_eq!(config.broker.prefetch, 50);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.execution.node_timeout(), Duration::from_secs(300));
        assert_eq!(config.execution.run_timeout(), Duration::from_secs(3600));
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("FLOWRELAY_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse("FLOWRELAY_TEST_GARBAGE", 7u32), 7);
    }
}
