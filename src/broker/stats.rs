/// Broker introspection
///
/// Plain data for an external health endpoint: per-queue counts with derived
/// status flags, ranked scaling recommendations and a throughput estimate.
/// The recommendation and throughput functions are pure.

use super::topology::QueueKind;
use serde::Serialize;

const SCALE_UP_DEPTH: i64 = 50_000;
const ADD_CONSUMERS_DEPTH: i64 = 10_000;
const MIN_CONSUMERS_UNDER_LOAD: i64 = 5;
const DLQ_CRITICAL_DEPTH: i64 = 1_000;
const DLQ_WARNING_DEPTH: i64 = 100;
const RETRY_BACKLOG_DEPTH: i64 = 5_000;
const SCALE_DOWN_CONSUMERS: i64 = 10;
const NEAR_CAPACITY_RATIO: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub name: String,
    pub kind: QueueKind,
    /// Ready messages (not leased)
    pub messages: i64,
    /// Leased, not yet settled
    pub in_flight: i64,
    pub consumers: i64,
    pub max_length: Option<i64>,
    pub is_idle: bool,
    /// Messages waiting with nobody consuming
    pub is_stalled: bool,
    pub near_capacity: bool,
}

impl QueueStats {
    pub fn new(
        name: &str,
        kind: QueueKind,
        messages: i64,
        in_flight: i64,
        consumers: i64,
        max_length: Option<i64>,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            messages,
            in_flight,
            consumers,
            max_length,
            is_idle: messages == 0 && in_flight == 0,
            is_stalled: kind == QueueKind::Main && messages > 0 && consumers == 0,
            near_capacity: max_length
                .map(|max| max > 0 && messages as f64 >= max as f64 * NEAR_CAPACITY_RATIO)
                .unwrap_or(false),
        }
    }
}

/// Depths the recommendations are computed from
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueDepths {
    pub main: i64,
    pub retry: i64,
    pub dead_letter: i64,
    pub main_consumers: i64,
}

/// Ordered so `Critical` sorts highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ScaleUp,
    AddConsumers,
    InspectDeadLetters,
    InspectRetries,
    ScaleDown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: RecommendationPriority,
    pub message: String,
}

/// Map queue depths to recommendations, most urgent first
pub fn scaling_recommendations(depths: &QueueDepths) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();
    let mut push = |kind, priority, message: String| {
        recommendations.push(Recommendation { kind, priority, message })
    };

    if depths.main > SCALE_UP_DEPTH {
        push(
            RecommendationKind::ScaleUp,
            RecommendationPriority::High,
            format!("main queue holds {} messages; add worker instances", depths.main),
        );
    }
    if depths.main > ADD_CONSUMERS_DEPTH && depths.main_consumers < MIN_CONSUMERS_UNDER_LOAD {
        push(
            RecommendationKind::AddConsumers,
            RecommendationPriority::High,
            format!(
                "main queue holds {} messages with only {} consumer(s)",
                depths.main, depths.main_consumers
            ),
        );
    }
    if depths.dead_letter > DLQ_CRITICAL_DEPTH {
        push(
            RecommendationKind::InspectDeadLetters,
            RecommendationPriority::Critical,
            format!("dead-letter queue holds {} messages", depths.dead_letter),
        );
    } else if depths.dead_letter > DLQ_WARNING_DEPTH {
        push(
            RecommendationKind::InspectDeadLetters,
            RecommendationPriority::Medium,
            format!("dead-letter queue holds {} messages", depths.dead_letter),
        );
    }
    if depths.retry > RETRY_BACKLOG_DEPTH {
        push(
            RecommendationKind::InspectRetries,
            RecommendationPriority::Medium,
            format!("retry queue holds {} messages", depths.retry),
        );
    }
    if depths.main == 0 && depths.main_consumers > SCALE_DOWN_CONSUMERS {
        push(
            RecommendationKind::ScaleDown,
            RecommendationPriority::Low,
            format!("main queue is empty with {} consumers", depths.main_consumers),
        );
    }

    // stable: equal priorities keep rule order
    recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));
    recommendations
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Throughput {
    pub consumers: i64,
    pub prefetch: usize,
    pub in_flight: i64,
    /// Upper bound with every prefetch slot busy
    pub max_messages_per_second: f64,
    /// In-flight share of the total prefetch window, 0.0..=1.0
    pub utilization: f64,
    /// Time to drain the backlog at the upper bound
    pub estimated_drain_seconds: Option<f64>,
}

pub fn estimate_throughput(
    consumers: i64,
    prefetch: usize,
    in_flight: i64,
    backlog: i64,
    assumed_processing_ms: u64,
) -> Throughput {
    let window = consumers.max(0) as f64 * prefetch as f64;
    let max_messages_per_second = if assumed_processing_ms == 0 {
        0.0
    } else {
        window * 1000.0 / assumed_processing_ms as f64
    };
    let utilization = if window > 0.0 {
        (in_flight.max(0) as f64 / window).min(1.0)
    } else {
        0.0
    };
    let estimated_drain_seconds =
        (max_messages_per_second > 0.0).then(|| backlog.max(0) as f64 / max_messages_per_second);

    Throughput {
        consumers,
        prefetch,
        in_flight,
        max_messages_per_second,
        utilization,
        estimated_drain_seconds,
    }
}

/// Snapshot returned by `MessageBroker::health`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerHealth {
    pub connected: bool,
    pub queues: Vec<QueueStats>,
    pub recommendations: Vec<Recommendation>,
    pub throughput: Throughput,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(recommendations: &[Recommendation]) -> Vec<RecommendationKind> {
        recommendations.iter().map(|r| r.kind).collect()
    }

    #[test]
    fn deep_main_queue_with_few_consumers() {
        let recommendations = scaling_recommendations(&QueueDepths {
            main: 60_000,
            main_consumers: 2,
            ..QueueDepths::default()
        });
        assert_eq!(
            kinds(&recommendations),
            vec![RecommendationKind::ScaleUp, RecommendationKind::AddConsumers]
        );
    }

    #[test]
    fn large_dead_letter_queue_is_critical_and_ranked_first() {
        let recommendations = scaling_recommendations(&QueueDepths {
            main: 60_000,
            dead_letter: 1_500,
            main_consumers: 8,
            ..QueueDepths::default()
        });
        assert_eq!(recommendations[0].kind, RecommendationKind::InspectDeadLetters);
        assert_eq!(recommendations[0].priority, RecommendationPriority::Critical);
        assert_eq!(recommendations[1].kind, RecommendationKind::ScaleUp);
    }

    #[test]
    fn moderate_backlogs_are_medium() {
        let recommendations = scaling_recommendations(&QueueDepths {
            dead_letter: 150,
            retry: 6_000,
            main_consumers: 1,
            ..QueueDepths::default()
        });
        assert!(recommendations
            .iter()
            .all(|r| r.priority == RecommendationPriority::Medium));
        assert_eq!(recommendations.len(), 2);
    }

    #[test]
    fn idle_fleet_can_shrink() {
        let recommendations = scaling_recommendations(&QueueDepths {
            main_consumers: 12,
            ..QueueDepths::default()
        });
        assert_eq!(kinds(&recommendations), vec![RecommendationKind::ScaleDown]);
        assert!(scaling_recommendations(&QueueDepths::default()).is_empty());
    }

    #[test]
    fn throughput_from_prefetch_window() {
        let estimate = estimate_throughput(2, 50, 25, 1_000, 2_000);
        assert_eq!(estimate.max_messages_per_second, 50.0);
        assert_eq!(estimate.utilization, 0.25);
        assert_eq!(estimate.estimated_drain_seconds, Some(20.0));

        let idle = estimate_throughput(0, 50, 0, 10, 2_000);
        assert_eq!(idle.utilization, 0.0);
        assert!(idle.estimated_drain_seconds.is_none());
    }

    #[test]
    fn status_flags() {
        let stalled = QueueStats::new("main", QueueKind::Main, 95, 0, 0, Some(100));
        assert!(stalled.is_stalled && stalled.near_capacity && !stalled.is_idle);
        let idle = QueueStats::new("dlq", QueueKind::DeadLetter, 0, 0, 0, None);
        assert!(idle.is_idle && !idle.is_stalled && !idle.near_capacity);
    }
}
