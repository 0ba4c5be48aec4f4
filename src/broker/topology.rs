/// Queue topology
///
/// MAIN dead-letters to DLQ, RETRY dead-letters back to MAIN (its per-message
/// expiration is the retry delay), DLQ holds failed jobs for inspection.
/// Quota arguments are recorded when a queue is first declared and never
/// rewritten, so a redeploy with different defaults keeps the original ones.

use crate::config::BrokerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Main,
    Retry,
    DeadLetter,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Main => "main",
            QueueKind::Retry => "retry",
            QueueKind::DeadLetter => "dead_letter",
        }
    }
}

/// Declared queue arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueArguments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ttl_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority: Option<u8>,
    /// Bodies stay on disk until leased
    #[serde(default)]
    pub lazy: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub kind: QueueKind,
    pub arguments: QueueArguments,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub main: QueueSpec,
    pub retry: QueueSpec,
    pub dead_letter: QueueSpec,
}

impl Topology {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            main: QueueSpec {
                name: config.main_queue.clone(),
                kind: QueueKind::Main,
                arguments: QueueArguments {
                    dead_letter_queue: Some(config.dead_letter_queue.clone()),
                    max_length: Some(config.max_queue_length),
                    max_priority: Some(super::PRIORITY_MAX),
                    lazy: true,
                    ..QueueArguments::default()
                },
            },
            retry: QueueSpec {
                name: config.retry_queue.clone(),
                kind: QueueKind::Retry,
                arguments: QueueArguments {
                    dead_letter_queue: Some(config.main_queue.clone()),
                    ..QueueArguments::default()
                },
            },
            dead_letter: QueueSpec {
                name: config.dead_letter_queue.clone(),
                kind: QueueKind::DeadLetter,
                arguments: QueueArguments {
                    message_ttl_ms: Some(config.dead_letter_ttl_ms),
                    ..QueueArguments::default()
                },
            },
        }
    }

    pub fn queues(&self) -> [&QueueSpec; 3] {
        [&self.main, &self.retry, &self.dead_letter]
    }

    pub fn find(&self, name: &str) -> Option<&QueueSpec> {
        self.queues().into_iter().find(|spec| spec.name == name)
    }

    /// Replace arguments with the ones recorded at first declaration
    pub fn with_declared(mut self, declared: &[(String, QueueArguments)]) -> Self {
        for spec in [&mut self.main, &mut self.retry, &mut self.dead_letter] {
            if let Some((_, arguments)) = declared.iter().find(|(name, _)| *name == spec.name) {
                spec.arguments = arguments.clone();
            }
        }
        self
    }
}
