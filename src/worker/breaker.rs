/// Process-wide circuit breaker
///
/// Closed: work flows, consecutive failures are counted. After
/// `failure_threshold` of them the breaker opens and the worker stops taking
/// new messages for `reset_timeout`. Then it half-opens: work flows again and
/// `success_threshold` consecutive successes close it, while any failure
/// reopens it.

use crate::config::BreakerConfig;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { successes: u32 },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // state stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether new work may start. Moves an expired Open breaker to HalfOpen.
    pub fn allow_request(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } | Inner::HalfOpen { .. } => true,
            Inner::Open { until } => {
                if Instant::now() >= until {
                    tracing::info!("🔌 Circuit breaker half-open; probing");
                    *inner = Inner::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.lock();
        match *inner {
            Inner::Closed { .. } => *inner = Inner::Closed { failures: 0 },
            Inner::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    tracing::info!("✅ Circuit breaker closed after {} successful probe(s)", successes);
                    *inner = Inner::Closed { failures: 0 };
                } else {
                    *inner = Inner::HalfOpen { successes };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let mut inner = self.lock();
        let until = Instant::now() + self.config.reset_timeout();
        match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    tracing::error!(
                        "🚨 Circuit breaker opened after {} consecutive failures; pausing for {:?}",
                        failures,
                        self.config.reset_timeout()
                    );
                    *inner = Inner::Open { until };
                } else {
                    *inner = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen { .. } => {
                tracing::error!("🚨 Probe failed; circuit breaker reopened");
                *inner = Inner::Open { until };
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}
