use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open { until: DateTime<Utc> },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single run admitted after a cooldown; its outcome decides the breaker state
    Probe,
    Denied { until: Option<DateTime<Utc>> },
}

/// Trips when rollbacks inside the rolling window exceed the threshold
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: CircuitConfig,
    rollbacks: VecDeque<DateTime<Utc>>,
    state: BreakerState,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitConfig) -> Self {
        Self {
            settings,
            rollbacks: VecDeque::new(),
            state: BreakerState::Closed,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window_start = now - Duration::minutes(self.settings.window_minutes);
        while self.rollbacks.front().is_some_and(|t| *t < window_start) {
            self.rollbacks.pop_front();
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        let until = now + Duration::minutes(self.settings.cooldown_minutes);
        warn!(%until, rollbacks = self.rollbacks.len(), "Circuit breaker open");
        self.state = BreakerState::Open { until };
    }

    /// Count a rollback; returns true when this trips the breaker
    pub fn record_rollback(&mut self, now: DateTime<Utc>) -> bool {
        self.rollbacks.push_back(now);
        self.prune(now);
        match self.state {
            BreakerState::Closed if self.rollbacks.len() > self.settings.rollback_threshold => {
                self.open(now);
                true
            }
            BreakerState::HalfOpen { .. } => {
                self.open(now);
                true
            }
            _ => false,
        }
    }

    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open { until } if now >= until => {
                info!("Circuit breaker cooled down, admitting a probe");
                self.state = BreakerState::HalfOpen { probe_in_flight: true };
                Admission::Probe
            }
            BreakerState::Open { until } => Admission::Denied { until: Some(until) },
            BreakerState::HalfOpen { probe_in_flight: true } => Admission::Denied { until: None },
            BreakerState::HalfOpen { probe_in_flight: false } => {
                self.state = BreakerState::HalfOpen { probe_in_flight: true };
                Admission::Probe
            }
        }
    }

    /// Close after a successful probe, reopen after a failed one
    pub fn record_probe(&mut self, success: bool, now: DateTime<Utc>) {
        if !matches!(self.state, BreakerState::HalfOpen { .. }) {
            return;
        }
        if success {
            info!("Probe succeeded, circuit breaker closed");
            self.rollbacks.clear();
            self.state = BreakerState::Closed;
        } else {
            self.open(now);
        }
    }

    /// Give the probe slot back when the probe run never reached a verdict
    pub fn release_probe(&mut self) {
        if let BreakerState::HalfOpen { probe_in_flight: true } = self.state {
            self.state = BreakerState::HalfOpen { probe_in_flight: false };
        }
    }
}
