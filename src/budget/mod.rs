//! Budget and circuit control
//!
//! Every pipeline stage asks the controller before it starts. Ceilings are
//! cumulative within a budget window of `window_hours`: once oracle calls or
//! execution minutes run out, no new stage starts until the window rolls
//! over or [`BudgetController::reset`] is called.

mod breaker;

pub use breaker::{Admission, BreakerState, CircuitBreaker};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::BudgetConfig;
use crate::observability::pipeline_metrics;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Why a run or stage may not proceed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    BudgetExceeded { resource: &'static str },
    CircuitOpen { until: Option<DateTime<Utc>> },
    Cancelled,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::BudgetExceeded { resource } => write!(f, "{resource} budget exhausted"),
            Denial::CircuitOpen { until: Some(until) } => write!(f, "circuit breaker open until {until}"),
            Denial::CircuitOpen { until: None } => f.write_str("circuit breaker probe in flight"),
            Denial::Cancelled => f.write_str("run cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetUsage {
    pub oracle_calls: u64,
    pub max_oracle_calls: u64,
    pub execution_minutes: f64,
    pub max_execution_minutes: u64,
    pub active_runs: usize,
    pub breaker: BreakerState,
}

/// Cooperative cancellation flag shared between a run and its controller
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Admission ticket for one pipeline run. Holds a concurrency permit.
#[derive(Debug)]
pub struct RunGuard {
    _permit: OwnedSemaphorePermit,
    cancel: CancelHandle,
    probe: bool,
}

impl RunGuard {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

pub struct BudgetController {
    settings: BudgetConfig,
    oracle_calls: AtomicU64,
    execution_ms: AtomicU64,
    semaphore: Arc<Semaphore>,
    breaker: Mutex<CircuitBreaker>,
    runs: Mutex<Vec<CancelHandle>>,
    window_started: Mutex<DateTime<Utc>>,
    clock: Clock,
}

impl BudgetController {
    pub fn new(settings: BudgetConfig) -> Self {
        Self::with_clock(settings, Arc::new(Utc::now))
    }

    pub fn with_clock(settings: BudgetConfig, clock: Clock) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_pipelines.max(1)));
        let breaker = Mutex::new(CircuitBreaker::new(settings.circuit.clone()));
        let window_started = Mutex::new(clock());
        Self {
            settings,
            oracle_calls: AtomicU64::new(0),
            execution_ms: AtomicU64::new(0),
            semaphore,
            breaker,
            runs: Mutex::new(Vec::new()),
            window_started,
            clock,
        }
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Zero the oracle and execution counters and start a new window. The
    /// breaker keeps its state.
    pub fn reset(&self) {
        self.oracle_calls.store(0, Ordering::SeqCst);
        self.execution_ms.store(0, Ordering::SeqCst);
        *self.window_started.lock().unwrap_or_else(|p| p.into_inner()) = self.now();
        info!("Budget counters reset");
    }

    fn replenish(&self) {
        if self.settings.window_hours == 0 {
            return;
        }
        let now = self.now();
        let started = *self.window_started.lock().unwrap_or_else(|p| p.into_inner());
        let window = chrono::Duration::hours(self.settings.window_hours.min(87_600) as i64);
        if now - started >= window {
            debug!(%started, "Budget window elapsed");
            self.reset();
        }
    }

    /// The first exhausted ceiling, if any
    pub fn exhausted(&self) -> Option<Denial> {
        self.replenish();
        if self.oracle_calls.load(Ordering::SeqCst) >= self.settings.max_oracle_calls {
            return Some(Denial::BudgetExceeded { resource: "oracle" });
        }
        if self.execution_ms.load(Ordering::SeqCst) >= self.settings.max_execution_minutes * 60_000 {
            return Some(Denial::BudgetExceeded { resource: "execution" });
        }
        None
    }

    /// Admit a new pipeline run, waiting for a concurrency slot
    pub async fn start_run(&self) -> Result<RunGuard, Denial> {
        if let Some(denial) = self.exhausted() {
            return Err(denial);
        }
        let probe = match self.breaker().try_acquire(self.now()) {
            Admission::Allowed => false,
            Admission::Probe => true,
            Admission::Denied { until } => return Err(Denial::CircuitOpen { until }),
        };

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                if probe {
                    self.breaker().release_probe();
                }
                return Err(Denial::Cancelled);
            }
        };

        let cancel = CancelHandle::default();
        {
            let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
            runs.retain(|handle| Arc::strong_count(&handle.0) > 1);
            runs.push(cancel.clone());
        }
        debug!(probe, available = self.semaphore.available_permits(), "Pipeline run admitted");
        Ok(RunGuard {
            _permit: permit,
            cancel,
            probe,
        })
    }

    /// Gate at a stage boundary
    pub fn check_stage(&self, guard: &RunGuard) -> Result<(), Denial> {
        if guard.is_cancelled() {
            return Err(Denial::Cancelled);
        }
        match self.exhausted() {
            Some(denial) => Err(denial),
            None => Ok(()),
        }
    }

    pub fn record_oracle_call(&self) {
        self.oracle_calls.fetch_add(1, Ordering::SeqCst);
        pipeline_metrics().record_oracle_call();
    }

    pub fn record_execution(&self, duration_ms: u64) {
        self.execution_ms.fetch_add(duration_ms, Ordering::SeqCst);
    }

    pub fn record_rollback(&self) {
        pipeline_metrics().record_rollback();
        let now = self.now();
        if self.breaker().record_rollback(now) {
            warn!("Rollback frequency tripped the circuit breaker");
        }
    }

    /// Report how a probe run ended
    pub fn finish_probe(&self, guard: &RunGuard, success: bool) {
        if guard.is_probe() {
            let now = self.now();
            self.breaker().record_probe(success, now);
        }
    }

    /// Give the probe slot back without a verdict
    pub fn abandon_probe(&self, guard: &RunGuard) {
        if guard.is_probe() {
            self.breaker().release_probe();
        }
    }

    /// Ask every admitted run to stop at its next stage boundary
    pub fn cancel_all(&self) {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        for handle in runs.iter() {
            handle.cancel();
        }
    }

    pub fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            oracle_calls: self.oracle_calls.load(Ordering::SeqCst),
            max_oracle_calls: self.settings.max_oracle_calls,
            execution_minutes: self.execution_ms.load(Ordering::SeqCst) as f64 / 60_000.0,
            max_execution_minutes: self.settings.max_execution_minutes,
            active_runs: self.settings.max_concurrent_pipelines.max(1) - self.semaphore.available_permits(),
            breaker: self.breaker().state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use chrono::Duration;

    fn settings() -> BudgetConfig {
        BudgetConfig {
            max_oracle_calls: 3,
            max_execution_minutes: 1,
            window_hours: 1,
            max_concurrent_pipelines: 2,
            circuit: CircuitConfig {
                rollback_threshold: 1,
                window_minutes: 60,
                cooldown_minutes: 10,
            },
        }
    }

    #[tokio::test]
    async fn test_oracle_ceiling_denies_stage_entry() {
        let controller = BudgetController::new(settings());
        let guard = controller.start_run().await.unwrap();
        for _ in 0..3 {
            assert!(controller.check_stage(&guard).is_ok());
            controller.record_oracle_call();
        }
        assert_eq!(
            controller.check_stage(&guard),
            Err(Denial::BudgetExceeded { resource: "oracle" })
        );
        assert!(controller.start_run().await.is_err());
    }

    #[tokio::test]
    async fn test_execution_minutes_are_cumulative() {
        let controller = BudgetController::new(settings());
        controller.record_execution(30_000);
        assert!(controller.exhausted().is_none());
        controller.record_execution(30_000);
        assert_eq!(
            controller.exhausted(),
            Some(Denial::BudgetExceeded { resource: "execution" })
        );
    }

    #[tokio::test]
    async fn test_exhausted_ceilings_refill_when_the_window_rolls_over() {
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock_now = now.clone();
        let controller = BudgetController::with_clock(settings(), Arc::new(move || *clock_now.lock().unwrap()));
        for _ in 0..3 {
            controller.record_oracle_call();
        }
        controller.record_execution(60_000);
        assert!(controller.start_run().await.is_err());

        let later = *now.lock().unwrap() + Duration::minutes(61);
        *now.lock().unwrap() = later;
        assert!(controller.exhausted().is_none());
        assert!(controller.start_run().await.is_ok());
        assert_eq!(controller.usage().oracle_calls, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_counters_but_not_the_breaker() {
        let controller = BudgetController::new(BudgetConfig {
            window_hours: 0,
            ..settings()
        });
        for _ in 0..3 {
            controller.record_oracle_call();
        }
        controller.record_rollback();
        controller.record_rollback();
        assert!(controller.exhausted().is_some());

        controller.reset();
        assert!(controller.exhausted().is_none());
        assert!(matches!(
            controller.start_run().await,
            Err(Denial::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_is_seen_at_next_stage() {
        let controller = BudgetController::new(settings());
        let guard = controller.start_run().await.unwrap();
        controller.cancel_all();
        assert_eq!(controller.check_stage(&guard), Err(Denial::Cancelled));
    }

    #[tokio::test]
    async fn test_breaker_admits_one_probe_after_cooldown() {
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock_now = now.clone();
        let controller = BudgetController::with_clock(settings(), Arc::new(move || *clock_now.lock().unwrap()));

        controller.record_rollback();
        controller.record_rollback();
        assert!(matches!(
            controller.start_run().await,
            Err(Denial::CircuitOpen { .. })
        ));

        let later = *now.lock().unwrap() + Duration::minutes(11);
        *now.lock().unwrap() = later;
        let probe = controller.start_run().await.unwrap();
        assert!(probe.is_probe());
        assert!(matches!(
            controller.start_run().await,
            Err(Denial::CircuitOpen { until: None })
        ));

        controller.finish_probe(&probe, true);
        let normal = controller.start_run().await.unwrap();
        assert!(!normal.is_probe());
    }
}
