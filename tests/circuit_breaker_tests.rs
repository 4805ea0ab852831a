// Circuit breaker and budget admission under a controllable clock

use chrono::{DateTime, Duration, Utc};
use merge_steward::budget::{Admission, BreakerState, BudgetController, CircuitBreaker, Denial};
use merge_steward::config::{BudgetConfig, CircuitConfig};
use std::sync::{Arc, Mutex};
use tokio_test::{assert_err, assert_ok};

fn circuit() -> CircuitConfig {
    CircuitConfig {
        rollback_threshold: 1,
        window_minutes: 10,
        cooldown_minutes: 5,
    }
}

struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Utc::now())))
    }

    fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }

    fn controller(&self, settings: BudgetConfig) -> BudgetController {
        let now = self.0.clone();
        BudgetController::with_clock(settings, Arc::new(move || *now.lock().unwrap()))
    }
}

#[test]
fn test_rollbacks_outside_the_window_do_not_trip() {
    let mut breaker = CircuitBreaker::new(circuit());
    let t0 = Utc::now();
    assert!(!breaker.record_rollback(t0));
    assert!(!breaker.record_rollback(t0 + Duration::minutes(11)));
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.record_rollback(t0 + Duration::minutes(12)));
}

#[test]
fn test_half_open_admits_a_single_probe() {
    let mut breaker = CircuitBreaker::new(circuit());
    let t0 = Utc::now();
    breaker.record_rollback(t0);
    breaker.record_rollback(t0);
    assert!(matches!(breaker.try_acquire(t0), Admission::Denied { until: Some(_) }));

    let later = t0 + Duration::minutes(6);
    assert_eq!(breaker.try_acquire(later), Admission::Probe);
    assert_eq!(breaker.try_acquire(later), Admission::Denied { until: None });

    breaker.release_probe();
    assert_eq!(breaker.try_acquire(later), Admission::Probe);
    breaker.record_probe(false, later);
    assert!(matches!(breaker.state(), BreakerState::Open { .. }));
}

#[tokio::test]
async fn test_controller_denies_until_cooldown_then_closes_after_probe() {
    let clock = TestClock::new();
    let budget = clock.controller(BudgetConfig {
        circuit: circuit(),
        ..BudgetConfig::default()
    });

    budget.record_rollback();
    budget.record_rollback();
    assert!(matches!(budget.start_run().await, Err(Denial::CircuitOpen { .. })));

    clock.advance(Duration::minutes(6));
    let probe = assert_ok!(budget.start_run().await);
    assert!(probe.is_probe());
    assert!(matches!(budget.start_run().await, Err(Denial::CircuitOpen { until: None })));

    budget.finish_probe(&probe, true);
    drop(probe);
    assert_eq!(budget.usage().breaker, BreakerState::Closed);
    let run = budget.start_run().await.unwrap();
    assert!(!run.is_probe());
}

#[tokio::test]
async fn test_exhausted_budget_refuses_new_runs_and_stages() {
    let clock = TestClock::new();
    let budget = clock.controller(BudgetConfig {
        max_oracle_calls: 2,
        ..BudgetConfig::default()
    });

    let run = assert_ok!(budget.start_run().await);
    budget.record_oracle_call();
    assert_ok!(budget.check_stage(&run));
    budget.record_oracle_call();
    assert_eq!(budget.check_stage(&run), Err(Denial::BudgetExceeded { resource: "oracle" }));
    let denial = assert_err!(budget.start_run().await);
    assert_eq!(denial, Denial::BudgetExceeded { resource: "oracle" });
}

#[tokio::test]
async fn test_cancel_all_stops_admitted_runs() {
    let clock = TestClock::new();
    let budget = clock.controller(BudgetConfig::default());
    let run = budget.start_run().await.unwrap();
    budget.cancel_all();
    assert!(run.is_cancelled());
    assert_eq!(budget.check_stage(&run), Err(Denial::Cancelled));
}
