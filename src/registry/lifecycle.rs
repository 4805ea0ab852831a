use serde::{Deserialize, Serialize};
use statig::prelude::*;

use super::types::{ChangeSetId, ChangeSetStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// Completion heuristic re-evaluated
    Assessed { score: f64, complete: bool },
    /// New commits appeared on the branch
    Activity,
    /// No activity for longer than the staleness ceiling
    Idle,
    /// Content landed on the integration branch
    Resolved,
    /// Delivered content was reverted
    RolledBack,
    Failed { reason: String },
}

/// Lifecycle of one change set. Status mirrors the active state.
pub struct ChangeSetLifecycle {
    pub id: ChangeSetId,
    pub status: ChangeSetStatus,
    pub completion_score: f64,
    pub failure_reason: Option<String>,
}

impl ChangeSetLifecycle {
    pub fn new(id: ChangeSetId) -> Self {
        Self {
            id,
            status: ChangeSetStatus::Pending,
            completion_score: 0.0,
            failure_reason: None,
        }
    }

    pub fn status(&self) -> ChangeSetStatus {
        self.status
    }

    fn enter(&mut self, status: ChangeSetStatus) {
        tracing::info!(
            change_set = %self.id,
            from = %self.status,
            to = %status,
            "Change set status changed"
        );
        self.status = status;
    }
}

#[state_machine(initial = "State::pending()")]
impl ChangeSetLifecycle {
    #[state]
    fn pending(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Assessed { score, complete } => {
                self.completion_score = *score;
                if *complete {
                    self.enter(ChangeSetStatus::Complete);
                    Transition(State::complete())
                } else {
                    Handled
                }
            }
            LifecycleEvent::Idle => {
                self.enter(ChangeSetStatus::Stale);
                Transition(State::stale())
            }
            LifecycleEvent::Resolved => {
                self.enter(ChangeSetStatus::Resolved);
                Transition(State::resolved())
            }
            LifecycleEvent::Failed { reason } => {
                self.failure_reason = Some(reason.clone());
                self.enter(ChangeSetStatus::Failed);
                Transition(State::failed())
            }
            _ => Handled,
        }
    }

    #[state]
    fn complete(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Assessed { score, .. } => {
                self.completion_score = *score;
                Handled
            }
            LifecycleEvent::Activity => {
                self.enter(ChangeSetStatus::Pending);
                Transition(State::pending())
            }
            LifecycleEvent::Resolved => {
                self.enter(ChangeSetStatus::Resolved);
                Transition(State::resolved())
            }
            LifecycleEvent::Failed { reason } => {
                self.failure_reason = Some(reason.clone());
                self.enter(ChangeSetStatus::Failed);
                Transition(State::failed())
            }
            _ => Handled,
        }
    }

    #[state]
    fn stale(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Activity => {
                self.enter(ChangeSetStatus::Pending);
                Transition(State::pending())
            }
            LifecycleEvent::Resolved => {
                self.enter(ChangeSetStatus::Resolved);
                Transition(State::resolved())
            }
            _ => Handled,
        }
    }

    #[state]
    fn resolved(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::RolledBack => {
                self.failure_reason = Some("delivered content was rolled back".to_string());
                self.enter(ChangeSetStatus::Failed);
                Transition(State::failed())
            }
            _ => Handled,
        }
    }

    #[state]
    fn failed(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Activity => {
                self.failure_reason = None;
                self.enter(ChangeSetStatus::Pending);
                Transition(State::pending())
            }
            LifecycleEvent::Resolved => {
                self.failure_reason = None;
                self.enter(ChangeSetStatus::Resolved);
                Transition(State::resolved())
            }
            _ => Handled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> statig::blocking::StateMachine<ChangeSetLifecycle> {
        ChangeSetLifecycle::new(ChangeSetId::new("cs-1")).state_machine()
    }

    #[test]
    fn test_completion_moves_pending_to_complete() {
        let mut sm = machine();
        sm.handle(&LifecycleEvent::Assessed { score: 0.4, complete: false });
        assert_eq!(sm.inner().status(), ChangeSetStatus::Pending);

        sm.handle(&LifecycleEvent::Assessed { score: 0.95, complete: true });
        assert_eq!(sm.inner().status(), ChangeSetStatus::Complete);
        assert_eq!(sm.inner().completion_score, 0.95);
    }

    #[test]
    fn test_stale_revives_on_activity() {
        let mut sm = machine();
        sm.handle(&LifecycleEvent::Idle);
        assert_eq!(sm.inner().status(), ChangeSetStatus::Stale);

        sm.handle(&LifecycleEvent::Assessed { score: 1.0, complete: true });
        assert_eq!(sm.inner().status(), ChangeSetStatus::Stale);

        sm.handle(&LifecycleEvent::Activity);
        assert_eq!(sm.inner().status(), ChangeSetStatus::Pending);
    }

    #[test]
    fn test_rollback_fails_resolved_change_set() {
        let mut sm = machine();
        sm.handle(&LifecycleEvent::Assessed { score: 1.0, complete: true });
        sm.handle(&LifecycleEvent::Resolved);
        assert_eq!(sm.inner().status(), ChangeSetStatus::Resolved);

        sm.handle(&LifecycleEvent::Activity);
        assert_eq!(sm.inner().status(), ChangeSetStatus::Resolved);

        sm.handle(&LifecycleEvent::RolledBack);
        assert_eq!(sm.inner().status(), ChangeSetStatus::Failed);
        assert!(sm.inner().failure_reason.is_some());
    }
}
