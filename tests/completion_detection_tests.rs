// Completion detection: several independent signals must agree before a
// change set is handed to clustering

use chrono::{DateTime, Duration, Utc};
use merge_steward::config::{CompletionConfig, StewardConfig};
use merge_steward::registry::{ChangeSetHint, CompletionDetector, CompletionSignal};
use merge_steward::vcs::{CommitInfo, Revision};

fn detector() -> CompletionDetector {
    CompletionDetector::new(&CompletionConfig::default()).unwrap()
}

fn commit(message: &str, at: DateTime<Utc>) -> CommitInfo {
    CommitInfo {
        id: Revision::new("abc123"),
        message: message.to_string(),
        author: "worker".to_string(),
        timestamp: at,
    }
}

fn hint(marker: bool, tests_passed: Option<bool>) -> ChangeSetHint {
    let mut hint = ChangeSetHint::for_branch("agent/feature");
    hint.completion_marker = marker;
    hint.tests_passed = tests_passed;
    hint
}

#[test]
fn test_marker_and_passing_tests_complete_a_change_set() {
    let now = Utc::now();
    let d = detector();
    let signals = d.collect_signals(&hint(true, Some(true)), &[commit("wip", now)], now, now);
    assert_eq!(signals, vec![CompletionSignal::ExplicitMarker, CompletionSignal::TestsPassing]);

    let assessment = d.assess(signals, now, now);
    assert!(assessment.complete);
    assert!(!assessment.stale);
}

#[test]
fn test_no_single_signal_is_sufficient() {
    let now = Utc::now();
    let d = detector();
    let quiet = now - Duration::hours(2);

    for (hint, commits, last_activity) in [
        (hint(true, None), vec![commit("wip", now)], now),
        (hint(false, Some(true)), vec![commit("wip", now)], now),
        (hint(false, None), vec![commit("done: add parser", now)], now),
        (hint(false, None), vec![commit("wip", quiet)], quiet),
    ] {
        let signals = d.collect_signals(&hint, &commits, last_activity, now);
        assert_eq!(signals.len(), 1, "{signals:?}");
        assert!(!d.assess(signals, last_activity, now).complete);
    }
}

#[test]
fn test_three_weak_signals_together_complete() {
    let now = Utc::now();
    let last = now - Duration::minutes(90);
    let d = detector();

    let signals = d.collect_signals(&hint(false, Some(true)), &[commit("Ready: parser\n\nbody", last)], last, now);
    assert_eq!(signals.len(), 3);
    assert!(matches!(&signals[1], CompletionSignal::CommitConvention { message } if message == "Ready: parser"));
    assert!(matches!(signals[2], CompletionSignal::Inactivity { idle_minutes: 90 }));
    assert!(d.assess(signals, last, now).complete);
}

#[test]
fn test_duplicate_signals_count_once() {
    let d = detector();
    let score = d.score(&[
        CompletionSignal::ExplicitMarker,
        CompletionSignal::ExplicitMarker,
        CompletionSignal::ExplicitMarker,
    ]);
    assert!((score - CompletionConfig::default().explicit_marker_weight).abs() < f64::EPSILON);
}

#[test]
fn test_long_quiet_change_set_is_stale() {
    let now = Utc::now();
    let last = now - Duration::hours(30);
    let d = detector();
    let signals = d.collect_signals(&hint(false, Some(false)), &[], last, now);
    let assessment = d.assess(signals, last, now);
    assert!(assessment.stale);
    assert!(!assessment.complete);
}

#[test]
fn test_weights_that_let_one_signal_complete_are_rejected() {
    let mut settings = StewardConfig::default();
    settings.completion.tests_passing_weight = settings.completion.threshold;
    assert!(settings.validate().is_err());
}
