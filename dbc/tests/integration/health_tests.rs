use std::sync::Arc;

use dbc::health::{HealthTrackerConfig, MinionHealthTracker};
use dbc_common::config::HealthConfig;
use dbc_common::{MinionId, MockClock, RunId};

use crate::common::init_test_logging;

#[test]
fn test_coordinator_poll_loop_detects_restarted_minion() {
    init_test_logging();
    crate::test_log!("TEST START: test_coordinator_poll_loop_detects_restarted_minion");

    let clock = MockClock::new(0);
    let config = HealthTrackerConfig::from(&HealthConfig {
        max_silence_ms: 500,
        slow_heartbeat_warning_ms: 1_000,
        max_consecutive_slow_checks: 3,
    });
    let tracker = MinionHealthTracker::new(config, Arc::new(clock.clone()));
    let (m1, m2) = (MinionId::new("m1"), MinionId::new("m2"));

    tracker.report_alive(&m1, &RunId::new("run-a"));
    tracker.report_alive(&m2, &RunId::new("run-a"));

    for now in (100..=400).step_by(100) {
        clock.set(now);
        tracker.report_alive(&m2, &RunId::new("run-a"));
        let snapshot = tracker.check_health();
        assert!(snapshot.dead.is_empty(), "no minion is silent yet at {now}");
    }

    clock.set(600);
    tracker.report_alive(&m2, &RunId::new("run-a"));
    let snapshot = tracker.check_health();
    assert!(snapshot.is_dead(&m1));
    assert!(snapshot.is_alive(&m2));

    clock.set(650);
    tracker.report_alive(&m1, &RunId::new("run-b"));
    clock.set(700);
    let snapshot = tracker.check_health();
    assert!(snapshot.is_alive(&m1));
    assert!(snapshot.is_alive(&m2));

    tracker.stop_tracking_forever(&m2);
    clock.set(5_000);
    let snapshot = tracker.check_health();
    assert!(!snapshot.is_alive(&m2) && !snapshot.is_dead(&m2));
    assert_eq!(tracker.retired_minions(), 1);

    crate::test_log!("TEST PASS: test_coordinator_poll_loop_detects_restarted_minion");
}
