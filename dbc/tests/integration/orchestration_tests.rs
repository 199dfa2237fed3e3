use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dbc::events::{BuildEvent, EventBus};
use dbc::remote::{RemoteBuildMonitor, RemoteBuildMonitorConfig, RemoteBuildRequest};
use dbc::BuildOrchestrator;
use dbc_common::config::RemoteConfig;
use dbc_common::{DistributedExitCode, ExitCode, RemoteBuildMode};

use crate::common::init_test_logging;
use crate::common::mocks::{CountingSynchronizer, FakeRemoteService, TimedLocalBuild};

struct Build {
    orchestrator: BuildOrchestrator,
    remote: Arc<FakeRemoteService>,
    synchronizer: Arc<CountingSynchronizer>,
    racing: Arc<TimedLocalBuild>,
    synchronized: Arc<TimedLocalBuild>,
    events: EventBus,
}

fn build(
    remote: FakeRemoteService,
    racing: TimedLocalBuild,
    synchronized: TimedLocalBuild,
    remote_config: &RemoteConfig,
) -> Build {
    let remote = Arc::new(remote);
    let synchronizer = Arc::new(CountingSynchronizer::default());
    let racing = Arc::new(racing);
    let synchronized = Arc::new(synchronized);
    let events = EventBus::default();

    let monitor = RemoteBuildMonitor::new(
        remote.clone(),
        synchronizer.clone(),
        events.clone(),
        RemoteBuildMonitorConfig::from(remote_config),
    );
    let orchestrator = BuildOrchestrator::new(
        Arc::new(monitor),
        racing.clone(),
        synchronized.clone(),
        events.clone(),
        RemoteBuildRequest::new(remote_config.mode, vec!["//app:server".into()]),
    );
    Build {
        orchestrator,
        remote,
        synchronizer,
        racing,
        synchronized,
        events,
    }
}

fn remote_config(mode: RemoteBuildMode, kill_timeout_secs: u64) -> RemoteConfig {
    RemoteConfig {
        mode,
        kill_timeout_secs,
        ..RemoteConfig::default()
    }
}

fn statuses(rx: &mut tokio::sync::broadcast::Receiver<dbc::TimedEvent>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let BuildEvent::LocalBuildStatus { status } = event.event {
            out.push(status);
        }
    }
    out
}

#[tokio::test]
async fn test_local_build_outruns_slow_remote() {
    init_test_logging();
    crate::test_log!("TEST START: test_local_build_outruns_slow_remote");

    let config = remote_config(RemoteBuildMode::NoWaitForRemote, 1);
    let b = build(
        FakeRemoteService::new(Duration::from_millis(200), DistributedExitCode::Successful),
        TimedLocalBuild::new(Duration::from_millis(20), ExitCode::Success),
        TimedLocalBuild::new(Duration::ZERO, ExitCode::BuildError),
        &config,
    );
    let mut rx = b.events.subscribe();

    let code = b.orchestrator.build(config.mode, config.local_fallback).await;

    assert_eq!(code, Some(ExitCode::Success));
    assert_eq!(b.synchronized.runs(), 0);
    // The slow remote still finishes within the kill timeout and success wins.
    assert_eq!(b.orchestrator.remote_exit_code(), DistributedExitCode::Successful);
    assert_eq!(b.remote.terminations().len(), 1);
    assert_eq!(b.synchronizer.calls.load(Ordering::SeqCst), 1);
    assert!(statuses(&mut rx).iter().any(|s| s == "racing"));

    crate::test_log!("TEST PASS: test_local_build_outruns_slow_remote");
}

#[tokio::test]
async fn test_fast_remote_hands_over_to_synchronized_build() {
    init_test_logging();

    let config = remote_config(RemoteBuildMode::NoWaitForRemote, 1);
    let b = build(
        FakeRemoteService::new(Duration::from_millis(10), DistributedExitCode::Successful),
        TimedLocalBuild::new(Duration::from_secs(10), ExitCode::Success),
        TimedLocalBuild::new(Duration::from_millis(5), ExitCode::Success),
        &config,
    );
    let mut rx = b.events.subscribe();

    let code = b.orchestrator.build(config.mode, true).await;

    assert_eq!(code, Some(ExitCode::Success));
    assert_eq!(b.racing.runs(), 1);
    assert_eq!(b.synchronized.runs(), 1);
    assert!(b.remote.terminations().is_empty());
    assert_eq!(
        statuses(&mut rx),
        vec!["racing".to_string(), "synchronized build".to_string()]
    );
}

#[tokio::test]
async fn test_failed_remote_without_fallback_defers_to_remote_result() {
    init_test_logging();

    let config = RemoteConfig {
        local_fallback: false,
        ..remote_config(RemoteBuildMode::NoWaitForRemote, 1)
    };
    let b = build(
        FakeRemoteService::new(Duration::from_millis(5), DistributedExitCode::MinionAllocationFailed),
        TimedLocalBuild::new(Duration::from_secs(10), ExitCode::Success),
        TimedLocalBuild::new(Duration::ZERO, ExitCode::Success),
        &config,
    );
    let mut rx = b.events.subscribe();

    let code = b.orchestrator.build(config.mode, config.local_fallback).await;

    assert_eq!(code, None);
    assert_eq!(
        b.orchestrator.remote_exit_code(),
        DistributedExitCode::MinionAllocationFailed
    );
    assert_eq!(b.synchronized.runs(), 0);

    let mut console_errors = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event.event, BuildEvent::ConsoleError { .. }) {
            console_errors += 1;
        }
    }
    assert_eq!(console_errors, 1);
}

#[tokio::test]
async fn test_divergence_check_reports_remote_status() {
    init_test_logging();

    let config = remote_config(RemoteBuildMode::RuleKeyDivergenceCheck, 1);
    let b = build(
        FakeRemoteService::new(Duration::ZERO, DistributedExitCode::Successful),
        TimedLocalBuild::new(Duration::ZERO, ExitCode::BuildError),
        TimedLocalBuild::new(Duration::ZERO, ExitCode::BuildError),
        &config,
    );

    let code = b.orchestrator.build(config.mode, true).await;
    assert_eq!(code, Some(ExitCode::Success));
    assert_eq!(b.racing.runs() + b.synchronized.runs(), 0);
}
