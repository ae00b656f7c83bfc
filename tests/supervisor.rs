#![cfg(unix)]

mod common;

use std::{sync::Arc, time::Duration};

use common::*;
use serverkeep::{
    ErrorKind, InstanceId, LifecycleState, ManagedInstance, MemoryRepository,
    config::{LogSettings, SupervisorSettings},
    error::ServerError,
    instance::{LaunchSpec, Supervisor},
    log::{LogBroadcaster, LogEvent, LogSource},
};

fn supervisor_with(
    instances: Vec<ManagedInstance>,
    settings: SupervisorSettings,
) -> (Supervisor, Arc<MemoryRepository>) {
    let repository = Arc::new(MemoryRepository::with_instances(instances));
    let supervisor = Supervisor::new(
        repository.clone(),
        LogBroadcaster::new(LogSettings::default()),
        settings,
    );
    (supervisor, repository)
}

/// Last recorded state, polled until it equals `wanted` or the wait runs out.
async fn persisted(
    repository: &MemoryRepository,
    id: &InstanceId,
    wanted: LifecycleState,
) -> Option<LifecycleState> {
    let mut state = None;
    for _ in 0..200 {
        state = repository.state(id).await;
        if state == Some(wanted) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    state
}

#[tokio::test]
async fn never_started_instance_is_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "idle", POLITE_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    assert!(!supervisor.is_running(&id));
    assert_eq!(supervisor.state(&id), LifecycleState::Stopped);
    assert!(matches!(
        supervisor.stop(&id, Duration::from_secs(1)).await,
        Err(ServerError::NotRunning(_))
    ));
    assert!(matches!(
        supervisor.send_command(&id, "list").await,
        Err(ServerError::NotRunning(_))
    ));
    assert!(matches!(
        supervisor.kill(&id).await,
        Err(ServerError::NotRunning(_))
    ));
}

#[tokio::test]
async fn start_becomes_running_and_stops_politely() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "lobby", POLITE_SERVER);
    let id = inst.id.clone();
    let (supervisor, repository) = supervisor_with(vec![inst], fast_supervisor());

    let state_rx = supervisor.watch_state(&id);
    supervisor.start(&id).await.unwrap();
    assert!(supervisor.is_running(&id));
    wait_for_state(state_rx, LifecycleState::Running).await;
    assert_eq!(
        persisted(&repository, &id, LifecycleState::Running).await,
        Some(LifecycleState::Running)
    );

    let err = supervisor.start(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

    let report = supervisor.stop(&id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(report.state, LifecycleState::Stopped);
    assert_eq!(report.code, Some(0));
    assert!(!supervisor.is_running(&id));
    assert_eq!(supervisor.state(&id), LifecycleState::Stopped);
    assert_eq!(
        persisted(&repository, &id, LifecycleState::Stopped).await,
        Some(LifecycleState::Stopped)
    );

    let lines = supervisor.logs_since(&id, 100);
    assert!(
        lines
            .iter()
            .any(|l| l.source == LogSource::Command && l.text == "> stop")
    );
    assert!(lines.iter().any(|l| l.text.contains("Stopping server")));
}

#[tokio::test]
async fn concurrent_starts_admit_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "race", POLITE_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    let (a, b) = tokio::join!(supervisor.start(&id), supervisor.start(&id));
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .any(|r| matches!(r, Err(ServerError::AlreadyRunning(_))))
    );

    supervisor.kill(&id).await.unwrap();
    assert!(!supervisor.is_running(&id));
}

#[tokio::test]
async fn stop_passes_through_stopping_and_kills_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "stubborn", STUBBORN_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    supervisor.start(&id).await.unwrap();
    wait_for_state(supervisor.watch_state(&id), LifecycleState::Running).await;

    let ticket = supervisor
        .request_stop(&id, Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(supervisor.state(&id), LifecycleState::Stopping);
    assert!(supervisor.is_running(&id));

    let report = ticket.wait(Duration::from_secs(10)).await.unwrap();
    assert_eq!(report.state, LifecycleState::Stopped);
    assert_ne!(report.code, Some(0));
    assert!(!supervisor.is_running(&id));
    assert_eq!(supervisor.state(&id), LifecycleState::Stopped);
}

#[tokio::test]
async fn kill_timer_fires_without_a_waiter() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "abandoned", STUBBORN_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    supervisor.start(&id).await.unwrap();
    wait_for_state(supervisor.watch_state(&id), LifecycleState::Running).await;

    let stopped = supervisor.watch_state(&id);
    drop(
        supervisor
            .request_stop(&id, Duration::from_millis(200))
            .await
            .unwrap(),
    );
    wait_for_state(stopped, LifecycleState::Stopped).await;
    assert!(!supervisor.is_running(&id));
}

#[tokio::test]
async fn nonzero_exit_ends_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "crashy", CRASHING_SERVER);
    let id = inst.id.clone();
    let (supervisor, repository) = supervisor_with(vec![inst], fast_supervisor());

    let state_rx = supervisor.watch_state(&id);
    supervisor.start(&id).await.unwrap();
    wait_for_state(state_rx, LifecycleState::Error).await;
    assert!(eventually(|| !supervisor.is_running(&id)).await);
    assert!(matches!(
        supervisor.send_command(&id, "list").await,
        Err(ServerError::NotRunning(_))
    ));
    assert_eq!(
        persisted(&repository, &id, LifecycleState::Error).await,
        Some(LifecycleState::Error)
    );
}

#[tokio::test]
async fn reported_crash_with_clean_exit_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "tickloop", CRASH_REPORT_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    let state_rx = supervisor.watch_state(&id);
    supervisor.start(&id).await.unwrap();
    wait_for_state(state_rx, LifecycleState::Error).await;

    let lines = supervisor.logs_since(&id, 10);
    assert!(
        lines
            .iter()
            .any(|l| l.event == Some(LogEvent::CrashDetected))
    );
}

#[tokio::test]
async fn commands_are_logged_and_players_tracked() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "players", POLITE_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    supervisor.start(&id).await.unwrap();
    wait_for_state(supervisor.watch_state(&id), LifecycleState::Running).await;

    supervisor.send_command(&id, "join").await.unwrap();
    supervisor.send_command(&id, "list").await.unwrap();

    assert!(
        eventually(|| {
            let snapshot = supervisor.snapshot(&id);
            snapshot.online.contains("Steve") && snapshot.player_count == Some(1)
        })
        .await
    );
    let snapshot = supervisor.snapshot(&id);
    assert_eq!(snapshot.state, LifecycleState::Running);
    assert_eq!(snapshot.max_players, Some(20));
    assert!(snapshot.pid.is_some());

    let lines = supervisor.logs_since(&id, 100);
    assert!(
        lines
            .iter()
            .any(|l| l.source == LogSource::Command && l.text == "> join")
    );
    assert!(lines.iter().any(|l| {
        l.event
            == Some(LogEvent::PlayerJoined {
                name: "Steve".into(),
            })
    }));

    supervisor.stop_default(&id).await.unwrap();
}

#[tokio::test]
async fn restart_replaces_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "again", POLITE_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    // Restart of a stopped instance simply starts it.
    supervisor.restart(&id).await.unwrap();
    wait_for_state(supervisor.watch_state(&id), LifecycleState::Running).await;
    let first = supervisor.snapshot(&id).pid;

    supervisor.restart(&id).await.unwrap();
    wait_for_state(supervisor.watch_state(&id), LifecycleState::Running).await;
    let second = supervisor.snapshot(&id).pid;
    assert!(first.is_some() && second.is_some());
    assert_ne!(first, second);

    supervisor.stop_default(&id).await.unwrap();
}

#[tokio::test]
async fn missing_executable_and_unknown_instance() {
    let dir = tempfile::tempdir().unwrap();
    let mut inst = script_instance(dir.path(), "broken", POLITE_SERVER);
    inst.launch = LaunchSpec::Executable {
        program: "does-not-exist.sh".into(),
        args: Vec::new(),
    };
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    let err = supervisor.start(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutableMissing);
    assert!(!supervisor.is_running(&id));

    let err = supervisor.start(&InstanceId::new("ghost")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownInstance);
}

/// Sends large commands to a process that never reads them until a write
/// stalls, which leaves the pipe full.
async fn jam_input(supervisor: &Supervisor, id: &InstanceId) {
    let filler = "x".repeat(4096);
    for _ in 0..40 {
        if let Err(err) = supervisor.send_command(id, &filler).await {
            assert!(matches!(err, ServerError::InputStalled(_)));
            assert_eq!(err.kind(), ErrorKind::Timeout);
            return;
        }
    }
    panic!("process input never filled up");
}

#[tokio::test]
async fn stop_kills_a_process_that_stopped_reading_input() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "deaf", DEAF_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    supervisor.start(&id).await.unwrap();
    wait_for_state(supervisor.watch_state(&id), LifecycleState::Running).await;
    jam_input(&supervisor, &id).await;

    let report = tokio::time::timeout(
        Duration::from_secs(4),
        supervisor.stop(&id, Duration::from_millis(200)),
    )
    .await
    .expect("stop returns although the stop command cannot be written")
    .unwrap();
    assert_eq!(report.state, LifecycleState::Stopped);
    assert!(!supervisor.is_running(&id));
    assert_eq!(supervisor.state(&id), LifecycleState::Stopped);
}

#[tokio::test]
async fn abandoned_stop_still_kills_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "deaf", DEAF_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    supervisor.start(&id).await.unwrap();
    wait_for_state(supervisor.watch_state(&id), LifecycleState::Running).await;
    jam_input(&supervisor, &id).await;

    let stopped = supervisor.watch_state(&id);
    let gave_up = tokio::time::timeout(
        Duration::from_millis(50),
        supervisor.stop(&id, Duration::from_millis(300)),
    )
    .await;
    assert!(gave_up.is_err());
    assert_eq!(supervisor.state(&id), LifecycleState::Stopping);

    wait_for_state(stopped, LifecycleState::Stopped).await;
    assert!(!supervisor.is_running(&id));
}

#[tokio::test]
async fn held_instance_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "held", POLITE_SERVER);
    let id = inst.id.clone();
    let (supervisor, _) = supervisor_with(vec![inst], fast_supervisor());

    let hold = supervisor.hold(&id).unwrap();
    assert!(supervisor.is_held(&id));
    let err = supervisor.start(&id).await.unwrap_err();
    assert!(matches!(err, ServerError::InMaintenance(_)));
    assert_eq!(err.kind(), ErrorKind::InstanceBusy);
    assert!(matches!(
        supervisor.hold(&id),
        Err(ServerError::InMaintenance(_))
    ));
    assert!(!supervisor.is_running(&id));
    assert_eq!(supervisor.state(&id), LifecycleState::Stopped);

    drop(hold);
    assert!(!supervisor.is_held(&id));
    supervisor.start(&id).await.unwrap();
    assert!(matches!(
        supervisor.hold(&id),
        Err(ServerError::AlreadyRunning(_))
    ));

    supervisor.stop_default(&id).await.unwrap();
}
