mod common;

use std::sync::Arc;

use common::*;
use serverkeep::{
    CommandReply, Core, CoreConfig, ErrorKind, InstanceId, LifecycleState, ManagedInstance,
    MemoryRepository, Repository, instance::LaunchSpec, log::LogSource,
};

fn core_with(instances: Vec<ManagedInstance>) -> Core {
    let mut config = CoreConfig::default();
    config.supervisor = fast_supervisor();
    Core::new(&config, Arc::new(MemoryRepository::with_instances(instances))).unwrap()
}

#[tokio::test]
async fn unsupervised_instance_without_rcon_is_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let inst = script_instance(dir.path(), "offline", POLITE_SERVER);
    let id = inst.id.clone();
    let core = core_with(vec![inst]);

    let err = core.send_command(&id, "list").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);

    let err = core.rcon(&id, "list").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
    assert!(core.logs(&id, 10).is_empty());
}

#[tokio::test]
async fn unsupervised_instance_with_rcon_is_relayed() {
    let (addr, _) = spawn_rcon_server().await;
    let dir = tempfile::tempdir().unwrap();
    let inst = rcon_instance(dir.path(), "remote", addr, "secret");
    let id = inst.id.clone();
    let core = core_with(vec![inst]);

    let reply = core.send_command(&id, "list").await.unwrap();
    assert_eq!(reply, CommandReply::Rcon("echo: list".to_string()));

    let lines = core.logs(&id, 10);
    let texts: Vec<_> = lines
        .iter()
        .filter(|l| l.source == LogSource::Rcon)
        .map(|l| l.text.as_str())
        .collect();
    assert_eq!(texts, vec!["> list", "echo: list"]);
    assert!(lines.windows(2).all(|w| w[0].seq < w[1].seq));

    assert!(core.disconnect_rcon(&id).await);
}

#[tokio::test]
async fn wrong_rcon_password_surfaces_as_authentication_failure() {
    let (addr, _) = spawn_rcon_server().await;
    let dir = tempfile::tempdir().unwrap();
    let inst = rcon_instance(dir.path(), "remote", addr, "hunter2");
    let id = inst.id.clone();
    let core = core_with(vec![inst]);

    let err = core.send_command(&id, "list").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    // A command that never reached the server is not logged.
    assert!(core.logs(&id, 10).is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn supervised_instance_uses_process_input() {
    let (addr, connections) = spawn_rcon_server().await;
    let dir = tempfile::tempdir().unwrap();
    let inst = rcon_instance(dir.path(), "both", addr, "secret");
    let id = inst.id.clone();
    let core = core_with(vec![inst]);

    core.start(&id).await.unwrap();
    wait_for_state(core.watch_state(&id), LifecycleState::Running).await;

    assert_eq!(
        core.send_command(&id, "list").await.unwrap(),
        CommandReply::Console
    );
    assert!(
        eventually(|| core
            .logs(&id, 50)
            .iter()
            .any(|l| l.text.contains("players online")))
        .await
    );
    assert_eq!(
        connections.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "supervised commands never open an rcon session"
    );

    core.stop_all().await;
    assert!(!core.is_running(&id));
}

#[tokio::test]
async fn export_writes_json_lines() {
    let (addr, _) = spawn_rcon_server().await;
    let dir = tempfile::tempdir().unwrap();
    let inst = rcon_instance(&dir.path().join("work"), "remote", addr, "secret");
    let id = inst.id.clone();
    let core = core_with(vec![inst]);

    core.rcon(&id, "seed").await.unwrap();
    let out = dir.path().join("remote.jsonl");
    let written = core.export_logs(&id, &out).await.unwrap();
    assert_eq!(written, 2);

    let text = std::fs::read_to_string(&out).unwrap();
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["text"], "> seed");
    assert_eq!(records[0]["source"], "rcon");
    assert_eq!(records[1]["text"], "echo: seed");
    assert_eq!(records[1]["instance"], "remote");
}

#[tokio::test]
async fn unknown_instance_is_reported() {
    let core = core_with(Vec::new());
    let ghost = InstanceId::new("ghost");

    assert_eq!(
        core.send_command(&ghost, "list").await.unwrap_err().kind(),
        ErrorKind::UnknownInstance
    );
    assert_eq!(
        core.start(&ghost).await.unwrap_err().kind(),
        ErrorKind::UnknownInstance
    );
    assert_eq!(
        core.rcon(&ghost, "list").await.unwrap_err().kind(),
        ErrorKind::UnknownInstance
    );
}

#[tokio::test]
async fn instances_load_from_toml() {
    let config = CoreConfig::parse(
        r#"
        [supervisor]
        grace_secs = 3

        [backup]
        directory = "/srv/backups"

        [[instances]]
        id = "survival"
        name = "Survival"
        working_dir = "/srv/survival"
        memory_mb = 4096
        launch = { kind = "java", jar = "server.jar" }

        [instances.rcon]
        host = "127.0.0.1"
        port = 25575
        password = "secret"

        [[instances]]
        id = "modded"
        name = "Modded"
        working_dir = "/srv/modded"
        launch = { kind = "executable", program = "run.sh" }
        "#,
    )
    .unwrap();

    assert_eq!(config.supervisor.grace_secs, 3);
    assert_eq!(config.instances.len(), 2);
    let survival = &config.instances[0];
    assert_eq!(survival.memory_mb, Some(4096));
    assert!(matches!(
        &survival.launch,
        LaunchSpec::Java { args, .. } if args == &vec!["nogui".to_string()]
    ));
    assert_eq!(survival.rcon.as_ref().map(|r| r.port), Some(25575));
    assert!(config.instances[1].rcon.is_none());

    let core = Core::from_config(&config).unwrap();
    let listed = core.repository().instances().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(!core.is_running(&InstanceId::new("survival")));
}

#[test]
fn malformed_config_is_rejected() {
    let err = CoreConfig::parse("[supervisor]\ngrace_secs = \"soon\"\n").unwrap_err();
    assert_eq!(
        serverkeep::Error::from(err).kind(),
        ErrorKind::InvalidConfig
    );
}
