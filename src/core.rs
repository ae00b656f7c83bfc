//! The command/query surface that outer layers (HTTP, WebSocket, CLI) call into.

use std::{path::Path, sync::Arc, time::Duration};

use tokio::{fs, sync::watch};
use tracing::{debug, info, instrument, warn};

use crate::{
    backup::{BackupArtifact, BackupCoordinator, DeleteReport},
    config::CoreConfig,
    error::{BackupError, RconError, Result, ServerError},
    instance::{ExitReport, InstanceId, InstanceSnapshot, LifecycleState, Supervisor},
    log::{LogBroadcaster, LogLine, LogSource, Subscription, SubscriptionHandle},
    parser::classify,
    rcon::RconConsole,
    repository::{MemoryRepository, Repository},
    store,
};

/// How a console command reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    /// Written to the input of the supervised process; output follows in the log stream.
    Console,
    /// Relayed over RCON, with the server's response payload.
    Rcon(String),
}

/// Owns every subsystem and routes requests to the right one.
#[derive(Debug, Clone)]
pub struct Core {
    repository: Arc<dyn Repository>,
    logs: LogBroadcaster,
    supervisor: Supervisor,
    rcon: RconConsole,
    backups: BackupCoordinator,
}

impl Core {
    /// Wires the subsystems together; must be called inside a Tokio runtime.
    pub fn new(config: &CoreConfig, repository: Arc<dyn Repository>) -> Result<Self> {
        let logs = LogBroadcaster::new(config.logs);
        let supervisor = Supervisor::new(
            repository.clone(),
            logs.clone(),
            config.supervisor.clone(),
        );
        let store = store::from_settings(&config.backup).map_err(BackupError::from)?;
        let backups = BackupCoordinator::new(
            supervisor.clone(),
            repository.clone(),
            store,
            config.backup.clone(),
        );

        Ok(Self {
            repository,
            logs,
            supervisor,
            rcon: RconConsole::new(config.rcon),
            backups,
        })
    }

    /// Builds a core over an in-memory repository seeded with the configured instances.
    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        let repository = MemoryRepository::with_instances(config.instances.iter().cloned());
        Self::new(config, Arc::new(repository))
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn backups(&self) -> &BackupCoordinator {
        &self.backups
    }

    pub async fn start(&self, id: &InstanceId) -> Result<()> {
        Ok(self.supervisor.start(id).await?)
    }

    /// Two-phase stop; `grace` defaults to the configured grace period.
    pub async fn stop(&self, id: &InstanceId, grace: Option<Duration>) -> Result<ExitReport> {
        let grace = grace.unwrap_or_else(|| self.supervisor.settings().grace());
        Ok(self.supervisor.stop(id, grace).await?)
    }

    pub async fn restart(&self, id: &InstanceId) -> Result<()> {
        Ok(self.supervisor.restart(id).await?)
    }

    pub async fn kill(&self, id: &InstanceId) -> Result<ExitReport> {
        Ok(self.supervisor.kill(id).await?)
    }

    /// Stops every supervised instance, e.g. on daemon shutdown.
    pub async fn stop_all(&self) {
        for id in self.supervisor.running() {
            if let Err(err) = self.supervisor.stop_default(&id).await {
                warn!(instance = %id, error = %err, "failed to stop instance");
            }
        }
    }

    /// Sends a console command, through the process input when supervised and
    /// over RCON otherwise.
    #[instrument(skip(self, text), fields(instance = %id))]
    pub async fn send_command(&self, id: &InstanceId, text: &str) -> Result<CommandReply> {
        if self.supervisor.is_running(id) {
            match self.supervisor.send_command(id, text).await {
                Ok(()) => return Ok(CommandReply::Console),
                // Exited between the check and the write; fall through to RCON.
                Err(ServerError::NotRunning(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let instance = self.repository.instance(id).await?;
        if instance.rcon.is_none() {
            return Err(ServerError::NotRunning(id.clone()).into());
        }
        debug!("instance not supervised, relaying over rcon");
        self.rcon(id, text).await.map(CommandReply::Rcon)
    }

    /// Runs a command over RCON and records the exchange in the instance's log.
    pub async fn rcon(&self, id: &InstanceId, text: &str) -> Result<String> {
        let instance = self.repository.instance(id).await?;
        let endpoint = instance
            .rcon
            .ok_or_else(|| RconError::NotConfigured(id.clone()))?;

        let response = self.rcon.command(id, &endpoint, text).await?;
        // Recorded once the server answered, immediately ahead of the reply.
        self.logs.append(LogLine::new(
            id.clone(),
            LogSource::Rcon,
            format!("> {text}"),
            None,
        ));
        for line in response.lines().filter(|line| !line.trim().is_empty()) {
            self.logs
                .append(LogLine::new(id.clone(), LogSource::Rcon, line, classify(line)));
        }
        Ok(response)
    }

    pub async fn disconnect_rcon(&self, id: &InstanceId) -> bool {
        self.rcon.disconnect(id).await
    }

    pub fn is_running(&self, id: &InstanceId) -> bool {
        self.supervisor.is_running(id)
    }

    pub fn state(&self, id: &InstanceId) -> LifecycleState {
        self.supervisor.state(id)
    }

    pub fn watch_state(&self, id: &InstanceId) -> watch::Receiver<LifecycleState> {
        self.supervisor.watch_state(id)
    }

    pub fn snapshot(&self, id: &InstanceId) -> InstanceSnapshot {
        self.supervisor.snapshot(id)
    }

    /// The last `n` buffered lines, oldest first.
    pub fn logs(&self, id: &InstanceId, n: usize) -> Vec<LogLine> {
        self.logs.recent(id, n)
    }

    pub fn subscribe(&self, id: &InstanceId) -> Subscription {
        self.logs.subscribe(id)
    }

    pub fn subscribe_with_backlog(&self, id: &InstanceId, backlog: usize) -> Subscription {
        self.logs.subscribe_with_backlog(id, backlog)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.logs.unsubscribe(handle)
    }

    /// Writes the whole buffered log of `id` to `path` as JSON lines.
    pub async fn export_logs(&self, id: &InstanceId, path: &Path) -> Result<usize> {
        let lines = self
            .logs
            .recent(id, self.logs.settings().buffer_capacity);

        let mut out = String::new();
        for line in &lines {
            out.push_str(&serde_json::to_string(line).map_err(std::io::Error::from)?);
            out.push('\n');
        }
        fs::write(path, out).await?;

        info!(instance = %id, lines = lines.len(), path = %path.display(), "logs exported");
        Ok(lines.len())
    }

    pub async fn create_backup(&self, id: &InstanceId, mirror: bool) -> Result<BackupArtifact> {
        Ok(self.backups.create(id, mirror).await?)
    }

    pub async fn restore_backup(&self, artifact: &str, from_remote: bool) -> Result<BackupArtifact> {
        Ok(self.backups.restore(artifact, from_remote).await?)
    }

    pub async fn delete_backup(&self, artifact: &str, also_remote: bool) -> Result<DeleteReport> {
        Ok(self.backups.delete(artifact, also_remote).await?)
    }

    pub async fn list_backups(&self, id: Option<&InstanceId>) -> Result<Vec<BackupArtifact>> {
        Ok(self.backups.list(id).await?)
    }

    pub async fn sync_backups(&self, id: &InstanceId) -> Result<Vec<BackupArtifact>> {
        Ok(self.backups.sync(id).await?)
    }

    /// Registers artifacts found in the backup directory from earlier runs.
    pub async fn discover_backups(&self) -> Result<Vec<BackupArtifact>> {
        Ok(self.backups.discover_local().await?)
    }
}
