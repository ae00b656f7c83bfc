use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, sleep, timeout_at},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::SupervisorSettings,
    error::ServerError,
    log::{LogBroadcaster, LogEvent, LogLine, LogSource},
    parser::classify,
    repository::Repository,
};

use super::{
    InstanceId, InstanceSnapshot, LifecycleState,
    process::{self, ProcessMessage, StdinRequest},
};

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub state: LifecycleState,
}

/// Owns every supervised process and the lifecycle state of every instance.
///
/// The active-process map is the only record of what is running. Starts and
/// exits both mutate it under one lock, and each spawned process carries a
/// generation number so a late exit can never evict a newer process.
#[derive(Debug, Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
    events_tx: mpsc::UnboundedSender<ProcessMessage>,
}

#[derive(Debug)]
struct Shared {
    repository: Arc<dyn Repository>,
    logs: LogBroadcaster,
    settings: SupervisorSettings,
    active: Mutex<HashMap<InstanceId, ActiveProcess>>,
    /// Instances that may not start. Only changed while `active` is locked.
    held: Mutex<HashSet<InstanceId>>,
    states: Mutex<HashMap<InstanceId, Arc<watch::Sender<LifecycleState>>>>,
    next_generation: AtomicU64,
}

#[derive(Debug)]
struct ActiveProcess {
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stdin_tx: mpsc::Sender<StdinRequest>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitReport>>,
    max_players: Option<u32>,
    stopping: bool,
    crashed: bool,
    online: BTreeSet<String>,
    player_count: Option<u32>,
}

/// Pending shutdown returned by [`Supervisor::request_stop`].
#[derive(Debug)]
pub struct StopTicket {
    id: InstanceId,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl StopTicket {
    /// Waits for the process to exit, giving up at `deadline`.
    pub async fn wait_until(mut self, deadline: Instant) -> Result<ExitReport, ServerError> {
        match timeout_at(deadline, wait_exit(&mut self.exit_rx)).await {
            Ok(report) => Ok(report),
            Err(_) => Err(ServerError::StopTimeout(self.id)),
        }
    }

    pub async fn wait(self, bound: Duration) -> Result<ExitReport, ServerError> {
        self.wait_until(Instant::now() + bound).await
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<ExitReport>>) -> ExitReport {
    let report = match rx.wait_for(Option::is_some).await {
        Ok(report) => *report,
        Err(_) => None,
    };
    // A dropped sender means the entry was torn down; treat it as a plain stop.
    report.unwrap_or(ExitReport {
        code: None,
        state: LifecycleState::Stopped,
    })
}

/// Keeps a stopped instance from starting until dropped.
#[derive(Debug)]
pub struct MaintenanceHold {
    shared: Arc<Shared>,
    id: InstanceId,
}

impl MaintenanceHold {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }
}

impl Drop for MaintenanceHold {
    fn drop(&mut self) {
        let _active = lock(&self.shared.active);
        lock(&self.shared.held).remove(&self.id);
        debug!(instance = %self.id, "maintenance hold released");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Supervisor {
    /// Creates the supervisor and spawns its message loop; must be called inside a Tokio runtime.
    pub fn new(
        repository: Arc<dyn Repository>,
        logs: LogBroadcaster,
        settings: SupervisorSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            repository,
            logs,
            settings,
            active: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            states: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        });

        tokio::spawn(Shared::run(shared.clone(), events_rx));

        Self { shared, events_tx }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    pub fn logs(&self) -> &LogBroadcaster {
        &self.shared.logs
    }

    pub async fn start(&self, id: &InstanceId) -> Result<(), ServerError> {
        let instance = self.shared.repository.instance(id).await?;

        let spawned = {
            let mut active = lock(&self.shared.active);
            if active.contains_key(id) {
                return Err(ServerError::AlreadyRunning(id.clone()));
            }
            if lock(&self.shared.held).contains(id) {
                return Err(ServerError::InMaintenance(id.clone()));
            }

            let launch = instance.resolve_launch()?;
            self.shared.set_state(id, LifecycleState::Starting);

            let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
            match process::spawn(
                id.clone(),
                generation,
                &launch,
                &instance.working_dir,
                self.events_tx.clone(),
            ) {
                Ok(handle) => {
                    let (exit_tx, _) = watch::channel(None);
                    info!(
                        instance = %id,
                        pid = ?handle.pid,
                        program = %launch.program.display(),
                        "server process started"
                    );
                    active.insert(
                        id.clone(),
                        ActiveProcess {
                            generation,
                            pid: handle.pid,
                            started_at: Utc::now(),
                            stdin_tx: handle.stdin_tx,
                            kill: handle.kill,
                            exit_tx,
                            max_players: instance.max_players,
                            stopping: false,
                            crashed: false,
                            online: BTreeSet::new(),
                            player_count: None,
                        },
                    );
                    Ok(())
                }
                Err(err) => {
                    self.shared.set_state(id, LifecycleState::Error);
                    Err(err)
                }
            }
        };

        match spawned {
            Ok(()) => {
                self.shared.persist_state(id, LifecycleState::Starting).await;
                Ok(())
            }
            Err(err) => {
                error!(instance = %id, error = %err, "failed to start server process");
                self.shared.persist_state(id, LifecycleState::Error).await;
                Err(err)
            }
        }
    }

    /// Asks the process to shut down and arms the forced-kill timer.
    ///
    /// The timer is armed before the stop command is written and runs on its
    /// own task, so it fires after `grace` even if the write stalls or the
    /// caller goes away.
    pub async fn request_stop(
        &self,
        id: &InstanceId,
        grace: Duration,
    ) -> Result<StopTicket, ServerError> {
        let (stdin_tx, kill, exit_rx) = {
            let mut active = lock(&self.shared.active);
            let proc = active
                .get_mut(id)
                .ok_or_else(|| ServerError::NotRunning(id.clone()))?;
            if !proc.stopping {
                proc.stopping = true;
                self.shared.set_state(id, LifecycleState::Stopping);
            }
            (
                proc.stdin_tx.clone(),
                proc.kill.clone(),
                proc.exit_tx.subscribe(),
            )
        };

        let mut timer_rx = exit_rx.clone();
        let timer_id = id.clone();
        let timer_kill = kill.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(grace) => {
                    if timer_rx.borrow().is_none() {
                        warn!(instance = %timer_id, "grace period elapsed, killing process");
                        timer_kill.cancel();
                    }
                }
                _ = wait_exit(&mut timer_rx) => {}
            }
        });

        self.shared
            .persist_state(id, LifecycleState::Stopping)
            .await;

        let stop_command = &self.shared.settings.stop_command;
        match process::send_line(&stdin_tx, id, stop_command, grace).await {
            Ok(()) => {
                self.shared
                    .logs
                    .append(LogLine::command(id.clone(), stop_command.as_str()));
                info!(instance = %id, grace_secs = grace.as_secs(), "stop requested");
            }
            Err(err) => {
                warn!(instance = %id, error = %err, "could not deliver stop command, killing");
                kill.cancel();
            }
        }

        Ok(StopTicket {
            id: id.clone(),
            exit_rx,
        })
    }

    /// Two-phase stop: polite command, then forced kill after `grace`.
    pub async fn stop(&self, id: &InstanceId, grace: Duration) -> Result<ExitReport, ServerError> {
        let ticket = self.request_stop(id, grace).await?;
        ticket.wait(grace + self.shared.settings.kill_wait()).await
    }

    /// Stops with the configured grace period.
    pub async fn stop_default(&self, id: &InstanceId) -> Result<ExitReport, ServerError> {
        self.stop(id, self.shared.settings.grace()).await
    }

    /// Terminates the process immediately.
    pub async fn kill(&self, id: &InstanceId) -> Result<ExitReport, ServerError> {
        let exit_rx = {
            let mut active = lock(&self.shared.active);
            let proc = active
                .get_mut(id)
                .ok_or_else(|| ServerError::NotRunning(id.clone()))?;
            if !proc.stopping {
                proc.stopping = true;
                self.shared.set_state(id, LifecycleState::Stopping);
            }
            proc.kill.cancel();
            proc.exit_tx.subscribe()
        };
        warn!(instance = %id, "killing server process");
        self.shared
            .persist_state(id, LifecycleState::Stopping)
            .await;

        StopTicket {
            id: id.clone(),
            exit_rx,
        }
        .wait(self.shared.settings.kill_wait())
        .await
    }

    /// Stop (if running), let the OS release the port, then start again.
    pub async fn restart(&self, id: &InstanceId) -> Result<(), ServerError> {
        match self.stop_default(id).await {
            Ok(_) => sleep(self.shared.settings.restart_settle()).await,
            Err(ServerError::NotRunning(_)) => {
                debug!(instance = %id, "restart of stopped instance, starting directly");
            }
            Err(err) => return Err(err),
        }
        self.start(id).await
    }

    /// Writes a console command to the process input and records it in the log.
    pub async fn send_command(&self, id: &InstanceId, text: &str) -> Result<(), ServerError> {
        let stdin_tx = lock(&self.shared.active)
            .get(id)
            .map(|proc| proc.stdin_tx.clone())
            .ok_or_else(|| ServerError::NotRunning(id.clone()))?;

        let bound = self.shared.settings.command_timeout();
        process::send_line(&stdin_tx, id, text, bound).await?;
        self.shared.logs.append(LogLine::command(id.clone(), text));
        debug!(instance = %id, command = text, "command sent");
        Ok(())
    }

    /// Reserves a stopped instance for maintenance; `start` fails with
    /// [`ServerError::InMaintenance`] until the hold is dropped.
    pub fn hold(&self, id: &InstanceId) -> Result<MaintenanceHold, ServerError> {
        let active = lock(&self.shared.active);
        if active.contains_key(id) {
            return Err(ServerError::AlreadyRunning(id.clone()));
        }
        if !lock(&self.shared.held).insert(id.clone()) {
            return Err(ServerError::InMaintenance(id.clone()));
        }
        debug!(instance = %id, "maintenance hold taken");
        Ok(MaintenanceHold {
            shared: self.shared.clone(),
            id: id.clone(),
        })
    }

    pub fn is_held(&self, id: &InstanceId) -> bool {
        lock(&self.shared.held).contains(id)
    }

    /// Settles a non-running instance in `Stopped`, e.g. after its files were replaced.
    pub async fn mark_stopped(&self, id: &InstanceId) -> bool {
        {
            let active = lock(&self.shared.active);
            if active.contains_key(id) {
                return false;
            }
            self.shared.set_state(id, LifecycleState::Stopped);
        }
        self.shared.persist_state(id, LifecycleState::Stopped).await;
        true
    }

    pub fn is_running(&self, id: &InstanceId) -> bool {
        lock(&self.shared.active).contains_key(id)
    }

    pub fn running(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = lock(&self.shared.active).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn state(&self, id: &InstanceId) -> LifecycleState {
        *self.shared.state_tx(id).borrow()
    }

    /// Receiver that observes every lifecycle transition of `id`.
    pub fn watch_state(&self, id: &InstanceId) -> watch::Receiver<LifecycleState> {
        self.shared.state_tx(id).subscribe()
    }

    /// The last `n` buffered lines of `id`.
    pub fn logs_since(&self, id: &InstanceId, n: usize) -> Vec<LogLine> {
        self.shared.logs.recent(id, n)
    }

    pub fn snapshot(&self, id: &InstanceId) -> InstanceSnapshot {
        let state = self.state(id);
        let active = lock(&self.shared.active);
        match active.get(id) {
            Some(proc) => InstanceSnapshot {
                id: id.clone(),
                state,
                pid: proc.pid,
                started_at: Some(proc.started_at),
                online: proc.online.clone(),
                player_count: proc.player_count,
                max_players: proc.max_players,
            },
            None => InstanceSnapshot {
                id: id.clone(),
                state,
                pid: None,
                started_at: None,
                online: BTreeSet::new(),
                player_count: None,
                max_players: None,
            },
        }
    }
}

impl Shared {
    async fn run(shared: Arc<Shared>, mut events_rx: mpsc::UnboundedReceiver<ProcessMessage>) {
        while let Some(msg) = events_rx.recv().await {
            match msg {
                ProcessMessage::Line {
                    id,
                    generation,
                    source,
                    text,
                } => shared.on_line(id, generation, source, text).await,
                ProcessMessage::Exited {
                    id,
                    generation,
                    code,
                } => shared.on_exit(id, generation, code).await,
            }
        }
        debug!("supervisor loop finished");
    }

    async fn on_line(&self, id: InstanceId, generation: u64, source: LogSource, text: String) {
        let event = classify(&text);
        let line = self
            .logs
            .append(LogLine::new(id.clone(), source, text, event.clone()));

        let Some(event) = event else {
            return;
        };

        let became_running = {
            let mut active = lock(&self.active);
            let Some(proc) = active.get_mut(&id).filter(|p| p.generation == generation) else {
                return;
            };

            match &event {
                LogEvent::ReadySignal => {
                    if *self.state_tx(&id).borrow() == LifecycleState::Starting {
                        self.set_state(&id, LifecycleState::Running);
                        true
                    } else {
                        false
                    }
                }
                LogEvent::PlayerJoined { name } => {
                    proc.online.insert(name.clone());
                    false
                }
                LogEvent::PlayerLeft { name } => {
                    proc.online.remove(name);
                    false
                }
                LogEvent::PlayerCount { current, max } => {
                    proc.player_count = Some(*current);
                    proc.max_players = Some(*max);
                    false
                }
                LogEvent::CrashDetected | LogEvent::OutOfMemory => {
                    proc.crashed = true;
                    false
                }
                LogEvent::PluginLoadFailed { .. } | LogEvent::PerformanceWarning => false,
            }
        };

        match &event {
            LogEvent::CrashDetected | LogEvent::OutOfMemory => {
                error!(instance = %id, event = %event, line = %line.text, "server reported a fatal condition");
            }
            LogEvent::PluginLoadFailed { .. } | LogEvent::PerformanceWarning => {
                warn!(instance = %id, event = %event, "server warning");
            }
            _ => {}
        }

        if became_running {
            info!(instance = %id, "server ready");
            self.persist_state(&id, LifecycleState::Running).await;
        }
    }

    async fn on_exit(&self, id: InstanceId, generation: u64, code: Option<i32>) {
        let state = {
            let mut active = lock(&self.active);
            if active.get(&id).map(|p| p.generation) != Some(generation) {
                debug!(instance = %id, generation, "exit of a replaced process ignored");
                return;
            }
            let Some(proc) = active.remove(&id) else {
                return;
            };

            let state = if proc.stopping || (code == Some(0) && !proc.crashed) {
                LifecycleState::Stopped
            } else {
                LifecycleState::Error
            };
            self.set_state(&id, state);
            proc.exit_tx.send_replace(Some(ExitReport { code, state }));
            state
        };

        match state {
            LifecycleState::Error => {
                error!(instance = %id, code = ?code, "server process exited unexpectedly")
            }
            _ => info!(instance = %id, code = ?code, "server process exited"),
        }
        self.persist_state(&id, state).await;
    }

    fn state_tx(&self, id: &InstanceId) -> Arc<watch::Sender<LifecycleState>> {
        lock(&self.states)
            .entry(id.clone())
            .or_insert_with(|| Arc::new(watch::Sender::new(LifecycleState::Stopped)))
            .clone()
    }

    fn set_state(&self, id: &InstanceId, state: LifecycleState) -> LifecycleState {
        let old = self.state_tx(id).send_replace(state);
        if old != state {
            debug!(instance = %id, %old, new = %state, "state changed");
        }
        old
    }

    async fn persist_state(&self, id: &InstanceId, state: LifecycleState) {
        if let Err(err) = self.repository.record_state(id, state).await {
            warn!(instance = %id, error = %err, "failed to record lifecycle state");
        }
    }
}
