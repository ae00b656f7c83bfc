use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{SubsecRound, Utc};
use tempfile::NamedTempFile;
use tokio::{
    fs,
    runtime::Handle,
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
    time::{Instant, sleep},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    archive,
    config::BackupSettings,
    error::{ArchiveError, BackupError, ServerError, StoreError},
    instance::{InstanceId, MaintenanceHold, ManagedInstance, Supervisor},
    repository::Repository,
    store::ObjectStore,
};

use super::artifact::{
    ARTIFACT_EXTENSION, BackupArtifact, artifact_name, instance_prefix, stamp_of,
};

/// What [`BackupCoordinator::delete`] actually removed.
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub local_removed: bool,
    pub remote_removed: bool,
    /// Set when the remote copy was requested gone but could not be deleted.
    pub remote_error: Option<BackupError>,
}

/// Orchestrates archive, restore and mirroring of instance working directories.
///
/// Creating and restoring the same instance are mutually exclusive; a second
/// request while one is in flight fails with `InstanceBusy` instead of queueing.
#[derive(Debug, Clone)]
pub struct BackupCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    supervisor: Supervisor,
    repository: Arc<dyn Repository>,
    store: Option<Arc<dyn ObjectStore>>,
    settings: BackupSettings,
    locks: Mutex<HashMap<InstanceId, Arc<AsyncMutex<()>>>>,
}

impl BackupCoordinator {
    pub fn new(
        supervisor: Supervisor,
        repository: Arc<dyn Repository>,
        store: Option<Arc<dyn ObjectStore>>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                supervisor,
                repository,
                store,
                settings,
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.inner.settings
    }

    pub fn has_remote(&self) -> bool {
        self.inner.store.is_some()
    }

    fn directory(&self) -> &Path {
        &self.inner.settings.directory
    }

    fn lock(&self, id: &InstanceId) -> Result<OwnedMutexGuard<()>, BackupError> {
        let slot = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_default()
            .clone();
        slot.try_lock_owned()
            .map_err(|_| BackupError::InstanceBusy(id.clone()))
    }

    /// Archives the working directory of `id` and records the artifact.
    ///
    /// A running instance is quiesced around the archive step. Mirroring is
    /// best effort: an upload failure is logged and the local artifact stands.
    #[instrument(skip(self), fields(instance = %id))]
    pub async fn create(&self, id: &InstanceId, mirror: bool) -> Result<BackupArtifact, BackupError> {
        let instance = self.inner.repository.instance(id).await?;
        let _guard = self.lock(id)?;

        fs::create_dir_all(self.directory()).await?;
        let created_at = Utc::now().trunc_subsecs(3);
        let name = artifact_name(&instance.name, created_at);
        let path = self.directory().join(&name);

        let quiesced = self.quiesce(id).await;
        let archived = archive::create(&instance.working_dir, &path, Some(self.directory())).await;
        if let Some(quiesced) = quiesced {
            quiesced.resume().await;
        }
        let summary = archived?;

        let mut artifact = BackupArtifact {
            name,
            instance: id.clone(),
            path,
            size: summary.bytes,
            created_at,
            remote: false,
        };
        self.inner
            .repository
            .record_artifact(artifact.clone())
            .await?;
        info!(artifact = %artifact.name, bytes = artifact.size, "backup created");

        if mirror {
            match &self.inner.store {
                Some(store) => match store.upload(&artifact.name, &artifact.path).await {
                    Ok(()) => {
                        artifact.remote = true;
                        self.inner
                            .repository
                            .record_artifact(artifact.clone())
                            .await?;
                        info!(artifact = %artifact.name, "backup mirrored");
                    }
                    Err(err) => {
                        warn!(artifact = %artifact.name, error = %err, "backup mirror upload failed")
                    }
                },
                None => warn!(artifact = %artifact.name, "mirror requested but no remote store configured"),
            }
        }

        Ok(artifact)
    }

    /// Replaces the working directory of the artifact's instance with its contents.
    ///
    /// A running instance is stopped first; if it has not exited when the grace
    /// period ends the restore fails with `InstanceBusy` and nothing is touched.
    /// The instance cannot be started until the restore returns, and is left
    /// stopped either way.
    #[instrument(skip(self))]
    pub async fn restore(&self, name: &str, from_remote: bool) -> Result<BackupArtifact, BackupError> {
        if !is_flat_name(name) {
            return Err(BackupError::ArtifactNotFound(name.to_string()));
        }

        let record = self.inner.repository.artifact(name).await?;
        let instance = match &record {
            Some(artifact) => self.inner.repository.instance(&artifact.instance).await?,
            None => self.owner_of(name).await?,
        };
        let id = instance.id.clone();
        let _guard = self.lock(&id)?;

        let artifact = if from_remote {
            self.fetch(name, &id).await?
        } else {
            let Some(artifact) = record else {
                return Err(BackupError::ArtifactNotFound(name.to_string()));
            };
            if !fs::try_exists(&artifact.path).await? {
                return Err(BackupError::ArtifactNotFound(name.to_string()));
            }
            artifact
        };

        // Reject unsafe archives while the working directory is still intact.
        archive::inspect(&artifact.path).await?;

        // Held until the working directory is settled; `start` is refused meanwhile.
        let _hold = self.ensure_stopped(&id).await?;

        if let Err(source) = self.replace_contents(&instance, &artifact.path).await {
            self.inner.supervisor.mark_stopped(&id).await;
            warn!(instance = %id, artifact = name, error = %source, "restore left the working directory incomplete");
            return Err(BackupError::RestoreIncomplete {
                instance: id,
                artifact: name.to_string(),
                source,
            });
        }

        if !self.inner.supervisor.mark_stopped(&id).await {
            warn!(instance = %id, artifact = name, "instance started during restore");
            return Err(BackupError::InstanceBusy(id));
        }
        info!(instance = %id, artifact = name, "backup restored");
        Ok(artifact)
    }

    /// Removes an artifact locally and, when asked, from the remote store.
    ///
    /// A missing local file is not an error. A remote failure is reported in
    /// the returned [`DeleteReport`] and never blocks the local removal.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str, also_remote: bool) -> Result<DeleteReport, BackupError> {
        if !is_flat_name(name) {
            return Err(BackupError::ArtifactNotFound(name.to_string()));
        }

        let path = self
            .inner
            .repository
            .artifact(name)
            .await?
            .map(|artifact| artifact.path)
            .unwrap_or_else(|| self.directory().join(name));

        // The record goes only once the file is gone, so a failed removal stays listed.
        let mut report = DeleteReport::default();
        match fs::remove_file(&path).await {
            Ok(()) => report.local_removed = true,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "local artifact already gone")
            }
            Err(e) => return Err(e.into()),
        }
        self.inner.repository.remove_artifact(name).await?;

        if also_remote {
            match &self.inner.store {
                Some(store) => match store.delete(name).await {
                    Ok(()) => report.remote_removed = true,
                    Err(StoreError::NotFound(_)) => {}
                    Err(err) => {
                        warn!(artifact = name, error = %err, "remote artifact deletion failed");
                        report.remote_error = Some(err.into());
                    }
                },
                None => report.remote_error = Some(BackupError::NoRemote),
            }
        }

        info!(
            artifact = name,
            local = report.local_removed,
            remote = report.remote_removed,
            "backup deleted"
        );
        Ok(report)
    }

    /// Downloads and registers remote artifacts of `id` that are not known locally.
    #[instrument(skip(self), fields(instance = %id))]
    pub async fn sync(&self, id: &InstanceId) -> Result<Vec<BackupArtifact>, BackupError> {
        let store = self.inner.store.as_ref().ok_or(BackupError::NoRemote)?;
        let instance = self.inner.repository.instance(id).await?;

        let remote = store.list(&instance_prefix(&instance.name)).await?;
        let known: HashMap<String, BackupArtifact> = self
            .inner
            .repository
            .artifacts()
            .await?
            .into_iter()
            .map(|artifact| (artifact.name.clone(), artifact))
            .collect();

        let mut fetched = Vec::new();
        for object in remote {
            if !object.name.ends_with(ARTIFACT_EXTENSION) {
                continue;
            }
            match known.get(&object.name) {
                Some(artifact) if !artifact.remote => {
                    let mut artifact = artifact.clone();
                    artifact.remote = true;
                    self.inner.repository.record_artifact(artifact).await?;
                }
                Some(_) => {}
                None => fetched.push(self.fetch(&object.name, id).await?),
            }
        }

        info!(fetched = fetched.len(), "remote backups synchronised");
        Ok(fetched)
    }

    /// Records artifacts already present in the backup directory that the
    /// repository does not know about, e.g. ones written by an earlier run.
    pub async fn discover_local(&self) -> Result<Vec<BackupArtifact>, BackupError> {
        let mut entries = match fs::read_dir(self.directory()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let known: HashSet<String> = self
            .inner
            .repository
            .artifacts()
            .await?
            .into_iter()
            .map(|artifact| artifact.name)
            .collect();

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(ARTIFACT_EXTENSION) || known.contains(&name) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let Ok(owner) = self.owner_of(&name).await else {
                debug!(artifact = %name, "no instance owns artifact, skipped");
                continue;
            };

            let created_at = stamp_of(&name)
                .or_else(|| meta.modified().ok().map(Into::into))
                .unwrap_or_else(Utc::now);
            let artifact = BackupArtifact {
                path: entry.path(),
                name,
                instance: owner.id,
                size: meta.len(),
                created_at,
                remote: false,
            };
            self.inner
                .repository
                .record_artifact(artifact.clone())
                .await?;
            found.push(artifact);
        }

        if !found.is_empty() {
            info!(found = found.len(), "local backups indexed");
        }
        Ok(found)
    }

    /// Recorded artifacts, newest first, optionally for one instance only.
    pub async fn list(&self, id: Option<&InstanceId>) -> Result<Vec<BackupArtifact>, BackupError> {
        let mut artifacts: Vec<_> = self
            .inner
            .repository
            .artifacts()
            .await?
            .into_iter()
            .filter(|artifact| id.is_none_or(|id| artifact.instance == *id))
            .collect();
        artifacts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(artifacts)
    }

    async fn quiesce(&self, id: &InstanceId) -> Option<Quiesced> {
        let supervisor = &self.inner.supervisor;
        if !supervisor.is_running(id) {
            return None;
        }

        send_all(supervisor, id, &self.inner.settings.quiesce_commands).await;
        sleep(self.inner.settings.quiesce_settle()).await;

        Some(Quiesced {
            supervisor: supervisor.clone(),
            id: id.clone(),
            commands: self.inner.settings.resume_commands.clone(),
            armed: true,
        })
    }

    async fn ensure_stopped(&self, id: &InstanceId) -> Result<MaintenanceHold, BackupError> {
        let supervisor = &self.inner.supervisor;
        if supervisor.is_running(id) {
            let grace = supervisor.settings().grace();
            let deadline = Instant::now() + grace;
            match supervisor.request_stop(id, grace).await {
                Ok(ticket) => {
                    ticket
                        .wait_until(deadline)
                        .await
                        .map_err(|_| BackupError::InstanceBusy(id.clone()))?;
                }
                Err(ServerError::NotRunning(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        // Fails if someone started it again while we waited.
        supervisor.hold(id).map_err(|err| {
            debug!(instance = %id, error = %err, "could not hold instance for restore");
            BackupError::InstanceBusy(id.clone())
        })
    }

    async fn replace_contents(
        &self,
        instance: &ManagedInstance,
        archive_path: &Path,
    ) -> Result<(), ArchiveError> {
        let keep = fs::canonicalize(self.directory()).await.ok();
        clear_dir(&instance.working_dir, keep.as_deref()).await?;
        archive::extract(archive_path, &instance.working_dir).await?;
        Ok(())
    }

    /// Instance owning an unrecorded artifact, by longest matching name prefix.
    async fn owner_of(&self, name: &str) -> Result<ManagedInstance, BackupError> {
        self.inner
            .repository
            .instances()
            .await?
            .into_iter()
            .filter(|instance| name.starts_with(&instance_prefix(&instance.name)))
            .max_by_key(|instance| instance.name.len())
            .ok_or_else(|| BackupError::ArtifactNotFound(name.to_string()))
    }

    /// Downloads a remote artifact into the backup directory and records it.
    async fn fetch(&self, name: &str, id: &InstanceId) -> Result<BackupArtifact, BackupError> {
        let store = self.inner.store.as_ref().ok_or(BackupError::NoRemote)?;
        fs::create_dir_all(self.directory()).await?;

        let tmp = NamedTempFile::new_in(self.directory())?;
        match store.download(name, tmp.path()).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                return Err(BackupError::ArtifactNotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        let path: PathBuf = self.directory().join(name);
        tmp.persist(&path).map_err(|e| BackupError::Io(e.error))?;
        let size = fs::metadata(&path).await?.len();

        let artifact = BackupArtifact {
            name: name.to_string(),
            instance: id.clone(),
            path,
            size,
            created_at: stamp_of(name).unwrap_or_else(Utc::now),
            remote: true,
        };
        self.inner
            .repository
            .record_artifact(artifact.clone())
            .await?;
        info!(artifact = name, bytes = size, "remote backup downloaded");
        Ok(artifact)
    }
}

fn is_flat_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

/// Empties `dir`, sparing `keep` when it lives directly inside it.
async fn clear_dir(dir: &Path, keep: Option<&Path>) -> std::io::Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return fs::create_dir_all(dir).await,
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            if keep.is_some_and(|keep| {
                std::fs::canonicalize(&path).is_ok_and(|canonical| canonical == keep)
            }) {
                continue;
            }
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

async fn send_all(supervisor: &Supervisor, id: &InstanceId, commands: &[String]) {
    for command in commands {
        if let Err(err) = supervisor.send_command(id, command).await {
            warn!(instance = %id, command, error = %err, "backup console command failed");
            break;
        }
    }
}

/// Resume commands still owed to a quiesced instance.
///
/// Dropped without [`Quiesced::resume`] (the backup future was cancelled), the
/// commands are sent from a detached task instead.
struct Quiesced {
    supervisor: Supervisor,
    id: InstanceId,
    commands: Vec<String>,
    armed: bool,
}

impl Quiesced {
    async fn resume(mut self) {
        self.armed = false;
        send_all(&self.supervisor, &self.id, &self.commands).await;
    }
}

impl Drop for Quiesced {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = Handle::try_current() {
            let supervisor = self.supervisor.clone();
            let id = self.id.clone();
            let commands = std::mem::take(&mut self.commands);
            handle.spawn(async move { send_all(&supervisor, &id, &commands).await });
        }
    }
}
