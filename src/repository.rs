//! The single persistence boundary of the core.
//!
//! Instance records are read-only input; the core only writes lifecycle state
//! and backup artifact records back.

use std::{collections::HashMap, fmt::Debug};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    backup::BackupArtifact,
    error::RepositoryError,
    instance::{InstanceId, LifecycleState, ManagedInstance},
};

#[async_trait]
pub trait Repository: Debug + Send + Sync {
    async fn instance(&self, id: &InstanceId) -> Result<ManagedInstance, RepositoryError>;

    async fn instances(&self) -> Result<Vec<ManagedInstance>, RepositoryError>;

    async fn record_state(
        &self,
        id: &InstanceId,
        state: LifecycleState,
    ) -> Result<(), RepositoryError>;

    async fn artifacts(&self) -> Result<Vec<BackupArtifact>, RepositoryError>;

    async fn artifact(&self, name: &str) -> Result<Option<BackupArtifact>, RepositoryError>;

    async fn record_artifact(&self, artifact: BackupArtifact) -> Result<(), RepositoryError>;

    async fn remove_artifact(&self, name: &str)
    -> Result<Option<BackupArtifact>, RepositoryError>;
}

/// In-process repository, seeded from configuration.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    instances: RwLock<HashMap<InstanceId, ManagedInstance>>,
    states: RwLock<HashMap<InstanceId, LifecycleState>>,
    artifacts: RwLock<HashMap<String, BackupArtifact>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instances(instances: impl IntoIterator<Item = ManagedInstance>) -> Self {
        let map = instances
            .into_iter()
            .map(|inst| (inst.id.clone(), inst))
            .collect();
        Self {
            instances: RwLock::new(map),
            ..Self::default()
        }
    }

    pub async fn insert(&self, instance: ManagedInstance) {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance);
    }

    /// Last lifecycle state recorded for an instance.
    pub async fn state(&self, id: &InstanceId) -> Option<LifecycleState> {
        self.states.read().await.get(id).copied()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn instance(&self, id: &InstanceId) -> Result<ManagedInstance, RepositoryError> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::UnknownInstance(id.clone()))
    }

    async fn instances(&self) -> Result<Vec<ManagedInstance>, RepositoryError> {
        let mut all: Vec<_> = self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn record_state(
        &self,
        id: &InstanceId,
        state: LifecycleState,
    ) -> Result<(), RepositoryError> {
        self.states.write().await.insert(id.clone(), state);
        Ok(())
    }

    async fn artifacts(&self) -> Result<Vec<BackupArtifact>, RepositoryError> {
        Ok(self.artifacts.read().await.values().cloned().collect())
    }

    async fn artifact(&self, name: &str) -> Result<Option<BackupArtifact>, RepositoryError> {
        Ok(self.artifacts.read().await.get(name).cloned())
    }

    async fn record_artifact(&self, artifact: BackupArtifact) -> Result<(), RepositoryError> {
        self.artifacts
            .write()
            .await
            .insert(artifact.name.clone(), artifact);
        Ok(())
    }

    async fn remove_artifact(
        &self,
        name: &str,
    ) -> Result<Option<BackupArtifact>, RepositoryError> {
        Ok(self.artifacts.write().await.remove(name))
    }
}
