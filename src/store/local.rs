use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::StoreError;

use super::{ObjectStore, RemoteObject, validate_name};

/// Object store over a directory, e.g. a mounted network share.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

fn not_found(name: &str, err: std::io::Error) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(name.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn upload(&self, name: &str, source: &Path) -> Result<(), StoreError> {
        let dest = self.path_of(name)?;
        fs::create_dir_all(&self.root).await?;

        // Copy beside the target, then rename, so readers never see a partial object.
        let partial = self.root.join(format!(".{name}.partial"));
        fs::copy(source, &partial).await?;
        fs::rename(&partial, &dest).await?;
        debug!(name, root = %self.root.display(), "object stored");
        Ok(())
    }

    async fn download(&self, name: &str, dest: &Path) -> Result<(), StoreError> {
        let source = self.path_of(name)?;
        fs::copy(&source, dest)
            .await
            .map_err(|e| not_found(name, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_file() {
                objects.push(RemoteObject {
                    name,
                    size: Some(meta.len()),
                });
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_of(name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found(name, e))
    }
}
