//! Remote object stores used to mirror backup artifacts.

mod local;
#[cfg(feature = "webdav")]
mod webdav;

use std::{fmt::Debug, path::Path, sync::Arc};

use async_trait::async_trait;

use crate::{config::BackupSettings, error::StoreError};

pub use local::LocalStore;
#[cfg(feature = "webdav")]
pub use webdav::WebDavStore;

/// A named blob held by a remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub name: String,
    pub size: Option<u64>,
}

#[async_trait]
pub trait ObjectStore: Debug + Send + Sync {
    /// Uploads the file at `source` under `name`, replacing any existing object.
    async fn upload(&self, name: &str, source: &Path) -> Result<(), StoreError>;

    /// Downloads `name` into `dest`; [`StoreError::NotFound`] if absent.
    async fn download(&self, name: &str, dest: &Path) -> Result<(), StoreError>;

    /// Objects whose name starts with `prefix`, sorted by name.
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// Builds the configured remote, preferring WebDAV over a mirror directory.
pub fn from_settings(settings: &BackupSettings) -> Result<Option<Arc<dyn ObjectStore>>, StoreError> {
    #[cfg(feature = "webdav")]
    if let Some(dav) = &settings.webdav {
        return Ok(Some(Arc::new(WebDavStore::new(dav)?)));
    }

    Ok(settings
        .mirror_dir
        .as_ref()
        .map(|dir| Arc::new(LocalStore::new(dir.clone())) as Arc<dyn ObjectStore>))
}

/// Object names are flat; anything that could address another location is refused.
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(StoreError::Request(format!("invalid object name {name:?}")));
    }
    Ok(())
}
