//! Backup artifacts and the coordinator that creates, restores, mirrors and
//! deletes them.

mod artifact;
mod coordinator;

pub use artifact::{ARTIFACT_EXTENSION, BackupArtifact, artifact_name, instance_prefix};
pub use coordinator::{BackupCoordinator, DeleteReport};
