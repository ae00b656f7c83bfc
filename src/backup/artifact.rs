use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{instance::InstanceId, utils::file_stamp};

pub const ARTIFACT_EXTENSION: &str = ".tar.gz";

const STAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3fZ";

/// An immutable snapshot of one instance's working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    /// File name, unique across all instances.
    pub name: String,
    pub instance: InstanceId,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Whether a copy is known to exist in the remote store.
    pub remote: bool,
}

/// Name prefix shared by every artifact of an instance.
pub fn instance_prefix(instance_name: &str) -> String {
    let safe: String = instance_name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}_")
}

pub fn artifact_name(instance_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{}{ARTIFACT_EXTENSION}",
        instance_prefix(instance_name),
        file_stamp(at)
    )
}

/// Reads the creation time back out of a generated artifact name.
pub(crate) fn stamp_of(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(ARTIFACT_EXTENSION)?;
    let (_, stamp) = stem.rsplit_once('_')?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
