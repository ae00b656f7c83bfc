use std::{fmt, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::instance::InstanceId;

/// Flat classification of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AlreadyRunning,
    NotRunning,
    ExecutableMissing,
    AuthenticationFailed,
    Timeout,
    ConnectionLost,
    ArtifactNotFound,
    InstanceBusy,
    PathTraversalRejected,
    IoFailure,
    RestoreIncomplete,
    UnknownInstance,
    RemoteFailure,
    Protocol,
    InvalidConfig,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::NotRunning => "not_running",
            ErrorKind::ExecutableMissing => "executable_missing",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::ArtifactNotFound => "artifact_not_found",
            ErrorKind::InstanceBusy => "instance_busy",
            ErrorKind::PathTraversalRejected => "path_traversal_rejected",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::RestoreIncomplete => "restore_incomplete",
            ErrorKind::UnknownInstance => "unknown_instance",
            ErrorKind::RemoteFailure => "remote_failure",
            ErrorKind::Protocol => "protocol",
            ErrorKind::InvalidConfig => "invalid_config",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("Repository storage failure: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepositoryError::UnknownInstance(_) => ErrorKind::UnknownInstance,
            RepositoryError::Storage(_) => ErrorKind::IoFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Server {0} is already running")]
    AlreadyRunning(InstanceId),

    #[error("Server {0} is not running")]
    NotRunning(InstanceId),

    #[error("Launch executable not found: {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("Invalid server root directory: {}", .0.display())]
    InvalidDirectory(PathBuf),

    #[error("Failed to spawn server process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to access child stdout pipe")]
    NoStdoutPipe,

    #[error("Failed to access child stdin pipe")]
    NoStdinPipe,

    #[error("Failed to access child stderr pipe")]
    NoStderrPipe,

    #[error("Failed to write to stdin: {0}")]
    StdinWriteFailed(#[source] std::io::Error),

    #[error("Server {0} did not exit in time")]
    StopTimeout(InstanceId),

    #[error("Server {0} is not reading its console input")]
    InputStalled(InstanceId),

    #[error("Server {0} is held for maintenance")]
    InMaintenance(InstanceId),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            ServerError::NotRunning(_) => ErrorKind::NotRunning,
            ServerError::ExecutableMissing(_) => ErrorKind::ExecutableMissing,
            ServerError::InvalidDirectory(_) => ErrorKind::ExecutableMissing,
            ServerError::StopTimeout(_) | ServerError::InMaintenance(_) => ErrorKind::InstanceBusy,
            ServerError::InputStalled(_) => ErrorKind::Timeout,
            ServerError::SpawnFailed(_)
            | ServerError::NoStdoutPipe
            | ServerError::NoStdinPipe
            | ServerError::NoStderrPipe
            | ServerError::StdinWriteFailed(_) => ErrorKind::IoFailure,
            ServerError::Repository(e) => e.kind(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RconError {
    #[error("No RCON endpoint configured for {0}")]
    NotConfigured(InstanceId),

    #[error("Failed to connect to RCON endpoint {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("RCON authentication failed")]
    AuthenticationFailed,

    #[error("RCON request timed out after {0:?}")]
    Timeout(Duration),

    #[error("RCON connection lost: {0}")]
    ConnectionLost(#[source] std::io::Error),

    #[error("RCON payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Malformed RCON packet: {0}")]
    MalformedPacket(String),
}

impl RconError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RconError::NotConfigured(_) => ErrorKind::NotRunning,
            RconError::Connect { .. } | RconError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            RconError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            RconError::Timeout(_) => ErrorKind::Timeout,
            RconError::PayloadTooLarge(_) | RconError::MalformedPacket(_) => ErrorKind::Protocol,
        }
    }

    /// Whether the session that produced this error must be discarded.
    pub fn poisons_session(&self) -> bool {
        matches!(
            self,
            RconError::Timeout(_)
                | RconError::ConnectionLost(_)
                | RconError::MalformedPacket(_)
                | RconError::AuthenticationFailed
        )
    }
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive entry escapes the target directory: {}", .0.display())]
    PathTraversalRejected(PathBuf),

    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Archive operation cancelled")]
    Cancelled,

    #[error("Archive task failed: {0}")]
    Task(String),

    #[error("Archive I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::PathTraversalRejected(_) => ErrorKind::PathTraversalRejected,
            _ => ErrorKind::IoFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Remote store answered {status} for {name}")]
    Status { status: u16, name: String },

    #[error("Remote request failed: {0}")]
    Request(String),

    #[error("Unreadable remote listing: {0}")]
    Listing(String),

    #[error("Remote store I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::ArtifactNotFound,
            StoreError::Io(_) => ErrorKind::IoFailure,
            _ => ErrorKind::RemoteFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Instance {0} is busy")]
    InstanceBusy(InstanceId),

    #[error("No remote store configured")]
    NoRemote,

    #[error(
        "Restore of {artifact} into {instance} failed after the working directory was wiped; \
         recover from the intact artifact: {source}"
    )]
    RestoreIncomplete {
        instance: InstanceId,
        artifact: String,
        #[source]
        source: ArchiveError,
    },

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Backup I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
            BackupError::InstanceBusy(_) => ErrorKind::InstanceBusy,
            BackupError::NoRemote => ErrorKind::InvalidConfig,
            BackupError::RestoreIncomplete { .. } => ErrorKind::RestoreIncomplete,
            BackupError::Archive(e) => e.kind(),
            BackupError::Store(e) => e.kind(),
            BackupError::Server(e) => e.kind(),
            BackupError::Repository(e) => e.kind(),
            BackupError::Io(_) => ErrorKind::IoFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Crate-level error returned by the [`crate::Core`] facade.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Rcon(#[from] RconError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Server(e) => e.kind(),
            Error::Rcon(e) => e.kind(),
            Error::Backup(e) => e.kind(),
            Error::Repository(e) => e.kind(),
            Error::Config(_) => ErrorKind::InvalidConfig,
            Error::Io(_) => ErrorKind::IoFailure,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
