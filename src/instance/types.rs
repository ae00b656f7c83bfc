use std::{
    collections::BTreeSet,
    fmt::{self, Display},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Stable identity of a managed instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How the server process is launched from its working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchSpec {
    /// A program (relative paths resolve inside the working directory) and its arguments.
    Executable {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A server jar started through a JVM.
    Java {
        #[serde(default = "default_java")]
        java: PathBuf,
        jar: PathBuf,
        #[serde(default)]
        jvm_flags: Vec<String>,
        #[serde(default = "default_server_args")]
        args: Vec<String>,
    },
}

fn default_java() -> PathBuf {
    PathBuf::from("java")
}

fn default_server_args() -> Vec<String> {
    vec!["nogui".to_string()]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RconEndpoint {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl RconEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration record of one managed instance; read-only input owned by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedInstance {
    pub id: InstanceId,
    pub name: String,
    pub working_dir: PathBuf,
    pub launch: LaunchSpec,
    /// Memory ceiling in MiB, passed as `-Xmx` for JVM launches.
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub rcon: Option<RconEndpoint>,
}

/// A launch command with its executable already resolved against the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ManagedInstance {
    /// Resolves the launch executable inside the working directory.
    pub fn resolve_launch(&self) -> Result<ResolvedLaunch, ServerError> {
        if !self.working_dir.is_dir() {
            return Err(ServerError::InvalidDirectory(self.working_dir.clone()));
        }

        match &self.launch {
            LaunchSpec::Executable { program, args } => {
                let program = resolve_in(&self.working_dir, program)?;
                Ok(ResolvedLaunch {
                    program,
                    args: args.clone(),
                })
            }
            LaunchSpec::Java {
                java,
                jar,
                jvm_flags,
                args,
            } => {
                let jar = resolve_in(&self.working_dir, jar)?;
                let mut full_args = Vec::new();
                if let Some(memory) = self.memory_mb {
                    full_args.push(format!("-Xmx{memory}M"));
                }
                full_args.extend(jvm_flags.iter().cloned());
                full_args.push("-jar".to_string());
                full_args.push(jar.to_string_lossy().into_owned());
                full_args.extend(args.iter().cloned());
                Ok(ResolvedLaunch {
                    program: java.clone(),
                    args: full_args,
                })
            }
        }
    }
}

fn resolve_in(root: &Path, path: &Path) -> Result<PathBuf, ServerError> {
    let full = if path.is_relative() {
        root.join(path)
    } else {
        path.to_path_buf()
    };

    if full.is_file() {
        Ok(full)
    } else {
        Err(ServerError::ExecutableMissing(full))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a supervised instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub online: BTreeSet<String>,
    pub player_count: Option<u32>,
    pub max_players: Option<u32>,
}
