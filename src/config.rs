//! Daemon configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or [`CoreConfig::default`]) is a
//! valid configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::ConfigError, instance::ManagedInstance};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub logs: LogSettings,
    pub supervisor: SupervisorSettings,
    pub rcon: RconSettings,
    pub backup: BackupSettings,
    pub logging: LoggingSettings,
    /// Instance records used to seed an in-memory repository.
    pub instances: Vec<ManagedInstance>,
}

impl CoreConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        info!(
            path = %path.display(),
            instances = config.instances.len(),
            "loaded configuration"
        );
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

/// Log buffering and fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Lines kept per instance.
    pub buffer_capacity: usize,
    /// Lines replayed to a new subscriber.
    pub subscribe_backlog: usize,
    /// Lines queued per subscriber before deliveries are dropped.
    pub subscriber_capacity: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            subscribe_backlog: 50,
            subscriber_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub grace_secs: u64,
    pub restart_settle_ms: u64,
    /// Console command that asks the server to shut down cleanly.
    pub stop_command: String,
    /// How long `stop` keeps waiting after the forced kill was issued.
    pub kill_wait_secs: u64,
    /// Longest a console write may wait on a process that stopped reading input.
    pub command_timeout_ms: u64,
}

impl SupervisorSettings {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.kill_wait_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_secs: 30,
            restart_settle_ms: 2000,
            stop_command: "stop".to_string(),
            kill_wait_secs: 5,
            command_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RconSettings {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl RconSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for RconSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Where local artifacts are written.
    pub directory: PathBuf,
    /// Sent to a running instance before archiving.
    pub quiesce_commands: Vec<String>,
    /// Sent to a running instance after archiving.
    pub resume_commands: Vec<String>,
    pub quiesce_settle_ms: u64,
    pub webdav: Option<WebDavSettings>,
    /// Mounted directory used as the remote mirror when no WebDAV endpoint is set.
    pub mirror_dir: Option<PathBuf>,
}

impl BackupSettings {
    pub fn quiesce_settle(&self) -> Duration {
        Duration::from_millis(self.quiesce_settle_ms)
    }
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("backups"),
            quiesce_commands: vec!["save-off".to_string(), "save-all flush".to_string()],
            resume_commands: vec!["save-on".to_string()],
            quiesce_settle_ms: 1000,
            webdav: None,
            mirror_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebDavSettings {
    /// Collection URL artifacts are stored under.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_webdav_timeout")]
    pub timeout_secs: u64,
}

fn default_webdav_timeout() -> u64 {
    300
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::LaunchSpec;

    #[test]
    fn empty_config_uses_defaults() {
        let config = CoreConfig::parse("").unwrap();
        assert_eq!(config.logs.buffer_capacity, 1000);
        assert_eq!(config.logs.subscribe_backlog, 50);
        assert_eq!(config.supervisor.grace(), Duration::from_secs(30));
        assert_eq!(config.supervisor.stop_command, "stop");
        assert_eq!(config.rcon.timeout(), Duration::from_secs(10));
        assert!(config.backup.webdav.is_none());
        assert!(config.instances.is_empty());
    }

    #[test]
    fn parses_instances_and_remote() {
        let config = CoreConfig::parse(
            r#"
            [supervisor]
            grace_secs = 10

            [backup]
            directory = "/srv/backups"

            [backup.webdav]
            url = "https://dav.example.com/backups/"
            username = "ops"
            password = "secret"

            [[instances]]
            id = "survival"
            name = "survival"
            working_dir = "/srv/survival"
            memory_mb = 4096
            launch = { kind = "java", jar = "server.jar" }
            rcon = { host = "127.0.0.1", port = 25575, password = "pw" }
            "#,
        )
        .unwrap();

        assert_eq!(config.supervisor.grace_secs, 10);
        assert_eq!(config.supervisor.restart_settle_ms, 2000);
        assert_eq!(config.backup.directory, PathBuf::from("/srv/backups"));
        let dav = config.backup.webdav.unwrap();
        assert_eq!(dav.timeout_secs, 300);
        assert_eq!(dav.username.as_deref(), Some("ops"));

        let inst = &config.instances[0];
        assert_eq!(inst.id.as_str(), "survival");
        assert_eq!(inst.memory_mb, Some(4096));
        assert!(matches!(inst.launch, LaunchSpec::Java { .. }));
        assert_eq!(inst.rcon.as_ref().unwrap().address(), "127.0.0.1:25575");
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            CoreConfig::parse("[logs\nbuffer_capacity = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
