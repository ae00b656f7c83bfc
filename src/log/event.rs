use std::fmt::{self, Display};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Structured meaning extracted from a single output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    ReadySignal,
    PlayerJoined { name: String },
    PlayerLeft { name: String },
    PlayerCount { current: u32, max: u32 },
    CrashDetected,
    OutOfMemory,
    PluginLoadFailed { name: String },
    PerformanceWarning,
}

impl LogEvent {
    pub fn severity(&self) -> Severity {
        match self {
            LogEvent::OutOfMemory | LogEvent::CrashDetected => Severity::Critical,
            LogEvent::PluginLoadFailed { .. } | LogEvent::PerformanceWarning => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::ReadySignal => write!(f, "server ready"),
            LogEvent::PlayerJoined { name } => write!(f, "{name} joined"),
            LogEvent::PlayerLeft { name } => write!(f, "{name} left"),
            LogEvent::PlayerCount { current, max } => write!(f, "{current}/{max} players"),
            LogEvent::CrashDetected => write!(f, "crash detected"),
            LogEvent::OutOfMemory => write!(f, "out of memory"),
            LogEvent::PluginLoadFailed { name } => write!(f, "plugin {name} failed to load"),
            LogEvent::PerformanceWarning => write!(f, "server overloaded"),
        }
    }
}
