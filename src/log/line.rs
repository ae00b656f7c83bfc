use std::fmt::{self, Display};

use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;

use crate::{instance::InstanceId, utils::extract_clock};

use super::LogEvent;

/// Identifies where a buffered line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Operator command written to the process input.
    Command,
    /// Command or response relayed over RCON.
    Rcon,
}

/// One captured line of output. Immutable once appended to a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// Position within the instance's stream, assigned on append.
    pub seq: u64,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Wall-clock prefix the server printed, if any. Carries no date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_time: Option<NaiveTime>,
    pub instance: InstanceId,
    pub source: LogSource,
    pub text: String,
    pub event: Option<LogEvent>,
}

impl LogLine {
    pub fn new<S: Into<String>>(
        instance: InstanceId,
        source: LogSource,
        text: S,
        event: Option<LogEvent>,
    ) -> Self {
        let text = text.into();
        let server_time = match source {
            LogSource::Stdout | LogSource::Stderr => extract_clock(&text),
            LogSource::Command | LogSource::Rcon => None,
        };

        Self {
            seq: 0,
            timestamp: Utc::now(),
            server_time,
            instance,
            source,
            text,
            event,
        }
    }

    pub fn stdout<S: Into<String>>(instance: InstanceId, text: S) -> Self {
        Self::new(instance, LogSource::Stdout, text, None)
    }

    pub fn command<S: Into<String>>(instance: InstanceId, text: S) -> Self {
        Self::new(instance, LogSource::Command, format!("> {}", text.into()), None)
    }
}

impl Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            LogSource::Stderr => write!(f, "[STDERR] {}", self.text),
            _ => write!(f, "{}", self.text),
        }
    }
}
