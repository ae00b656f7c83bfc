use std::fmt::{self, Display};

/// Prefix fields of a server log line, borrowed from the raw text.
///
/// Understands the vanilla layout `[12:00:00] [Server thread/INFO]: msg` and the
/// Bukkit-style `[12:00:00 INFO]: msg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMeta<'a> {
    pub time: &'a str,
    pub thread: Option<&'a str>,
    pub level: LogLevel,
    pub msg: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Other,
}

impl LogLevel {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "INFO" => LogLevel::Info,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" | "SEVERE" | "FATAL" => LogLevel::Error,
            _ => LogLevel::Other,
        }
    }
}

impl<'a> LogMeta<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();

        if !line.starts_with('[') {
            return None;
        }

        let time_end = line.find(']')?;
        let head = &line[1..time_end];
        let rest = line[time_end + 1..].trim_start();

        if let Some(msg) = rest.strip_prefix(": ") {
            // Bukkit layout: time and level share the first bracket.
            let (time, level) = head.rsplit_once(' ')?;
            return Some(LogMeta {
                time,
                thread: None,
                level: LogLevel::parse(level),
                msg,
            });
        }

        let rest = rest.strip_prefix('[')?;
        let msg_sep = rest.find("]: ")?;
        let meta = &rest[..msg_sep];
        let msg = &rest[msg_sep + 3..];

        let (thread, level) = meta.rsplit_once('/')?;

        Some(LogMeta {
            time: head,
            thread: Some(thread),
            level: LogLevel::parse(level),
            msg,
        })
    }
}

impl Display for LogMeta<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Time: {}\nThread: {}\nLevel: {}\nMessage: {}",
            self.time,
            self.thread.unwrap_or("-"),
            self.level,
            self.msg
        )
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Other => write!(f, "OTHER"),
        }
    }
}
