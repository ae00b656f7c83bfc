//! Log line classification.
//!
//! [`classify`] is the single place where raw server output is given meaning.
//! Rules are mutually exclusive; the first match wins and a line yields at most
//! one [`LogEvent`].

use std::sync::LazyLock;

use regex::Regex;

use crate::log::{LogEvent, LogMeta};

static DONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Done \([0-9.,]+m?s\)!").expect("valid done regex"));

static JOINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.\-]{1,32}) joined the game$").expect("valid join regex")
});

static LEFT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.\-]{1,32}) left the game$").expect("valid leave regex")
});

static PLAYER_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"There are (\d+)(?: of a max(?: of)? |/)(\d+) players").expect("valid count regex")
});

static PLUGIN_JAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Could not load '(?:[^']*/)?([^'/]+?)(?:\.jar)?'").expect("valid plugin regex")
});

static PLUGIN_ENABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Error occurred while enabling (\S+)").expect("valid plugin regex")
});

const HELP_PROMPT: &str = "For help, type";
const OUT_OF_MEMORY: &str = "OutOfMemoryError";
const CRASH_MARKERS: [&str; 4] = [
    "Exception in server tick loop",
    "This crash report has been saved to",
    "---- Minecraft Crash Report ----",
    "Minecraft has crashed",
];
const OVERLOADED: &str = "Can't keep up!";

/// Maps one output line to at most one event. Pure and deterministic.
pub fn classify(line: &str) -> Option<LogEvent> {
    let msg = LogMeta::parse(line)
        .map(|meta| meta.msg)
        .unwrap_or(line)
        .trim();

    if DONE.is_match(msg) && msg.contains(HELP_PROMPT) {
        return Some(LogEvent::ReadySignal);
    }

    if let Some(caps) = JOINED.captures(msg) {
        return Some(LogEvent::PlayerJoined {
            name: caps[1].to_string(),
        });
    }

    if let Some(caps) = LEFT.captures(msg) {
        return Some(LogEvent::PlayerLeft {
            name: caps[1].to_string(),
        });
    }

    if let Some(caps) = PLAYER_COUNT.captures(msg) {
        if let (Ok(current), Ok(max)) = (caps[1].parse(), caps[2].parse()) {
            return Some(LogEvent::PlayerCount { current, max });
        }
    }

    if msg.contains(OUT_OF_MEMORY) {
        return Some(LogEvent::OutOfMemory);
    }

    if let Some(caps) = PLUGIN_JAR
        .captures(msg)
        .or_else(|| PLUGIN_ENABLE.captures(msg))
    {
        return Some(LogEvent::PluginLoadFailed {
            name: caps[1].to_string(),
        });
    }

    if CRASH_MARKERS.iter().any(|marker| msg.contains(marker)) {
        return Some(LogEvent::CrashDetected);
    }

    if msg.contains(OVERLOADED) {
        return Some(LogEvent::PerformanceWarning);
    }

    None
}
