use std::sync::LazyLock;

use chrono::{DateTime, NaiveTime, Utc};
use regex::Regex;

static LEADING_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\d{2}:\d{2}:\d{2})[\] ]").expect("valid time regex"));

/// Reads the `[HH:MM:SS]` prefix of a server log line.
pub fn extract_clock(input: &str) -> Option<NaiveTime> {
    let time_s = LEADING_TIME.captures(input)?;
    NaiveTime::parse_from_str(&time_s[1], "%H:%M:%S").ok()
}

/// Filesystem- and URL-safe ISO-8601 stamp used in artifact names.
pub fn file_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string()
}
