// src/config/duration.rs

use crate::error::{Error, Result};
use std::time::Duration;

/// Parse a duration string like "30s", "45m", "2h", "1d" or "1w"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::ConfigError("Empty duration".to_string()));
    }

    let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| Error::ConfigError(format!("Invalid duration number: {}", s)))?;

    let multiplier: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 604800,
        _ => {
            return Err(Error::ConfigError(format!(
                "Invalid duration unit in '{}' (expected s, m, h, d or w)",
                s
            )));
        }
    };
    let seconds = num
        .checked_mul(multiplier)
        .ok_or_else(|| Error::ConfigError(format!("Duration out of range: {}", s)))?;

    Ok(Duration::from_secs(seconds))
}

/// Parse a repetition interval: a positive duration the scheduler can
/// represent
pub fn parse_interval(s: &str) -> Result<Duration> {
    let interval = parse_duration(s)?;
    if interval.is_zero() {
        return Err(Error::ConfigError(format!(
            "Interval must be positive: {}",
            s
        )));
    }
    if chrono::Duration::from_std(interval).is_err() {
        return Err(Error::ConfigError(format!("Interval out of range: {}", s)));
    }
    Ok(interval)
}
