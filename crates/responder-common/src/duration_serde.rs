//! Human-readable `Duration` (de)serialization: `"250ms"`, `"5s"`, `"2m"`, `"1h"`.
//! Sub-millisecond values round-trip as `"us"` or `"ns"`.
//!
//! Use with `#[serde(with = "responder_common::duration_serde")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let nanos = duration.as_nanos();
    let text = if nanos % 1_000_000_000 == 0 {
        format!("{}s", nanos / 1_000_000_000)
    } else if nanos % 1_000_000 == 0 {
        format!("{}ms", nanos / 1_000_000)
    } else if nanos % 1_000 == 0 {
        format!("{}us", nanos / 1_000)
    } else {
        format!("{}ns", nanos)
    };
    serializer.serialize_str(&text)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parse a duration string. A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |num_str: &str| -> Result<u64, String> {
        num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid duration: {}", s))
    };

    let scaled = |num_str: &str, factor: u64| -> Result<Duration, String> {
        parse(num_str)?
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration out of range: {}", s))
    };

    // Multi-letter suffixes first: they all end with 's'.
    if let Some(num) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(num)?))
    } else if let Some(num) = s.strip_suffix("us") {
        Ok(Duration::from_micros(parse(num)?))
    } else if let Some(num) = s.strip_suffix("ns") {
        Ok(Duration::from_nanos(parse(num)?))
    } else if let Some(num) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(num)?))
    } else if let Some(num) = s.strip_suffix('m') {
        scaled(num, 60)
    } else if let Some(num) = s.strip_suffix('h') {
        scaled(num, 3600)
    } else {
        Ok(Duration::from_secs(parse(s)?))
    }
}
