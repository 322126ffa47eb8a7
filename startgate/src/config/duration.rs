//! Duration and boolean values as the service writes them in its settings.
//!
//! Durations are accepted as plain integer seconds (`30`), as unit strings
//! (`1h 20m 10s`, `2weeks`) or as ISO-8601 durations (`PT30S`, `P1DT2H`).
//! ISO years and months count as 365 and 30 days.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static UNIT_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<weeks>\d+)(?:weeks|week|w))?(?:(?P<days>\d+)(?:days|day|d))?(?:(?P<hours>\d+)(?:hours|hour|h))?(?:(?P<minutes>\d+)(?:minutes|minute|m))?(?:(?P<seconds>\d+)(?:seconds|second|s))?$",
    )
    .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^P(?:(?P<years>\d+)Y)?(?:(?P<months>\d+)M)?(?:(?P<weeks>\d+)W)?(?:(?P<days>\d+)D)?(?:T(?:(?P<hours>\d+)H)?(?:(?P<minutes>\d+)M)?(?:(?P<seconds>\d+)S)?)?$",
    )
    .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

const UNITS: [(&str, u64); 7] = [
    ("years", 365 * 86_400),
    ("months", 30 * 86_400),
    ("weeks", 7 * 86_400),
    ("days", 86_400),
    ("hours", 3_600),
    ("minutes", 60),
    ("seconds", 1),
];

/// Parses a duration string.
///
/// Whitespace is ignored. Returns a description of the problem on failure.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let compact: String = value.split_whitespace().collect();
    if compact.is_empty() {
        return Err("empty duration".to_string());
    }

    if let Ok(seconds) = compact.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let upper = compact.to_ascii_uppercase();
    if upper.starts_with('P') {
        let captures = ISO_DURATION
            .captures(&upper)
            .ok_or_else(|| format!("not an ISO-8601 duration: '{value}'"))?;
        return total(&captures, value);
    }

    let lower = compact.to_ascii_lowercase();
    let captures = UNIT_DURATION
        .captures(&lower)
        .ok_or_else(|| format!("not a duration: '{value}'"))?;
    total(&captures, value)
}

fn total(captures: &regex::Captures<'_>, original: &str) -> Result<Duration, String> {
    let mut seconds: u64 = 0;
    let mut components = 0;
    for (name, factor) in UNITS {
        let Some(m) = captures.name(name) else { continue };
        components += 1;
        let amount: u64 = m
            .as_str()
            .parse()
            .map_err(|_| format!("duration component too large: '{original}'"))?;
        let part = amount
            .checked_mul(factor)
            .ok_or_else(|| format!("duration overflows: '{original}'"))?;
        seconds = seconds
            .checked_add(part)
            .ok_or_else(|| format!("duration overflows: '{original}'"))?;
    }
    if components == 0 {
        return Err(format!("duration without components: '{original}'"));
    }
    Ok(Duration::from_secs(seconds))
}

/// Parses a boolean setting: `1`/`yes`/`true` or `0`/`no`/`false`,
/// case-insensitively.
pub fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" => Ok(true),
        "0" | "no" | "false" => Ok(false),
        other => Err(format!("unable to convert '{other}' to a boolean")),
    }
}
