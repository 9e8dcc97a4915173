//! Small shared helpers: local ISO timestamps, env-backed numeric knobs.

use chrono::{DateTime, FixedOffset, Local, NaiveDate};

/// Local timestamp in the gateway's canonical `%Y-%m-%dT%H:%M:%S%z` form.
pub fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%z").to_string()
}

/// Parses the canonical timestamp form; anything else yields `None`.
pub fn parse_iso_ts(raw: &str) -> Option<DateTime<FixedOffset>> {
    let src = raw.trim();
    if src.is_empty() {
        return None;
    }
    DateTime::parse_from_str(src, "%Y-%m-%dT%H:%M:%S%z").ok()
}

/// Today's local date key, `YYYY-MM-DD`.
pub fn today_key_local() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Local date key from a stored timestamp; tolerates a bare `YYYY-MM-DD` prefix.
pub fn date_key_from_iso(raw: &str) -> String {
    if let Some(ts) = parse_iso_ts(raw) {
        return ts.with_timezone(&Local).format("%Y-%m-%d").to_string();
    }
    let text = raw.trim();
    if text.len() >= 10 && NaiveDate::parse_from_str(&text[..10], "%Y-%m-%d").is_ok() {
        return text[..10].to_string();
    }
    String::new()
}

/// Boolean env parsing: `1/true/yes/on` and `0/false/no/off`; anything else is the default.
pub fn bool_from_env(raw: Option<&str>, default: bool) -> bool {
    let Some(raw) = raw else { return default };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// Integer env parsing clamped to `[minimum, maximum]`; unparsable falls back to the default.
pub fn int_from_env(raw: Option<&str>, default: i64, minimum: i64, maximum: i64) -> i64 {
    let value = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(default);
    value.clamp(minimum, maximum)
}

/// Reads a named env var through [`int_from_env`].
pub fn int_env_var(name: &str, default: i64, minimum: i64, maximum: i64) -> i64 {
    let raw = std::env::var(name).ok();
    int_from_env(raw.as_deref(), default, minimum, maximum)
}
