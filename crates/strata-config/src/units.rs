//! Human-readable sizes and durations.

use std::time::Duration;

use crate::ConfigError;

/// Parse a size like `"100kb"`, `"50MiB"`, `"2g"` or `"4096"` into bytes.
///
/// Units are binary (1k = 1024).
pub fn parse_size(raw: &str) -> Result<u64, ConfigError> {
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(ConfigError::Invalid("size must not be empty".into()));
    }

    let s = if let Some(stripped) = s.strip_suffix("ib") {
        stripped
    } else {
        s.strip_suffix('b').unwrap_or(s.as_str())
    };

    let (num_str, multiplier) = match s.as_bytes().last() {
        Some(b'k') => (&s[..s.len() - 1], 1024u64),
        Some(b'm') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(b't') => (&s[..s.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid size: '{raw}'")))?;
    if !num.is_finite() || num < 0.0 {
        return Err(ConfigError::Invalid(format!("invalid size: '{raw}'")));
    }
    Ok((num * multiplier as f64) as u64)
}

/// Parse a duration like `"30s"`, `"15m"`, `"4h"`, `"2d"` or `"1w"`.
///
/// A bare number is taken as days.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let input = raw.trim();
    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        Some(_) => (input, None),
        None => return Err(ConfigError::Invalid("duration must not be empty".into())),
    };

    let value: u64 = num_part
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit.map(|c| c.to_ascii_lowercase()) {
        Some('s') => value,
        Some('m') => value.saturating_mul(60),
        Some('h') => value.saturating_mul(60 * 60),
        Some('d') | None => value.saturating_mul(60 * 60 * 24),
        Some('w') => value.saturating_mul(60 * 60 * 24 * 7),
        Some(other) => {
            return Err(ConfigError::Invalid(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use s/m/h/d/w)"
            )));
        }
    };

    if secs == 0 {
        return Err(ConfigError::Invalid("duration must be greater than zero".into()));
    }
    Ok(Duration::from_secs(secs))
}
