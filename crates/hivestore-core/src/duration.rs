//! Human-readable duration strings
//!
//! Accepted units: `s`, `m`, `h`, `d`, with decimal values and optional
//! whitespace between number and unit. Non-positive and non-finite values
//! are rejected, as are other suffixes (`w`, `ms`, ...).

use std::time::Duration;

use crate::error::{Result, StoreError};

/// Parse a duration string such as `"30s"`, `"1.5h"` or `"7 d"`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();

    let invalid = |reason: &str| StoreError::Validation {
        field: "ttl".to_string(),
        reason: format!("invalid duration '{input}': {reason}"),
    };

    if s.is_empty() {
        return Err(invalid("empty string"));
    }

    let unit_at = s
        .find(|c: char| c != '.' && c != '-' && c != '+' && !c.is_ascii_digit())
        .ok_or_else(|| invalid("missing unit (valid: s, m, h, d)"))?;

    let (number_part, unit_part) = s.split_at(unit_at);
    let number: f64 = number_part
        .trim_end()
        .parse()
        .map_err(|_| invalid("expected a number before the unit"))?;

    let multiplier_ms: f64 = match unit_part.trim_start() {
        "s" => 1_000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        other => return Err(invalid(&format!("unknown unit '{other}' (valid: s, m, h, d)"))),
    };

    if !number.is_finite() {
        return Err(invalid("value must be finite"));
    }

    let millis = number * multiplier_ms;
    if millis <= 0.0 {
        return Err(invalid("duration must be positive"));
    }

    Ok(Duration::from_millis(millis.round() as u64))
}
