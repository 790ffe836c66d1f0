// ABOUTME: Heuristic type inference for untyped attribute strings
// ABOUTME: Null, then date-like, then numeric, then text - in that order

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use super::model::RawValue;

static DATE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+-\d\d-\d\d").expect("valid date pattern"));

/// Infer the type of a raw attribute string.
///
/// Rules, first match wins:
/// 1. `None` or empty → `Null`
/// 2. starts with `digits-dd-dd` → `Timestamp` (a bare trailing `Z` with no
///    time of day means midnight UTC)
/// 3. only digits once `.` and `-` are removed → `Integer` when the value has
///    no fractional part, otherwise `Float`
/// 4. anything else → `Text`, verbatim
///
/// This is best-effort inference: text such as `"2021-01-01 batch"` looks
/// date-like and a code such as `"12-34"` looks numeric. A value that matches
/// a rule but cannot actually be parsed falls through to the next rule.
pub fn coerce(raw: Option<&str>) -> RawValue {
    let Some(raw) = raw else {
        return RawValue::Null;
    };
    if raw.is_empty() {
        return RawValue::Null;
    }

    if DATE_PREFIX.is_match(raw) {
        if let Some(ts) = parse_timestamp(raw) {
            return RawValue::Timestamp(ts);
        }
        tracing::debug!("Date-like value {:?} did not parse as a timestamp", raw);
    }

    if looks_numeric(raw) {
        // Whole numbers parse exactly; f64 only holds 53 bits of mantissa
        if !raw.contains('.') {
            if let Ok(value) = raw.parse::<i64>() {
                return RawValue::Integer(value);
            }
        }
        if let Ok(value) = raw.parse::<f64>() {
            return classify_number(value);
        }
    }

    RawValue::Text(raw.to_string())
}

/// Digits only, once every `.` and `-` is removed.
fn looks_numeric(raw: &str) -> bool {
    let mut digits = raw.chars().filter(|c| *c != '.' && *c != '-').peekable();
    digits.peek().is_some() && digits.all(|c| c.is_ascii_digit())
}

fn classify_number(value: f64) -> RawValue {
    if value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64 {
        RawValue::Integer(value as i64)
    } else {
        RawValue::Float(value)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();

    // "2021-06-30Z": date with a zone marker but no time of day
    let normalized = match trimmed.strip_suffix('Z') {
        Some(date) if !date.contains('T') && !date.contains(' ') => {
            format!("{}T00:00:00Z", date)
        }
        _ => trimmed.to_string(),
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(ts.with_timezone(&Utc));
    }

    let naive = normalized.trim_end_matches('Z');
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(dt.and_utc());
        }
    }

    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
