//! Price change formatting and parsing.
//!
//! The feed reports each change as a display string (`"1.23%"`, `"-0.5%"`)
//! alongside a `positive` flag. These helpers produce and read that format.

use rust_decimal::Decimal;
use std::str::FromStr;

/// Round to two decimal places. The sign of a negative zero is kept.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Render a float with at least one fractional digit (`1.0`, `-0.0`, `0.35`).
fn display_float(value: f64) -> String {
    let s = value.to_string();
    if value.is_finite() && !s.contains('.') {
        format!("{}.0", s)
    } else {
        s
    }
}

/// Percentage change from `previous_close` to `last`.
///
/// A zero (or non-finite) previous close yields `0.0`.
pub fn change_percent(last: f64, previous_close: f64) -> f64 {
    if previous_close == 0.0 || !previous_close.is_finite() {
        return 0.0;
    }
    ((last - previous_close) / previous_close) * 100.0
}

/// Format the change the way the feed does: `(display, positive)`.
///
/// The percentage is rounded to two places and always carries a fractional
/// digit (`"1.0%"`, `"-0.0%"`). A zero previous close yields a plain `"0%"`.
pub fn format_change(last: f64, previous_close: f64) -> (String, bool) {
    if previous_close == 0.0 || !previous_close.is_finite() {
        return ("0%".to_string(), true);
    }
    let pct = change_percent(last, previous_close);
    (format!("{}%", display_float(round2(pct))), pct >= 0.0)
}

/// Parse a formatted change (`"+1.2%"`, `"-0.5 %"`, `"3"`) into a decimal percentage.
pub fn parse_change_percent(s: &str) -> Option<Decimal> {
    let trimmed = s.trim();
    let trimmed = trimmed.strip_suffix('%').unwrap_or(trimmed).trim_end();
    let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }
    Decimal::from_str(trimmed).ok()
}
