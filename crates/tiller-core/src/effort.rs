//! Effort estimates to hours.

use crate::config::EffortConfig;

/// Resolve a task's effort field to hours.
///
/// Size tokens from the configured table win over duration syntax, so a table
/// entry such as `"M"` is never read as minutes. Missing or unparseable
/// estimates fall back to `default_hours`.
pub fn effort_hours(raw: Option<&str>, config: &EffortConfig) -> f64 {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return config.default_hours;
    };

    if let Some(hours) = size_hours(raw, config) {
        return hours;
    }

    parse_duration_hours(raw, config.hours_per_day)
        .filter(|hours| hours.is_finite() && *hours >= 0.0)
        .unwrap_or(config.default_hours)
}

fn size_hours(raw: &str, config: &EffortConfig) -> Option<f64> {
    config
        .sizes
        .iter()
        .find(|(size, _)| size.eq_ignore_ascii_case(raw))
        .map(|(_, hours)| *hours)
}

/// Parse `"2h"`, `"30m"`, `"1.5d"`, `"1h30m"` or a bare number of hours.
pub fn parse_duration_hours(raw: &str, hours_per_day: f64) -> Option<f64> {
    let text = raw.trim().to_ascii_lowercase();
    if text.is_empty() {
        return None;
    }
    if let Ok(hours) = text.parse::<f64>() {
        return Some(hours);
    }

    let mut total = 0.0;
    let mut number = String::new();
    let mut saw_component = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            continue;
        }

        let mut unit = String::from(ch);
        while let Some(next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(*next);
                chars.next();
            } else {
                break;
            }
        }

        let value = number.parse::<f64>().ok()?;
        number.clear();
        let factor = match unit.as_str() {
            "w" | "wk" | "week" | "weeks" => hours_per_day * 5.0,
            "d" | "day" | "days" => hours_per_day,
            "h" | "hr" | "hrs" | "hour" | "hours" => 1.0,
            "m" | "min" | "mins" | "minute" | "minutes" => 1.0 / 60.0,
            _ => return None,
        };
        total += value * factor;
        saw_component = true;
    }

    if !number.is_empty() || !saw_component {
        return None;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration_hours("2h", 8.0), Some(2.0));
        assert!(approx(parse_duration_hours("30m", 8.0).unwrap_or_default(), 0.5));
        assert_eq!(parse_duration_hours("1.5d", 8.0), Some(12.0));
        assert_eq!(parse_duration_hours("1w", 6.0), Some(30.0));
        assert!(approx(
            parse_duration_hours("1h 30m", 8.0).unwrap_or_default(),
            1.5
        ));
        assert_eq!(parse_duration_hours("3", 8.0), Some(3.0));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert_eq!(parse_duration_hours("", 8.0), None);
        assert_eq!(parse_duration_hours("h", 8.0), None);
        assert_eq!(parse_duration_hours("2x", 8.0), None);
        assert_eq!(parse_duration_hours("2h5", 8.0), None);
    }

    #[test]
    fn size_tokens_resolve_through_table_case_insensitively() {
        let config = EffortConfig::default();
        assert_eq!(effort_hours(Some("S"), &config), 2.0);
        assert_eq!(effort_hours(Some("m"), &config), 4.0);
        assert_eq!(effort_hours(Some("xl"), &config), 16.0);
    }

    #[test]
    fn unknown_or_missing_effort_uses_default() {
        let mut config = EffortConfig::default();
        config.default_hours = 3.0;
        assert_eq!(effort_hours(None, &config), 3.0);
        assert_eq!(effort_hours(Some("  "), &config), 3.0);
        assert_eq!(effort_hours(Some("XXL"), &config), 3.0);
        assert_eq!(effort_hours(Some("-2h"), &config), 3.0);
    }
}
