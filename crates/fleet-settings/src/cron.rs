//! Cron schedule validation.
//!
//! Schedules use six fields, seconds first:
//! `sec min hour day-of-month month day-of-week`, or one of the `@`
//! descriptors (`@daily`, `@every 1h30m`, ...).

use regex_lite::Regex;
use std::sync::OnceLock;

const FIELD_NAMES: [&str; 6] = ["seconds", "minutes", "hours", "day-of-month", "month", "day-of-week"];
const FIELD_BOUNDS: [(u32, u32); 6] = [(0, 59), (0, 59), (0, 23), (1, 31), (1, 12), (0, 7)];

fn element_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\*|\?|[0-9A-Za-z]+(-[0-9A-Za-z]+)?)(/[0-9]+)?$").expect("static regex")
    })
}

fn descriptor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@(yearly|annually|monthly|weekly|daily|midnight|hourly|every ([0-9]+(ns|us|ms|s|m|h))+)$")
            .expect("static regex")
    })
}

/// Validate a cron schedule, returning a human readable reason on failure.
pub fn validate_cron(expr: &str) -> Result<(), String> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err("empty schedule".to_string());
    }

    if expr.starts_with('@') {
        return if descriptor_re().is_match(expr) {
            Ok(())
        } else {
            Err(format!("unknown descriptor '{}'", expr))
        };
    }

    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(format!("expected 6 fields, got {}", fields.len()));
    }

    for (index, field) in fields.iter().enumerate() {
        for element in field.split(',') {
            validate_element(index, element)?;
        }
    }

    Ok(())
}

fn validate_element(index: usize, element: &str) -> Result<(), String> {
    let name = FIELD_NAMES[index];
    if !element_re().is_match(element) {
        return Err(format!("invalid {} field '{}'", name, element));
    }

    let range_part = element.split('/').next().unwrap_or(element);
    let (low, high) = FIELD_BOUNDS[index];
    for bound in range_part.split('-') {
        // Names (JAN, MON) are accepted without a range check.
        if let Ok(number) = bound.parse::<u32>() {
            if number < low || number > high {
                return Err(format!("{} value {} outside {}-{}", name, number, low, high));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_schedules() {
        assert!(validate_cron("0 0 1 * * 6").is_ok());
        assert!(validate_cron("0 0/10 * * * *").is_ok());
        assert!(validate_cron("0 15 2 1-15 JAN-MAR MON-FRI").is_ok());
        assert!(validate_cron("0,30 * * * * ?").is_ok());
        assert!(validate_cron("@daily").is_ok());
        assert!(validate_cron("@every 1h30m").is_ok());
    }

    #[test]
    fn test_wrong_field_count() {
        let err = validate_cron("0 0 * * *").unwrap_err();
        assert!(err.contains("6 fields"));
    }

    #[test]
    fn test_out_of_range() {
        let err = validate_cron("0 61 * * * *").unwrap_err();
        assert!(err.contains("minutes"));
        assert!(validate_cron("0 0 24 * * *").is_err());
    }

    #[test]
    fn test_garbage() {
        assert!(validate_cron("").is_err());
        assert!(validate_cron("@sometimes").is_err());
        assert!(validate_cron("0 0 * * * %").is_err());
    }
}
