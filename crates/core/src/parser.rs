use chrono::{prelude::*, Duration, Months};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ValidationIssue;

static RELATIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+(\d+)([dwm])$").expect("valid regex"));

/// Parse the points field the way the task form accepts it.
pub fn parse_points(raw: &str) -> Result<u32, ValidationIssue> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationIssue::InvalidPoints(raw.to_string()));
    }
    let value: i64 = trimmed
        .parse()
        .map_err(|_| ValidationIssue::InvalidPoints(raw.to_string()))?;
    points_from_i64(value)
}

pub fn points_from_i64(value: i64) -> Result<u32, ValidationIssue> {
    if value < 0 {
        return Err(ValidationIssue::NegativePoints(value));
    }
    u32::try_from(value).map_err(|_| ValidationIssue::InvalidPoints(value.to_string()))
}

/// Trim optional free text, mapping blank input to `None`.
pub fn normalize_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolve a due date spec (YYYY-MM-DD, RFC 3339, today, tomorrow, +3d, mon)
/// to a calendar date relative to `today`.
pub fn parse_due_date(spec: &str, today: NaiveDate) -> Result<NaiveDate, ValidationIssue> {
    let trimmed = spec.trim();
    if trimmed.is_empty() {
        return Err(ValidationIssue::InvalidDueDate(
            "Due date cannot be empty".into(),
        ));
    }

    let lower = trimmed.to_ascii_lowercase();
    match lower.as_str() {
        "today" => return Ok(today),
        "tomorrow" => {
            return today.succ_opt().ok_or_else(|| {
                ValidationIssue::InvalidDueDate(format!("Date '{}' is out of range", spec))
            })
        }
        _ => {}
    }

    if let Some(caps) = RELATIVE_RE.captures(&lower) {
        let value: u32 = caps[1].parse().map_err(|_| {
            ValidationIssue::InvalidDueDate(format!("Invalid relative offset '{}'", spec))
        })?;
        let resolved = match &caps[2] {
            "d" => Duration::try_days(value.into()).and_then(|d| today.checked_add_signed(d)),
            "w" => Duration::try_weeks(value.into()).and_then(|d| today.checked_add_signed(d)),
            _ => today.checked_add_months(Months::new(value)),
        };
        return resolved.ok_or_else(|| {
            ValidationIssue::InvalidDueDate(format!("Date '{}' is out of range", spec))
        });
    }

    if let Some(weekday) = parse_weekday(&lower) {
        let mut days_ahead = (weekday.num_days_from_monday() as i64
            - today.weekday().num_days_from_monday() as i64)
            .rem_euclid(7);
        if days_ahead == 0 {
            days_ahead = 7;
        }
        return today
            .checked_add_signed(Duration::days(days_ahead))
            .ok_or_else(|| {
                ValidationIssue::InvalidDueDate(format!("Date '{}' is out of range", spec))
            });
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc).date_naive());
    }

    Err(ValidationIssue::InvalidDueDate(format!(
        "Unrecognized due date '{}'. Try YYYY-MM-DD, today, tomorrow, +3d, mon",
        spec
    )))
}

/// [`parse_due_date`] against the local calendar.
pub fn parse_due_date_local(spec: &str) -> Result<NaiveDate, ValidationIssue> {
    parse_due_date(spec, Local::now().date_naive())
}

fn parse_weekday(label: &str) -> Option<Weekday> {
    match label {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}
