use chrono::{Datelike, NaiveDate};

use crate::domain::DomainError;

/// Parse a `YYYY-MM-DD` string as a plain calendar value. Never goes through
/// a timezone-aware instant parser; the calendar day the caller wrote is the
/// calendar day we keep.
pub fn parse_iso_date(raw: &str) -> Result<NaiveDate, DomainError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| DomainError::new("bad_params", format!("invalid date: {}", raw)))
}

pub fn format_iso_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn validate_weekday(value: Option<i64>) -> Result<Option<i64>, DomainError> {
    match value {
        None => Ok(None),
        Some(v) if (0..=6).contains(&v) => Ok(Some(v)),
        Some(v) => Err(DomainError::with_details(
            "bad_params",
            "weekday must be between 0 (Sunday) and 6 (Saturday)",
            serde_json::json!({ "weekday": v }),
        )),
    }
}

/// Expand a section's recurring meeting pattern into the ordered list of
/// calendar dates in `[start, end]` that fall on a configured weekday.
///
/// A section with no configured weekday matches every date in range; legacy
/// sections predate the weekday fields and still expect a full-range roll.
pub fn expand_schedule(
    weekday1: Option<i64>,
    weekday2: Option<i64>,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<NaiveDate>, DomainError> {
    if start > end {
        return Err(DomainError::with_details(
            "bad_params",
            "startDate must be on or before endDate",
            serde_json::json!({
                "startDate": format_iso_date(start),
                "endDate": format_iso_date(end)
            }),
        ));
    }
    let weekday1 = validate_weekday(weekday1)?;
    let weekday2 = validate_weekday(weekday2)?;
    let match_all = weekday1.is_none() && weekday2.is_none();

    let mut dates = Vec::new();
    let mut day = start;
    loop {
        let dow = i64::from(day.weekday().num_days_from_sunday());
        if match_all || weekday1 == Some(dow) || weekday2 == Some(dow) {
            dates.push(day);
        }
        if day == end {
            break;
        }
        let Some(next) = day.succ_opt() else {
            break;
        };
        day = next;
    }
    Ok(dates)
}
