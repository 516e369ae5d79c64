//! Six-field cron expressions: `sec min hour day-of-month month day-of-week`.
//!
//! Each field accepts `*`, a number, `a-b`, comma lists and `/n` steps.
//! Day-of-week takes 0-7 with both 0 and 7 meaning Sunday. When day-of-month
//! and day-of-week are both restricted a day matches if either does.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

/// Days searched ahead before a schedule is declared dead. Covers the
/// longest gap between leap days.
const SEARCH_DAYS: u32 = 366 * 8 + 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("Schedule is empty")]
    Empty,
    #[error("Expected 6 fields (second minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),
    #[error("Invalid {field} value '{value}'")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} is out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("Invalid step in {field}: '{value}'")]
    InvalidStep { field: &'static str, value: String },
    #[error("Schedule '{0}' never fires")]
    NeverFires(String),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
}

const FIELDS: [FieldSpec; 6] = [
    FieldSpec { name: "second", min: 0, max: 59 },
    FieldSpec { name: "minute", min: 0, max: 59 },
    FieldSpec { name: "hour", min: 0, max: 23 },
    FieldSpec { name: "day-of-month", min: 1, max: 31 },
    FieldSpec { name: "month", min: 1, max: 12 },
    FieldSpec { name: "day-of-week", min: 0, max: 7 },
];

/// A parsed cron schedule. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    days_restricted: bool,
    weekdays_restricted: bool,
}

impl CronSchedule {
    /// Parse and validate an expression.
    ///
    /// # Errors
    /// Returns error if the expression is malformed or can never fire.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(CronError::Empty);
        }
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != FIELDS.len() {
            return Err(CronError::FieldCount(parts.len()));
        }

        let mut masks = [0u64; 6];
        for ((mask, part), spec) in masks.iter_mut().zip(&parts).zip(&FIELDS) {
            *mask = parse_field(part, spec)?;
        }

        // 7 is an alias for Sunday
        let mut weekdays = masks[5];
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }

        let schedule = Self {
            source: parts.join(" "),
            seconds: masks[0],
            minutes: masks[1],
            hours: masks[2],
            days: masks[3],
            months: masks[4],
            weekdays,
            days_restricted: !parts[3].starts_with('*'),
            weekdays_restricted: !parts[5].starts_with('*'),
        };

        if schedule.next_after(&Utc::now()).is_none() {
            return Err(CronError::NeverFires(schedule.source));
        }
        Ok(schedule)
    }

    /// The normalized expression.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First firing time strictly after `after`, in the same time zone.
    ///
    /// Local times skipped by a DST transition are skipped; ambiguous ones
    /// resolve to their earlier instant.
    #[must_use]
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let start = after.naive_local();
        let mut date = start.date();

        for _ in 0..SEARCH_DAYS {
            if self.matches_date(date) {
                let first_day = date == start.date();
                for hour in bits(self.hours) {
                    if first_day && hour < start.hour() {
                        continue;
                    }
                    let first_hour = first_day && hour == start.hour();
                    for minute in bits(self.minutes) {
                        if first_hour && minute < start.minute() {
                            continue;
                        }
                        for second in bits(self.seconds) {
                            let Some(naive) = date.and_hms_opt(hour, minute, second) else {
                                continue;
                            };
                            let Some(candidate) = tz.from_local_datetime(&naive).earliest() else {
                                continue;
                            };
                            if candidate > *after {
                                return Some(candidate);
                            }
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        if !has(self.months, date.month()) {
            return false;
        }
        let day = has(self.days, date.day());
        let weekday = has(self.weekdays, date.weekday().num_days_from_sunday());
        if self.days_restricted && self.weekdays_restricted {
            day || weekday
        } else {
            day && weekday
        }
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

const fn has(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn bits(mask: u64) -> impl Iterator<Item = u32> {
    (0..64).filter(move |i| has(mask, *i))
}

fn parse_field(text: &str, spec: &FieldSpec) -> Result<u64, CronError> {
    let mut mask = 0u64;
    for item in text.split(',') {
        mask |= parse_item(item, spec)?;
    }
    Ok(mask)
}

fn parse_item(item: &str, spec: &FieldSpec) -> Result<u64, CronError> {
    let invalid = || CronError::InvalidValue {
        field: spec.name,
        value: item.to_string(),
    };

    let (base, step) = match item.split_once('/') {
        Some((base, step)) => {
            let step: u32 = step.parse().map_err(|_| CronError::InvalidStep {
                field: spec.name,
                value: item.to_string(),
            })?;
            if step == 0 {
                return Err(CronError::InvalidStep {
                    field: spec.name,
                    value: item.to_string(),
                });
            }
            (base, Some(step))
        }
        None => (item, None),
    };

    let (low, high) = if base == "*" {
        (spec.min, spec.max)
    } else if let Some((a, b)) = base.split_once('-') {
        let a = number(a).ok_or_else(invalid)?;
        let b = number(b).ok_or_else(invalid)?;
        (check_range(a, spec)?, check_range(b, spec)?)
    } else {
        let value = check_range(number(base).ok_or_else(invalid)?, spec)?;
        // `a/n` runs from a to the end of the field
        (value, if step.is_some() { spec.max } else { value })
    };

    if low > high {
        return Err(invalid());
    }

    let step = step.unwrap_or(1);
    let mut mask = 0u64;
    let mut value = Some(low);
    while let Some(v) = value.filter(|v| *v <= high) {
        mask |= 1u64 << v;
        value = v.checked_add(step);
    }
    Ok(mask)
}

fn number(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

const fn check_range(value: u32, spec: &FieldSpec) -> Result<u32, CronError> {
    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use chrono::{Local, NaiveDateTime};

    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn next(expr: &str, after: &str) -> DateTime<Utc> {
        CronSchedule::parse(expr)
            .unwrap()
            .next_after(&utc(after))
            .unwrap()
    }

    #[test]
    fn test_daily_time() {
        assert_eq!(next("0 30 7 * * *", "2024-03-10 06:00:00"), utc("2024-03-10 07:30:00"));
        assert_eq!(next("0 30 7 * * *", "2024-03-10 07:30:00"), utc("2024-03-11 07:30:00"));
        assert_eq!(next("0 30 7 * * *", "2024-12-31 08:00:00"), utc("2025-01-01 07:30:00"));
    }

    #[test]
    fn test_every_second_is_strictly_after() {
        assert_eq!(next("* * * * * *", "2024-03-10 06:00:00"), utc("2024-03-10 06:00:01"));
    }

    #[test]
    fn test_steps_ranges_and_lists() {
        assert_eq!(next("*/15 * * * * *", "2024-03-10 06:00:16"), utc("2024-03-10 06:00:30"));
        assert_eq!(next("0 0 9-17/4 * * *", "2024-03-10 09:00:00"), utc("2024-03-10 13:00:00"));
        assert_eq!(next("0 0 6,18 * * *", "2024-03-10 07:00:00"), utc("2024-03-10 18:00:00"));
        assert_eq!(next("0 50/5 * * * *", "2024-03-10 07:56:00"), utc("2024-03-10 08:50:00"));
    }

    #[test]
    fn test_step_wider_than_field() {
        assert_eq!(next("59/4294967295 * * * * *", "2024-03-10 06:00:00"), utc("2024-03-10 06:00:59"));
        assert_eq!(next("0 */4294967295 * * * *", "2024-03-10 06:00:01"), utc("2024-03-10 07:00:00"));
        assert!(matches!(
            CronSchedule::parse("0 0 0 * * 1/99999999999"),
            Err(CronError::InvalidStep { .. })
        ));
    }

    #[test]
    fn test_weekdays() {
        // 2024-03-10 is a Sunday
        assert_eq!(next("0 0 8 * * 1-5", "2024-03-10 00:00:00"), utc("2024-03-11 08:00:00"));
        assert_eq!(next("0 0 8 * * 7", "2024-03-11 00:00:00"), utc("2024-03-17 08:00:00"));
        assert_eq!(next("0 0 8 * * 0", "2024-03-11 00:00:00"), utc("2024-03-17 08:00:00"));
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // the 15th or any Monday, whichever comes first
        assert_eq!(next("0 0 0 15 * 1", "2024-03-12 00:00:00"), utc("2024-03-15 00:00:00"));
        assert_eq!(next("0 0 0 15 * 1", "2024-03-16 00:00:00"), utc("2024-03-18 00:00:00"));
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(next("0 0 12 29 2 *", "2025-01-01 00:00:00"), utc("2028-02-29 12:00:00"));
    }

    #[test]
    fn test_invalid_expressions() {
        assert_eq!(CronSchedule::parse(""), Err(CronError::Empty));
        assert_eq!(CronSchedule::parse("   "), Err(CronError::Empty));
        assert_eq!(CronSchedule::parse("0 30 7 * *"), Err(CronError::FieldCount(5)));
        assert_eq!(CronSchedule::parse("0 0 30 7 * * *"), Err(CronError::FieldCount(7)));
        assert!(matches!(
            CronSchedule::parse("0 60 7 * * *"),
            Err(CronError::OutOfRange { field: "minute", value: 60, .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 0 0 0 * *"),
            Err(CronError::OutOfRange { field: "day-of-month", .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 0 0 * 13 *"),
            Err(CronError::OutOfRange { field: "month", .. })
        ));
        assert!(matches!(
            CronSchedule::parse("every morning at 7 please"),
            Err(CronError::FieldCount(5))
        ));
        assert!(matches!(
            CronSchedule::parse("a b c d e f"),
            Err(CronError::InvalidValue { field: "second", .. })
        ));
        assert!(matches!(
            CronSchedule::parse("*/0 * * * * *"),
            Err(CronError::InvalidStep { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("*/x * * * * *"),
            Err(CronError::InvalidStep { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 0 10-5 * * *"),
            Err(CronError::InvalidValue { field: "hour", .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 0 0 31 2 *"),
            Err(CronError::NeverFires(_))
        ));
    }

    #[test]
    fn test_errors_describe_violation() {
        let err = CronSchedule::parse("0 0 25 * * *").unwrap_err();
        assert_eq!(err.to_string(), "hour value 25 is out of range 0-23");
    }

    #[test]
    fn test_local_next_run_is_in_future() {
        let schedule: CronSchedule = "0 30 7 * * *".parse().unwrap();
        let now = Local::now();
        let next = schedule.next_after(&now).unwrap();
        assert!(next > now);
        assert_eq!((next.hour(), next.minute(), next.second()), (7, 30, 0));
        assert_eq!(schedule.to_string(), "0 30 7 * * *");
    }
}
