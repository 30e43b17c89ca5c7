//! ISO week bucketing.
//!
//! Every weekly bucket is keyed by the Monday that starts its week, in UTC.

use crate::{Error, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

/// Monday of the UTC week containing `ts`
pub fn week_start(ts: DateTime<Utc>) -> NaiveDate {
    week_start_of(ts.date_naive())
}

/// Monday of the week containing `date`
pub fn week_start_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Bucket key (`YYYY-MM-DD`) for a week start
pub fn week_key(week: NaiveDate) -> String {
    week.format("%Y-%m-%d").to_string()
}

/// Parse a bucket key, requiring it to name a Monday
pub fn parse_week_key(s: &str) -> Result<NaiveDate> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::invalid(format!("invalid week '{}': {}", s, e)))?;
    if date.weekday() != Weekday::Mon {
        return Err(Error::invalid(format!("week '{}' is not a Monday", s)));
    }
    Ok(date)
}

/// The `n` week starts ending at the week containing `as_of`, oldest first
pub fn window(as_of: NaiveDate, n: u32) -> Vec<NaiveDate> {
    let last = week_start_of(as_of);
    (0..i64::from(n))
        .rev()
        .map(|back| last - Duration::weeks(back))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_same_week_same_key() {
        let tue = Utc.with_ymd_and_hms(2024, 1, 16, 8, 0, 0).unwrap();
        let sat = Utc.with_ymd_and_hms(2024, 1, 20, 22, 15, 0).unwrap();
        assert_eq!(week_start(tue), week_start(sat));
        assert_eq!(week_key(week_start(tue)), "2024-01-15");
    }

    #[test]
    fn test_sunday_midnight_boundary() {
        let sunday = Utc.with_ymd_and_hms(2024, 1, 21, 23, 59, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2024, 1, 22, 0, 1, 0).unwrap();
        assert_ne!(week_start(sunday), week_start(monday));
        assert_eq!(week_key(week_start(sunday)), "2024-01-15");
        assert_eq!(week_key(week_start(monday)), "2024-01-22");
    }

    #[test]
    fn test_year_boundary() {
        // 2025-01-01 is a Wednesday; its week starts in 2024
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(week_key(week_start(ts)), "2024-12-30");
    }

    #[test]
    fn test_parse_week_key() {
        assert!(parse_week_key("2024-01-15").is_ok());
        assert!(parse_week_key("2024-01-16").is_err());
        assert!(parse_week_key("15/01/2024").is_err());
    }

    #[test]
    fn test_window_oldest_first() {
        let as_of = NaiveDate::from_ymd_opt(2024, 1, 24).unwrap();
        let weeks = window(as_of, 3);
        let keys: Vec<_> = weeks.into_iter().map(week_key).collect();
        assert_eq!(keys, vec!["2024-01-08", "2024-01-15", "2024-01-22"]);
    }
}
