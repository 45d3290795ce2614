//! Fallback session clock used when the broker does not publish one.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};

/// Regular US equity open expressed in UTC (09:30 ET during standard time).
const REGULAR_OPEN_UTC: (u32, u32) = (14, 30);

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// Estimate the next regular session open strictly after `now`.
///
/// Holidays and daylight-saving shifts are ignored; the value is only used
/// for operator display and restart continuity.
pub fn next_regular_open(now: DateTime<Utc>) -> DateTime<Utc> {
    let open_time = NaiveTime::from_hms_opt(REGULAR_OPEN_UTC.0, REGULAR_OPEN_UTC.1, 0)
        .unwrap_or(NaiveTime::MIN);
    let mut date = now.date_naive();
    loop {
        let candidate = Utc.from_utc_datetime(&date.and_time(open_time));
        if candidate > now && !is_weekend(date.weekday()) {
            return candidate;
        }
        date += Duration::days(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friday_evening_rolls_to_monday() {
        // 2024-01-05 is a Friday
        let now = Utc.with_ymd_and_hms(2024, 1, 5, 22, 0, 0).unwrap();
        let next = next_regular_open(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 8, 14, 30, 0).unwrap());
    }

    #[test]
    fn test_weekday_morning_opens_same_day() {
        let now = Utc.with_ymd_and_hms(2024, 1, 3, 9, 0, 0).unwrap();
        let next = next_regular_open(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 3, 14, 30, 0).unwrap());
    }
}
