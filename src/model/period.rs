//! Report periods and calendar helpers. All boundaries are computed in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// The time range of a report, counted back from "now" to the start of the enclosing period.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Week,
    #[default]
    Month,
    Year,
    /// Every expense ever recorded.
    All,
}

serde_plain::derive_display_from_serialize!(Period);
serde_plain::derive_fromstr_from_deserialize!(Period);

impl Period {
    /// The inclusive window-start of this period relative to `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        match self {
            Period::Day => midnight(today),
            Period::Week => {
                let offset = i64::from(today.weekday().num_days_from_monday());
                midnight(today - Duration::days(offset))
            }
            Period::Month => start_of_month(now),
            Period::Year => midnight(NaiveDate::from_yo_opt(today.year(), 1).unwrap_or(today)),
            Period::All => DateTime::UNIX_EPOCH,
        }
    }
}

/// Midnight at the first day of the month containing `now`.
pub fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    midnight(today.with_day(1).unwrap_or(today))
}

/// Midnight at the first day of the month after the one containing `now`.
pub fn start_of_next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    midnight(NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}
