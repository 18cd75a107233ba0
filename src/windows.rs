//! Calendar windows used by the activity metrics
//!
//! All windows are anchored on "now" in UTC. Weeks follow ISO 8601 and start
//! on Monday.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

/// Window boundaries for a single recomputation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityWindows {
    /// Instant the windows were computed against
    pub now: DateTime<Utc>,
    /// First instant of the current calendar month
    pub month_start: DateTime<Utc>,
    /// Most recent Monday 00:00
    pub week_start: DateTime<Utc>,
    /// `week_start` minus seven days
    pub last_week_start: DateTime<Utc>,
}

impl ActivityWindows {
    pub fn at(now: DateTime<Utc>) -> Self {
        let week_start = start_of_week(now);
        Self {
            now,
            month_start: start_of_month(now),
            week_start,
            last_week_start: week_start - Duration::days(7),
        }
    }

    pub fn in_month(&self, at: DateTime<Utc>) -> bool {
        at >= self.month_start
    }

    pub fn in_this_week(&self, at: DateTime<Utc>) -> bool {
        at >= self.week_start
    }

    pub fn in_last_week(&self, at: DateTime<Utc>) -> bool {
        at >= self.last_week_start && at < self.week_start
    }
}

fn start_of_day_naive(date: NaiveDate, fallback: DateTime<Utc>) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(fallback)
}

fn start_of_week(dt: DateTime<Utc>) -> DateTime<Utc> {
    let days_from_monday = dt.weekday().num_days_from_monday();
    let monday = dt.date_naive() - Duration::days(days_from_monday as i64);
    start_of_day_naive(monday, dt)
}

fn start_of_month(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.date_naive()
        .with_day(1)
        .map(|d| start_of_day_naive(d, dt))
        .unwrap_or(dt)
}
