//! Date information for a collection run.
//!
//! Every artifact of a run is filed under the same year/month/date, so the
//! clock is captured once and passed around instead of calling `Utc::now()`
//! at each write.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use cl_connectors::CollectionWindow;

/// Default look-back for SaaS collectors.
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// A fixed instant that path formatting and collection windows derive from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionClock {
    now: DateTime<Utc>,
}

impl CollectionClock {
    /// Captures the current time.
    pub fn now() -> Self {
        Self { now: Utc::now() }
    }

    /// Uses a fixed instant.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn year(&self) -> i32 {
        self.now.year()
    }

    /// Month number, 1-12.
    pub fn month(&self) -> u32 {
        self.now.month()
    }

    /// Full English month name (`March`).
    pub fn month_name(&self) -> String {
        self.now.format("%B").to_string()
    }

    pub fn day(&self) -> u32 {
        self.now.day()
    }

    /// `%Y-%m-%d`.
    pub fn end_date(&self) -> String {
        self.now.format("%Y-%m-%d").to_string()
    }

    /// `%Y%m%d_%H%M%S`, used in manifest and log names.
    pub fn timestamp(&self) -> String {
        self.now.format("%Y%m%d_%H%M%S").to_string()
    }

    /// Instant `days` days before now.
    pub fn start_of_window(&self, days: i64) -> DateTime<Utc> {
        self.now - Duration::days(days)
    }

    /// Start of a 30-day look-back that never reaches past the same day of
    /// the previous month.
    ///
    /// When today's day-of-month exceeds the length of the previous month
    /// (e.g. March 31 after a 29-day February), the look-back is the length
    /// of the previous month instead.
    pub fn dynamic_start(&self) -> DateTime<Utc> {
        let previous_month_days = days_in_previous_month(self.now.year(), self.now.month());
        if i64::from(self.now.day()) > previous_month_days {
            self.start_of_window(previous_month_days)
        } else {
            self.start_of_window(DEFAULT_WINDOW_DAYS)
        }
    }

    /// Window from [`CollectionClock::dynamic_start`] to now.
    pub fn default_window(&self) -> CollectionWindow {
        CollectionWindow {
            start: self.dynamic_start(),
            end: self.now,
        }
    }

    /// Window of `days` days ending now.
    pub fn window(&self, days: i64) -> CollectionWindow {
        CollectionWindow::ending_at(self.now, days)
    }
}

impl Default for CollectionClock {
    fn default() -> Self {
        Self::now()
    }
}

fn days_in_previous_month(year: i32, month: u32) -> i64 {
    let (prev_year, prev_month) = if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    };
    let first_of_prev = NaiveDate::from_ymd_opt(prev_year, prev_month, 1);
    let first_of_this = NaiveDate::from_ymd_opt(year, month, 1);
    match (first_of_prev, first_of_this) {
        (Some(prev), Some(this)) => (this - prev).num_days(),
        _ => DEFAULT_WINDOW_DAYS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock(y: i32, m: u32, d: u32) -> CollectionClock {
        CollectionClock::at(Utc.with_ymd_and_hms(y, m, d, 14, 5, 9).unwrap())
    }

    #[test]
    fn test_date_parts() {
        let c = clock(2024, 3, 7);
        assert_eq!(c.year(), 2024);
        assert_eq!(c.month(), 3);
        assert_eq!(c.month_name(), "March");
        assert_eq!(c.end_date(), "2024-03-07");
        assert_eq!(c.timestamp(), "20240307_140509");
    }

    #[test]
    fn test_days_in_previous_month() {
        assert_eq!(days_in_previous_month(2024, 3), 29);
        assert_eq!(days_in_previous_month(2023, 3), 28);
        assert_eq!(days_in_previous_month(2024, 1), 31);
        assert_eq!(days_in_previous_month(2024, 5), 30);
    }

    #[test]
    fn test_dynamic_start_mid_month_is_thirty_days() {
        let c = clock(2024, 5, 15);
        assert_eq!((c.instant() - c.dynamic_start()).num_days(), 30);
    }

    #[test]
    fn test_dynamic_start_after_short_month() {
        // March 31 after a 29-day February.
        let c = clock(2024, 3, 31);
        assert_eq!((c.instant() - c.dynamic_start()).num_days(), 29);
        // March 30 is still past day 29.
        assert_eq!((clock(2024, 3, 30).instant() - clock(2024, 3, 30).dynamic_start()).num_days(), 29);
        // March 29 is not.
        let c = clock(2024, 3, 29);
        assert_eq!((c.instant() - c.dynamic_start()).num_days(), 30);
    }

    #[test]
    fn test_windows_end_now() {
        let c = clock(2024, 6, 1);
        assert_eq!(c.default_window().end, c.instant());
        assert_eq!(c.window(90).start, c.start_of_window(90));
    }
}
