//! Clock and calendar-day window arithmetic.
//!
//! Day boundaries are computed in a fixed reference timezone (a UTC offset
//! from config) so that "today" means the same thing on every host.
//! Everything here is a pure function of an injected `now`.

use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, TimeZone, Utc};

/// Source of the current instant. Swapped for [`ManualClock`] in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Build the reference timezone from a minute offset. Out-of-range offsets
/// (rejected by config validation) fall back to UTC.
pub fn reference_offset(utc_offset_minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
}

/// The calendar day containing an instant: `[start_of_today, start_of_tomorrow)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub day: NaiveDate,
    pub start_of_today: DateTime<Utc>,
    pub start_of_tomorrow: DateTime<Utc>,
}

impl DayWindow {
    /// The reference-timezone day that contains `now`.
    pub fn containing(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let day = now.with_timezone(&offset).date_naive();
        Self::for_day(day, offset)
    }

    /// The window of a specific calendar day.
    pub fn for_day(day: NaiveDate, offset: FixedOffset) -> Self {
        let start_of_today = midnight(day, offset);
        let start_of_tomorrow = start_of_today + Duration::days(1);
        Self {
            day,
            start_of_today,
            start_of_tomorrow,
        }
    }

    /// Midnight at the start of the previous day.
    pub fn start_of_yesterday(&self) -> DateTime<Utc> {
        self.start_of_today - Duration::days(1)
    }

    /// Last representable millisecond of the day (23:59:59.999).
    pub fn end_of_today(&self) -> DateTime<Utc> {
        self.start_of_tomorrow - Duration::milliseconds(1)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start_of_today && instant < self.start_of_tomorrow
    }
}

fn midnight(day: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    // A fixed offset has no gaps, so local midnight always maps to one instant.
    offset
        .from_local_datetime(&day.and_time(chrono::NaiveTime::MIN))
        .single()
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN)))
}

/// Whole hours left until the end of the reference day, rounded up.
pub fn hours_remaining_today(now: DateTime<Utc>, offset: FixedOffset) -> u32 {
    let window = DayWindow::containing(now, offset);
    let ms_left = (window.end_of_today() - now).num_milliseconds().max(0);
    let hour_ms = 60 * 60 * 1000;
    ((ms_left + hour_ms - 1) / hour_ms) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_day_window_utc() {
        let window = DayWindow::containing(at(15, 30), reference_offset(0));
        assert_eq!(window.start_of_today, at(0, 0));
        assert_eq!(window.start_of_tomorrow, at(0, 0) + Duration::days(1));
        assert!(window.contains(at(0, 0)));
        assert!(window.contains(at(23, 59)));
        assert!(!window.contains(window.start_of_tomorrow));
        assert_eq!(window.start_of_yesterday(), at(0, 0) - Duration::days(1));
    }

    #[test]
    fn test_day_window_with_offset() {
        // 23:30 UTC is already the next day at UTC+2.
        let window = DayWindow::containing(at(23, 30), reference_offset(120));
        assert_eq!(window.day, NaiveDate::from_ymd_opt(2026, 3, 11).unwrap());
        assert_eq!(window.start_of_today, at(22, 0));
    }

    #[test]
    fn test_hours_remaining_rounds_up() {
        let utc = reference_offset(0);
        assert_eq!(hours_remaining_today(at(0, 0), utc), 24);
        assert_eq!(hours_remaining_today(at(22, 0), utc), 2);
        assert_eq!(hours_remaining_today(at(22, 1), utc), 2);
        assert_eq!(hours_remaining_today(at(23, 59), utc), 1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(at(8, 0));
        clock.advance(Duration::minutes(121));
        assert_eq!(clock.now(), at(10, 1));
        clock.set(at(1, 0));
        assert_eq!(clock.now(), at(1, 0));
    }
}
