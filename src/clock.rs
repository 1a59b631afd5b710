//! Exchange-calendar-aware tradability. Equities are gated to NYSE regular hours; crypto is
//! always on.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};

use crate::types::{AssetClass, Symbol};

pub trait Calendar: Send + Sync {
    fn is_tradable_now(&self, symbol: &Symbol, asset_class: AssetClass, now: DateTime<Utc>) -> bool;

    /// `None` for crypto (never closes).
    fn next_close(&self, symbol: &Symbol, asset_class: AssetClass, now: DateTime<Utc>) -> Option<DateTime<Utc>>;

    fn minutes_until_close(
        &self,
        symbol: &Symbol,
        asset_class: AssetClass,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        self.next_close(symbol, asset_class, now)
            .map(|close| (close - now).num_minutes())
    }
}

/// NYSE regular-hours calendar (09:30-16:00 America/New_York), with a fixed holiday list and
/// the handful of scheduled early closes. Crypto symbols routed through this calendar are
/// always tradable.
pub struct NyseCalendar {
    holidays: Vec<NaiveDate>,
    early_closes: Vec<(NaiveDate, u32, u32)>, // (date, close_hour, close_minute) in NY local time
}

impl Default for NyseCalendar {
    fn default() -> Self {
        NyseCalendar {
            holidays: default_nyse_holidays(),
            early_closes: default_nyse_early_closes(),
        }
    }
}

impl NyseCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// America/New_York offset from UTC, hours. Uses the US DST rule (2nd Sunday in March to
    /// 1st Sunday in November) rather than a timezone database, since the rest of this repo's
    /// dependency stack does not carry one.
    fn ny_offset_hours(date: NaiveDate) -> i64 {
        if is_us_dst(date) {
            -4
        } else {
            -5
        }
    }

    fn to_ny_naive(&self, now: DateTime<Utc>) -> chrono::NaiveDateTime {
        let offset = Self::ny_offset_hours(now.date_naive());
        (now + Duration::hours(offset)).naive_utc()
    }

    fn is_session_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    fn session_close_ny(&self, date: NaiveDate) -> (u32, u32) {
        self.early_closes
            .iter()
            .find(|(d, _, _)| *d == date)
            .map(|(_, h, m)| (*h, *m))
            .unwrap_or((16, 0))
    }
}

impl Calendar for NyseCalendar {
    fn is_tradable_now(&self, _symbol: &Symbol, asset_class: AssetClass, now: DateTime<Utc>) -> bool {
        if asset_class == AssetClass::Crypto {
            return true;
        }
        let ny = self.to_ny_naive(now);
        let date = ny.date();
        if !self.is_session_day(date) {
            return false;
        }
        let (close_h, close_m) = self.session_close_ny(date);
        let open = date.and_hms_opt(9, 30, 0).unwrap();
        let close = date.and_hms_opt(close_h, close_m, 0).unwrap();
        ny >= open && ny < close
    }

    fn next_close(&self, _symbol: &Symbol, asset_class: AssetClass, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if asset_class == AssetClass::Crypto {
            return None;
        }
        let ny = self.to_ny_naive(now);
        let date = ny.date();
        let (close_h, close_m) = self.session_close_ny(date);
        let close_naive = date.and_hms_opt(close_h, close_m, 0).unwrap();
        let offset = Self::ny_offset_hours(date);
        let close_utc = Utc.from_utc_datetime(&close_naive) - Duration::hours(offset);
        Some(close_utc)
    }
}

/// The calendar date in America/New_York for a given instant, used to gate the once-per-day
/// performance snapshot (spec §C).
pub fn to_ny_date(now: DateTime<Utc>) -> NaiveDate {
    let offset = NyseCalendar::ny_offset_hours(now.date_naive());
    (now + Duration::hours(offset)).date_naive()
}

/// US DST rule: starts 2nd Sunday in March, ends 1st Sunday in November, both at 02:00 local.
/// Approximated at day granularity, sufficient for this controller's minute-level gating.
fn is_us_dst(date: NaiveDate) -> bool {
    let year = date.year();
    let march_start = nth_sunday(year, 3, 2);
    let november_end = nth_sunday(year, 11, 1);
    date >= march_start && date < november_end
}

fn nth_sunday(year: i32, month: u32, n: u32) -> NaiveDate {
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    let first_sunday_offset = (7 - first.weekday().num_days_from_sunday()) % 7;
    let first_sunday = first + Duration::days(first_sunday_offset as i64);
    first_sunday + Duration::weeks((n - 1) as i64)
}

fn default_nyse_holidays() -> Vec<NaiveDate> {
    // A representative, non-exhaustive set covering the years this controller is likely to
    // run against; extend as new sessions are added to the calendar feed.
    vec![
        NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        NaiveDate::from_ymd_opt(2026, 1, 19).unwrap(),
        NaiveDate::from_ymd_opt(2026, 2, 16).unwrap(),
        NaiveDate::from_ymd_opt(2026, 4, 3).unwrap(),
        NaiveDate::from_ymd_opt(2026, 5, 25).unwrap(),
        NaiveDate::from_ymd_opt(2026, 6, 19).unwrap(),
        NaiveDate::from_ymd_opt(2026, 7, 3).unwrap(),
        NaiveDate::from_ymd_opt(2026, 9, 7).unwrap(),
        NaiveDate::from_ymd_opt(2026, 11, 26).unwrap(),
        NaiveDate::from_ymd_opt(2026, 12, 25).unwrap(),
    ]
}

fn default_nyse_early_closes() -> Vec<(NaiveDate, u32, u32)> {
    vec![(NaiveDate::from_ymd_opt(2026, 11, 27).unwrap(), 13, 0)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ny_to_utc(year: i32, month: u32, day: u32, hour: u32, min: u32) -> DateTime<Utc> {
        let date = NaiveDate::from_ymd_opt(year, month, day).unwrap();
        let offset = NyseCalendar::ny_offset_hours(date);
        Utc.with_ymd_and_hms(year, month, day, hour, min, 0).unwrap() - Duration::hours(offset)
    }

    #[test]
    fn crypto_is_always_tradable() {
        let calendar = NyseCalendar::new();
        let symbol = Symbol::new("BTC/USD");
        let midnight = Utc.with_ymd_and_hms(2026, 1, 3, 3, 0, 0).unwrap();
        assert!(calendar.is_tradable_now(&symbol, AssetClass::Crypto, midnight));
    }

    #[test]
    fn equity_tradable_during_regular_hours() {
        let calendar = NyseCalendar::new();
        let symbol = Symbol::new("TSLA");
        // A Tuesday, 10:00 ET, well within DST.
        let during = ny_to_utc(2026, 7, 28, 10, 0);
        assert!(calendar.is_tradable_now(&symbol, AssetClass::Equity, during));
    }

    #[test]
    fn equity_not_tradable_before_open_or_after_close() {
        let calendar = NyseCalendar::new();
        let symbol = Symbol::new("TSLA");
        let before_open = ny_to_utc(2026, 7, 28, 9, 0);
        let after_close = ny_to_utc(2026, 7, 28, 16, 30);
        assert!(!calendar.is_tradable_now(&symbol, AssetClass::Equity, before_open));
        assert!(!calendar.is_tradable_now(&symbol, AssetClass::Equity, after_close));
    }

    #[test]
    fn equity_not_tradable_on_weekend() {
        let calendar = NyseCalendar::new();
        let symbol = Symbol::new("TSLA");
        // 2026-07-25 is a Saturday.
        let saturday = ny_to_utc(2026, 7, 25, 10, 0);
        assert!(!calendar.is_tradable_now(&symbol, AssetClass::Equity, saturday));
    }

    #[test]
    fn equity_not_tradable_on_holiday() {
        let calendar = NyseCalendar::new();
        let symbol = Symbol::new("TSLA");
        let christmas = ny_to_utc(2026, 12, 25, 10, 0);
        assert!(!calendar.is_tradable_now(&symbol, AssetClass::Equity, christmas));
    }

    #[test]
    fn minutes_until_close_boundary() {
        let calendar = NyseCalendar::new();
        let symbol = Symbol::new("TSLA");
        let at_1545 = ny_to_utc(2026, 7, 28, 15, 45);
        let minutes = calendar
            .minutes_until_close(&symbol, AssetClass::Equity, at_1545)
            .unwrap();
        assert_eq!(minutes, 15);
    }
}
