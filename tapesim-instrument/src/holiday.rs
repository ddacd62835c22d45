use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeSet;

/// Trading calendar: a named set of holiday dates on top of the implicit
/// weekend rule.
#[derive(Debug, Clone, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct HolidayCalendar {
    pub name: SmolStr,
    holidays: BTreeSet<u32>,
}

fn to_naive(date: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt((date / 10000) as i32, date / 100 % 100, date % 100)
}

fn to_u32(date: NaiveDate) -> u32 {
    date.year() as u32 * 10000 + date.month() * 100 + date.day()
}

impl HolidayCalendar {
    pub fn new(name: impl Into<SmolStr>, holidays: impl IntoIterator<Item = u32>) -> Self {
        Self {
            name: name.into(),
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_holiday(&self, date: u32) -> bool {
        self.holidays.contains(&date)
    }

    /// Whether `date` (YYYYMMDD) is a trading day: a weekday that is not a
    /// listed holiday. An unparsable date is never a trading day.
    pub fn is_trading_day(&self, date: u32) -> bool {
        let Some(naive) = to_naive(date) else {
            return false;
        };
        !matches!(naive.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }

    /// Next trading day at or after `date` when `include_self`, else
    /// strictly after.
    pub fn next_trading_day(&self, date: u32, include_self: bool) -> u32 {
        let mut cur = to_naive(date).unwrap_or_default();
        if !include_self {
            cur = cur.succ_opt().unwrap_or(cur);
        }
        while !self.is_trading_day(to_u32(cur)) {
            cur = match cur.succ_opt() {
                Some(next) => next,
                None => return to_u32(cur),
            };
        }
        to_u32(cur)
    }

    /// Previous trading day strictly before `date`.
    pub fn prev_trading_day(&self, date: u32) -> u32 {
        let mut cur = to_naive(date).unwrap_or_default();
        loop {
            cur = match cur.pred_opt() {
                Some(prev) => prev,
                None => return to_u32(cur),
            };
            if self.is_trading_day(to_u32(cur)) {
                return to_u32(cur);
            }
        }
    }
}

/// Day-of-week of a YYYYMMDD date, `Weekday::Mon` when unparsable.
pub fn weekday(date: u32) -> Weekday {
    to_naive(date).map(|d| d.weekday()).unwrap_or(Weekday::Mon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trading_day_rules() {
        // 2024-10-01..07 is a holiday stretch; 2024-10-05/06 is a weekend.
        let cal = HolidayCalendar::new("CHINA", [20241001, 20241002, 20241003, 20241004, 20241007]);

        struct TestCase {
            input: u32,
            expected: bool,
        }

        let tests = vec![
            // TC0: regular Monday
            TestCase { input: 20240930, expected: true },
            // TC1: listed holiday
            TestCase { input: 20241001, expected: false },
            // TC2: Saturday
            TestCase { input: 20241005, expected: false },
            // TC3: first day back
            TestCase { input: 20241008, expected: true },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(cal.is_trading_day(test.input), test.expected, "TC{} failed", index);
        }

        assert_eq!(cal.next_trading_day(20241001, true), 20241008);
        assert_eq!(cal.next_trading_day(20240930, true), 20240930);
        assert_eq!(cal.next_trading_day(20240930, false), 20241008);
        assert_eq!(cal.prev_trading_day(20241008), 20240930);
    }
}
