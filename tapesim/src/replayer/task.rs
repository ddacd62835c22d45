use std::collections::BTreeSet;
use tapesim_instrument::holiday::{HolidayCalendar, weekday};
use tracing::warn;

use crate::config::TaskConfig;

/// Recurrence of a scheduled strategy task.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TaskPeriod {
    /// Fire once, on the first trading day of the range.
    Once,
    /// Every trading day.
    Daily,
    /// On a weekday (0 = Sunday .. 6 = Saturday), rolled past holidays.
    Weekly,
    /// On a day of month (1-31), rolled past holidays.
    Monthly,
    /// On a `MMDD`, rolled past holidays.
    Yearly,
}

impl TaskPeriod {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "none" | "once" => Some(TaskPeriod::Once),
            "d" | "day" | "daily" => Some(TaskPeriod::Daily),
            "w" | "week" | "weekly" => Some(TaskPeriod::Weekly),
            "m" | "month" | "monthly" => Some(TaskPeriod::Monthly),
            "y" | "year" | "yearly" => Some(TaskPeriod::Yearly),
            _ => None,
        }
    }
}

fn next_calendar_day(date: u32) -> u32 {
    use chrono::{Datelike, NaiveDate};
    NaiveDate::from_ymd_opt((date / 10000) as i32, date / 100 % 100, date % 100)
        .and_then(|d| d.succ_opt())
        .map(|d| d.year() as u32 * 10000 + d.month() * 100 + d.day())
        .unwrap_or(date + 1)
}

/// A scheduled strategy fire resolved through the trading calendar:
/// nominal dates falling on holidays roll forward to the next trading day.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Day selector; meaning depends on `period`.
    pub day_rule: u32,
    /// `HHMM` fire time.
    pub time: u32,
    pub period: TaskPeriod,
}

impl TaskInfo {
    pub fn from_config(config: &TaskConfig) -> Self {
        let period = TaskPeriod::parse(&config.period).unwrap_or_else(|| {
            warn!(period = %config.period, "unknown task period, treating as daily");
            TaskPeriod::Daily
        });
        Self { day_rule: config.date, time: config.time, period }
    }

    fn nominal_fire(&self, date: u32) -> bool {
        match self.period {
            TaskPeriod::Once | TaskPeriod::Daily => true,
            TaskPeriod::Weekly => weekday(date).num_days_from_sunday() == self.day_rule,
            TaskPeriod::Monthly => date % 100 == self.day_rule,
            TaskPeriod::Yearly => date % 10000 == self.day_rule,
        }
    }

    /// Trading days in `[from, to]` on which the task fires.
    pub fn fire_dates(&self, calendar: &HolidayCalendar, from: u32, to: u32) -> BTreeSet<u32> {
        let mut fires = BTreeSet::new();
        let mut probe = from;
        while probe <= to {
            match self.period {
                TaskPeriod::Once => {
                    let fire = calendar.next_trading_day(probe, true);
                    if fire <= to {
                        fires.insert(fire);
                    }
                    break;
                }
                TaskPeriod::Daily => {
                    if calendar.is_trading_day(probe) {
                        fires.insert(probe);
                    }
                }
                _ => {
                    if self.nominal_fire(probe) {
                        let fire = calendar.next_trading_day(probe, true);
                        if fire <= to {
                            fires.insert(fire);
                        }
                    }
                }
            }
            probe = next_calendar_day(probe);
        }
        fires
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calendar() -> HolidayCalendar {
        // 2024-06-10 (Monday) is a holiday.
        HolidayCalendar::new("CHINA", [20240610])
    }

    #[test]
    fn test_daily_fires_skip_holidays() {
        let task = TaskInfo { day_rule: 0, time: 1400, period: TaskPeriod::Daily };
        let fires = task.fire_dates(&calendar(), 20240607, 20240612);
        assert_eq!(
            fires.into_iter().collect::<Vec<_>>(),
            vec![20240607, 20240611, 20240612]
        );
    }

    #[test]
    fn test_weekly_fire_rolls_forward() {
        // Mondays (weekday 1); the holiday Monday rolls onto Tuesday.
        let task = TaskInfo { day_rule: 1, time: 930, period: TaskPeriod::Weekly };
        let fires = task.fire_dates(&calendar(), 20240603, 20240614);
        assert_eq!(fires.into_iter().collect::<Vec<_>>(), vec![20240603, 20240611]);
    }

    #[test]
    fn test_monthly_fire() {
        let task = TaskInfo { day_rule: 10, time: 930, period: TaskPeriod::Monthly };
        let fires = task.fire_dates(&calendar(), 20240601, 20240701);
        // The nominal 10th is a holiday, rolled to the 11th.
        assert_eq!(fires.into_iter().collect::<Vec<_>>(), vec![20240611]);
    }

    #[test]
    fn test_once_fires_on_first_trading_day() {
        let task = TaskInfo { day_rule: 0, time: 930, period: TaskPeriod::Once };
        let fires = task.fire_dates(&calendar(), 20240608, 20240614);
        // The 8th is a Saturday, the 10th a holiday.
        assert_eq!(fires.into_iter().collect::<Vec<_>>(), vec![20240611]);
    }
}
