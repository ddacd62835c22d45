use serde::{Deserialize, Serialize};
use std::fmt;

/// Base bar period of a cached series. Resampled periods are expressed as
/// `(Period, times)` pairs, eg/ 15-minute bars are `(Min1, 15)`.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum Period {
    Min1,
    Min5,
    Day,
}

impl Period {
    pub fn is_day(&self) -> bool {
        matches!(self, Period::Day)
    }

    /// Base minutes per bar; 0 for daily.
    pub fn minutes(&self) -> u32 {
        match self {
            Period::Min1 => 1,
            Period::Min5 => 5,
            Period::Day => 0,
        }
    }

    pub fn parse(value: &str) -> Option<Period> {
        match value {
            "m1" => Some(Period::Min1),
            "m5" => Some(Period::Min5),
            "d" | "d1" => Some(Period::Day),
            _ => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Min1 => write!(f, "m1"),
            Period::Min5 => write!(f, "m5"),
            Period::Day => write!(f, "d1"),
        }
    }
}

/// OHLCV bar. `time` is the encoded intraday timestamp
/// ([`encode_bar_time`](crate::model::time::encode_bar_time)) for minute
/// periods and 0 for daily bars, which are identified by `date` alone.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct Bar {
    pub date: u32,
    pub time: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
    pub open_interest: f64,
    pub add_interest: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
}

impl Bar {
    /// Timestamp used for ordering: encoded minute time intraday, date for
    /// daily bars.
    pub fn stamp(&self) -> u64 {
        if self.time != 0 { self.time } else { self.date as u64 }
    }
}
