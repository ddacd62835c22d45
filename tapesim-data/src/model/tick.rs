use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::model::time::tick_stamp;

/// Snapshot of an instrument's best-price state at one instant, with ten
/// levels of depth per side.
///
/// `action_date`/`action_time` are the wall-clock stamp (`HHMMSSmmm`);
/// `trading_date` is the session's trading day, which differs from the
/// calendar date during night sessions.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tick {
    pub exchg: SmolStr,
    pub code: SmolStr,

    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,

    pub pre_close: f64,
    pub pre_settle: f64,
    pub pre_interest: f64,

    pub upper_limit: f64,
    pub lower_limit: f64,

    pub total_volume: f64,
    /// Volume traded since the previous tick.
    pub volume: f64,
    pub settle_price: f64,
    pub open_interest: f64,
    pub diff_interest: f64,
    pub total_turnover: f64,
    /// Turnover since the previous tick.
    pub turnover: f64,

    pub trading_date: u32,
    pub action_date: u32,
    pub action_time: u32,

    pub bid_prices: [f64; 10],
    pub ask_prices: [f64; 10],
    pub bid_qty: [f64; 10],
    pub ask_qty: [f64; 10],
}

impl Default for Tick {
    fn default() -> Self {
        Self {
            exchg: SmolStr::default(),
            code: SmolStr::default(),
            price: 0.0,
            open: 0.0,
            high: 0.0,
            low: 0.0,
            pre_close: 0.0,
            pre_settle: 0.0,
            pre_interest: 0.0,
            upper_limit: 0.0,
            lower_limit: 0.0,
            total_volume: 0.0,
            volume: 0.0,
            settle_price: 0.0,
            open_interest: 0.0,
            diff_interest: 0.0,
            total_turnover: 0.0,
            turnover: 0.0,
            trading_date: 0,
            action_date: 0,
            action_time: 0,
            bid_prices: [0.0; 10],
            ask_prices: [0.0; 10],
            bid_qty: [0.0; 10],
            ask_qty: [0.0; 10],
        }
    }
}

impl Tick {
    /// Full-precision ordering stamp.
    pub fn stamp(&self) -> u64 {
        tick_stamp(self.action_date, self.action_time)
    }

    pub fn bid_price(&self, level: usize) -> f64 {
        self.bid_prices.get(level).copied().unwrap_or(0.0)
    }

    pub fn ask_price(&self, level: usize) -> f64 {
        self.ask_prices.get(level).copied().unwrap_or(0.0)
    }

    pub fn bid_volume(&self, level: usize) -> f64 {
        self.bid_qty.get(level).copied().unwrap_or(0.0)
    }

    pub fn ask_volume(&self, level: usize) -> f64 {
        self.ask_qty.get(level).copied().unwrap_or(0.0)
    }
}
