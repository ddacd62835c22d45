use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::model::time::tick_stamp;

/// Exchange-published order-queue snapshot: the resting volumes at one
/// price level, in queue order.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct OrderQueueItem {
    pub exchg: SmolStr,
    pub code: SmolStr,
    pub trading_date: u32,
    pub action_date: u32,
    pub action_time: u32,
    /// True for the bid side.
    pub is_bid: bool,
    pub price: f64,
    pub order_count: u32,
    pub volumes: Vec<f64>,
}

impl OrderQueueItem {
    pub fn stamp(&self) -> u64 {
        tick_stamp(self.action_date, self.action_time)
    }
}

/// Exchange-published individual order event.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct OrderDetailItem {
    pub exchg: SmolStr,
    pub code: SmolStr,
    pub trading_date: u32,
    pub action_date: u32,
    pub action_time: u32,
    pub index: u64,
    pub is_bid: bool,
    pub price: f64,
    pub volume: f64,
    /// Venue-specific order type tag.
    pub order_type: u32,
}

impl OrderDetailItem {
    pub fn stamp(&self) -> u64 {
        tick_stamp(self.action_date, self.action_time)
    }
}

/// Exchange-published trade print.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct TransactionItem {
    pub exchg: SmolStr,
    pub code: SmolStr,
    pub trading_date: u32,
    pub action_date: u32,
    pub action_time: u32,
    pub index: u64,
    pub price: f64,
    pub volume: f64,
    /// +1 buyer-initiated, -1 seller-initiated, 0 unknown.
    pub aggressor: i32,
    pub bid_order: u64,
    pub ask_order: u64,
}

impl TransactionItem {
    pub fn stamp(&self) -> u64 {
        tick_stamp(self.action_date, self.action_time)
    }
}
