use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Lifecycle state of a virtual order.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum OrderState {
    /// Submitted, not yet seen by a tick.
    Pending,
    /// Acknowledged, participating in matching.
    Active,
    /// Cancel requested, reported cancelled on the next tick.
    CancelRequested,
    /// Terminal cancelled.
    Cancelled,
}

/// Time-in-force semantics.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize,
)]
pub enum TimeInForce {
    /// Good-for-day: rests until filled or cancelled.
    #[default]
    Gfd,
    /// Fill-and-kill: remainder cancels after the first fill attempt.
    Fak,
    /// Fill-or-kill: cancels entirely unless fully fillable at submission.
    Fok,
}

/// One virtual order tracked by the matching engine.
///
/// `queue` estimates the lots resting ahead of us at `limit`; `positive`
/// marks an order priced through the opposite touch, which fills against
/// the opposite quote instead of the trade stream.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrderInfo {
    pub local_id: u32,
    pub code: SmolStr,
    pub buy: bool,
    pub qty: f64,
    pub left: f64,
    pub traded: f64,
    pub limit: f64,
    /// Last trade price observed at submission, echoed in trade events.
    pub price: f64,
    pub state: OrderState,
    /// Submission stamp (`YYYYMMDD * 1e9 + HHMMSSmmm`).
    pub time: u64,
    pub queue: f64,
    pub positive: bool,
    pub tif: TimeInForce,
    pub user_tag: SmolStr,
}

impl OrderInfo {
    pub fn is_terminal(&self) -> bool {
        self.state == OrderState::Cancelled || self.left <= 0.0
    }
}

/// Event emitted by the matching engine while processing a tick.
///
/// Per order: at most one `Entrust`, any number of `Trade`s, each followed
/// by an `Order` echo, and exactly one terminal `Order` (fully filled or
/// `cancelled`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum MatchEvent {
    Entrust {
        local_id: u32,
        code: SmolStr,
        success: bool,
        message: SmolStr,
        time: u64,
    },
    Order {
        local_id: u32,
        code: SmolStr,
        buy: bool,
        left: f64,
        price: f64,
        cancelled: bool,
        time: u64,
    },
    Trade {
        local_id: u32,
        code: SmolStr,
        buy: bool,
        qty: f64,
        fired_price: f64,
        price: f64,
        time: u64,
    },
}
