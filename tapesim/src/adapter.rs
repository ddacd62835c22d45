//! Live-mode adapter contracts. The replay core never connects to a
//! venue itself; market-data parsers and trade channels are collaborator
//! plug-ins that present these interfaces. The backtest engine consumes
//! them in stub form only — the HFT context callback surface mirrors the
//! trader callback set so strategies move between modes unchanged.

use smol_str::SmolStr;
use tapesim_data::{OrderDetailItem, OrderQueueItem, Tick, TransactionItem};

/// Callbacks a market-data parser feeds into the engine.
#[allow(unused_variables)]
pub trait ParserSink {
    fn on_quote(&mut self, tick: &Tick);
    fn on_order_queue(&mut self, item: &OrderQueueItem) {}
    fn on_order_detail(&mut self, item: &OrderDetailItem) {}
    fn on_transaction(&mut self, item: &TransactionItem) {}
}

/// Market-data channel contract.
pub trait ParserAdapter {
    fn init(&mut self, params: &serde_json::Value) -> bool;
    fn connect(&mut self) -> bool;
    fn disconnect(&mut self) -> bool;
    /// Replace the subscription set with `codes`.
    fn subscribe(&mut self, codes: &[SmolStr]);
    fn release(&mut self);
}

/// Callbacks a trade channel feeds into the engine.
#[allow(unused_variables)]
pub trait TraderSink {
    fn on_channel_ready(&mut self);
    fn on_channel_lost(&mut self);
    fn on_entrust(&mut self, local_id: u32, code: &str, success: bool, message: &str) {}
    fn on_order(&mut self, local_id: u32, code: &str, buy: bool, left: f64, price: f64, cancelled: bool) {
    }
    fn on_trade(&mut self, local_id: u32, code: &str, buy: bool, qty: f64, price: f64) {}
    fn on_position(&mut self, code: &str, volume: f64, valid: f64) {}
    fn on_account(&mut self, balance: f64, dynprofit: f64) {}
}

/// Trade channel contract.
pub trait TraderAdapter {
    fn init(&mut self, params: &serde_json::Value) -> bool;
    fn connect(&mut self) -> bool;
    fn login(&mut self) -> bool;

    fn qry_account(&mut self);
    fn qry_positions(&mut self);
    fn qry_orders(&mut self);
    fn qry_trades(&mut self);

    /// Returns the local order id, or `None` on synchronous rejection.
    fn order_insert(&mut self, code: &str, buy: bool, price: f64, qty: f64) -> Option<u32>;
    fn order_action(&mut self, local_id: u32) -> bool;
}
