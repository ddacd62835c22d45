use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Static properties of a traded commodity (product), shared by all of its
/// contracts. Keyed as `EXCHG.PRODUCT` in the metadata manager.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommoditySpec {
    pub exchange: SmolStr,
    pub product: SmolStr,
    #[serde(default)]
    pub name: SmolStr,
    /// Contract multiplier: currency value of one point of price, per lot.
    pub multiplier: f64,
    pub price_tick: f64,
    #[serde(default)]
    pub margin_rate: f64,
    /// Session template this commodity trades under.
    pub session_id: SmolStr,
    /// Holiday calendar (trading-day template) this commodity follows.
    #[serde(default = "default_calendar")]
    pub calendar: SmolStr,
    /// T+1: quantity opened today cannot be closed until the next session.
    #[serde(default)]
    pub is_t1: bool,
    #[serde(default = "default_true")]
    pub can_short: bool,
    #[serde(default)]
    pub is_stock: bool,
}

fn default_calendar() -> SmolStr {
    SmolStr::new_static("CHINA")
}

fn default_true() -> bool {
    true
}

impl CommoditySpec {
    /// `EXCHG.PRODUCT` key used across metadata maps and fee schedules.
    pub fn key(&self) -> SmolStr {
        SmolStr::new(format!("{}.{}", self.exchange, self.product))
    }
}
