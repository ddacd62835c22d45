use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// One open FIFO lot.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DetailInfo {
    pub long: bool,
    pub price: f64,
    pub volume: f64,
    /// `YYYYMMDDHHMM` of the opening fill.
    pub opentime: u64,
    pub opentdate: u32,
    pub max_price: f64,
    pub min_price: f64,
    pub profit: f64,
    pub max_profit: f64,
    pub max_loss: f64,
    pub open_tag: SmolStr,
    /// Scheduler step the lot was opened on.
    pub open_barno: u32,
}

impl DetailInfo {
    pub fn new(
        long: bool,
        price: f64,
        volume: f64,
        opentime: u64,
        opentdate: u32,
        open_tag: &str,
        open_barno: u32,
    ) -> Self {
        Self {
            long,
            price,
            volume,
            opentime,
            opentdate,
            max_price: price,
            min_price: price,
            profit: 0.0,
            max_profit: 0.0,
            max_loss: 0.0,
            open_tag: SmolStr::new(open_tag),
            open_barno,
        }
    }
}

/// Per-instrument position: signed `volume`, realised and floating P&L,
/// the T+1 `frozen` quantity, and the FIFO lot list.
///
/// Invariant: `volume` equals the signed sum of lot volumes, and
/// `frozen <= volume` on the long side.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct PosInfo {
    pub volume: f64,
    pub closeprofit: f64,
    pub dynprofit: f64,
    pub frozen: f64,
    pub last_entertime: u64,
    pub last_exittime: u64,
    pub details: Vec<DetailInfo>,
}

impl PosInfo {
    /// Quantity closeable today: total less the T+1 frozen part.
    pub fn valid_volume(&self) -> f64 {
        self.volume - self.frozen
    }

    /// Signed sum of lot volumes; must equal `volume` at all times.
    pub fn detail_volume(&self) -> f64 {
        self.details
            .iter()
            .map(|d| d.volume * if d.long { 1.0 } else { -1.0 })
            .sum()
    }

    /// Volume-weighted average open price, 0 when flat.
    pub fn average_price(&self) -> f64 {
        let total: f64 = self.details.iter().map(|d| d.volume).sum();
        if total <= 0.0 {
            return 0.0;
        }
        self.details.iter().map(|d| d.price * d.volume).sum::<f64>() / total
    }

    pub fn first_entertime(&self) -> Option<u64> {
        self.details.first().map(|d| d.opentime)
    }
}
