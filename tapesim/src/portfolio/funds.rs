use serde::{Deserialize, Serialize};

/// Account-level equity tracking.
///
/// `balance` is realised equity (initial + realised P&L − fees);
/// `balance + dynprofit` is the dynamic (mark-to-market) equity. Intraday
/// and across-day watermarks back the drawdown columns of `funds.csv`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FundInfo {
    /// Dynamic balance at the end of the previous session.
    pub predynbal: f64,
    pub balance: f64,
    /// Realised balance at the start of the current session.
    pub prebalance: f64,
    /// Cumulative realised P&L.
    pub profit: f64,
    pub dynprofit: f64,
    /// Cumulative fees paid.
    pub fees: f64,
    pub max_dyn_bal: f64,
    pub min_dyn_bal: f64,
    /// `YYYYMMDDHHMM` stamp of the intraday high-water mark.
    pub max_time: u64,
    pub min_time: u64,
    /// Across-day dynamic-balance watermarks.
    pub max_md: f64,
    pub min_md: f64,
    pub max_md_date: u32,
    pub min_md_date: u32,
    pub last_date: u32,
    pub update_time: u64,
}

impl Default for FundInfo {
    fn default() -> Self {
        Self {
            predynbal: 0.0,
            balance: 0.0,
            prebalance: 0.0,
            profit: 0.0,
            dynprofit: 0.0,
            fees: 0.0,
            max_dyn_bal: f64::MIN,
            min_dyn_bal: f64::MAX,
            max_time: 0,
            min_time: 0,
            max_md: f64::MIN,
            min_md: f64::MAX,
            max_md_date: 0,
            min_md_date: 0,
            last_date: 0,
            update_time: 0,
        }
    }
}

impl FundInfo {
    pub fn dynamic_balance(&self) -> f64 {
        self.balance + self.dynprofit
    }
}
