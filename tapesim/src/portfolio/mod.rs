//! Position and P&L accounting: FIFO lots, instrument-aware fees,
//! mark-to-market with watermarks, and session-boundary bookkeeping.

use indexmap::IndexMap;
use smol_str::SmolStr;
use tapesim_instrument::{MetadataManager, fee::FeeKind};
use thiserror::Error;
use tracing::debug;

use crate::output::records::OutputLogs;

pub mod funds;
pub mod position;

pub use funds::FundInfo;
pub use position::{DetailInfo, PosInfo};

fn feq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccountError {
    #[error("no commodity metadata for {0}")]
    UnknownCommodity(String),

    /// FIFO lots no longer cover the tracked volume; the run must stop.
    #[error("lot underflow on {code}: {left} uncovered")]
    LotUnderflow { code: String, left: f64 },
}

/// Fixed- or ratio-slippage applied to CTA/SEL direct position changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slippage {
    pub ticks: i32,
    /// When set, `ticks` is in basis points of price instead of price
    /// ticks, rounded to the price tick.
    pub is_ratio: bool,
}

impl Slippage {
    pub fn apply(&self, price: f64, price_tick: f64, is_buy: bool) -> f64 {
        if self.ticks == 0 {
            return price;
        }
        let sign = if is_buy { 1.0 } else { -1.0 };
        if self.is_ratio {
            let mut slp = self.ticks as f64 * price / 10_000.0;
            if price_tick > 0.0 {
                slp = (slp / price_tick).round() * price_tick;
            }
            price + slp * sign
        } else {
            price + self.ticks as f64 * price_tick * sign
        }
    }
}

/// A context's exclusive position map and fund state, with the accounting
/// rules for fills, mark-to-market and session boundaries.
///
/// Iteration order of `positions` is insertion order, which keeps output
/// rows deterministic across identical replays.
#[derive(Debug, Clone, Default)]
pub struct AccountState {
    pub positions: IndexMap<SmolStr, PosInfo>,
    pub fund: FundInfo,
}

impl AccountState {
    pub fn position(&self, code: &str) -> Option<&PosInfo> {
        self.positions.get(code)
    }

    pub fn volume(&self, code: &str) -> f64 {
        self.positions.get(code).map(|p| p.volume).unwrap_or(0.0)
    }

    pub fn valid_volume(&self, code: &str) -> f64 {
        self.positions
            .get(code)
            .map(PosInfo::valid_volume)
            .unwrap_or(0.0)
    }

    /// Move the position of `code` to `target`, booking fills at `price`
    /// (after slippage). Matching is FIFO; an opposite fill larger than
    /// the position reverses through zero. Emits trade and close rows.
    #[allow(clippy::too_many_arguments)]
    pub fn set_position(
        &mut self,
        meta: &MetadataManager,
        code: &str,
        target: f64,
        price: f64,
        time: u64,
        tdate: u32,
        user_tag: &str,
        barno: u32,
        slippage: Slippage,
        logs: &mut OutputLogs,
    ) -> Result<(), AccountError> {
        let commodity = meta
            .commodity_of(code)
            .ok_or_else(|| AccountError::UnknownCommodity(code.to_string()))?;
        let multiplier = commodity.multiplier;
        let is_t1 = commodity.is_t1;
        let price_tick = commodity.price_tick;

        let pos = self.positions.entry(SmolStr::new(code)).or_default();
        if feq(pos.volume, target) {
            return Ok(());
        }

        let diff = target - pos.volume;
        let is_buy = diff > 0.0;
        let trd_px = slippage.apply(price, price_tick, is_buy);

        if pos.volume * diff > 0.0 || feq(pos.volume, 0.0) {
            // Same direction (or flat): append a lot.
            pos.volume = target;
            if is_t1 {
                pos.frozen += diff.abs();
                debug!(code, frozen = pos.frozen, "frozen position raised");
            }

            pos.details.push(DetailInfo::new(
                target > 0.0,
                trd_px,
                diff.abs(),
                time,
                tdate,
                user_tag,
                barno,
            ));
            pos.last_entertime = time;

            let fee = meta.calc_fee(code, trd_px, diff.abs(), FeeKind::Open);
            self.fund.fees += fee;
            self.fund.balance -= fee;
            logs.log_trade(code, target > 0.0, true, time, trd_px, diff.abs(), fee);
            return Ok(());
        }

        // Opposite direction: consume lots FIFO, then reverse if needed.
        let mut left = diff.abs();
        pos.volume = target;
        if feq(pos.volume, 0.0) {
            pos.dynprofit = 0.0;
        }

        for detail in pos.details.iter_mut() {
            let max_qty = detail.volume.min(left);
            if feq(max_qty, 0.0) {
                continue;
            }

            let max_prof = detail.max_profit * max_qty / detail.volume;
            let max_loss = detail.max_loss * max_qty / detail.volume;
            let closed_fraction_remaining = detail.volume - max_qty;

            detail.volume -= max_qty;
            left -= max_qty;

            let mut profit = (trd_px - detail.price) * max_qty * multiplier;
            if !detail.long {
                profit = -profit;
            }

            pos.closeprofit += profit;
            // Scale the floating P&L down with the shrinking lot.
            if closed_fraction_remaining + max_qty > 0.0 {
                pos.dynprofit =
                    pos.dynprofit * closed_fraction_remaining / (closed_fraction_remaining + max_qty);
            }
            pos.last_exittime = time;
            self.fund.profit += profit;
            self.fund.balance += profit;

            let kind = if detail.opentdate == tdate {
                FeeKind::CloseToday
            } else {
                FeeKind::Close
            };
            let fee = meta.calc_fee(code, trd_px, max_qty, kind);
            self.fund.fees += fee;
            self.fund.balance -= fee;

            logs.log_trade(code, detail.long, false, time, trd_px, max_qty, fee);
            logs.log_close(
                code,
                detail.long,
                detail.opentime,
                detail.price,
                time,
                trd_px,
                max_qty,
                profit,
                max_prof,
                max_loss,
                pos.closeprofit,
                detail.open_tag.as_str(),
                user_tag,
                detail.open_barno,
                barno,
            );

            if feq(left, 0.0) {
                break;
            }
        }

        pos.details.retain(|d| d.volume > 1e-9);

        if left > 1e-9 {
            // The fill went through zero: open the residual on the other
            // side.
            if !feq(target, 0.0) && (target > 0.0) != is_buy {
                return Err(AccountError::LotUnderflow { code: code.to_string(), left });
            }

            if is_t1 {
                pos.frozen += left;
                debug!(code, frozen = pos.frozen, "frozen position raised");
            }

            pos.details.push(DetailInfo::new(
                target > 0.0,
                trd_px,
                left,
                time,
                tdate,
                user_tag,
                barno,
            ));
            pos.last_entertime = time;

            let fee = meta.calc_fee(code, trd_px, left, FeeKind::Open);
            self.fund.fees += fee;
            self.fund.balance -= fee;
            logs.log_trade(code, target > 0.0, true, time, trd_px, left, fee);
        }

        Ok(())
    }

    /// Adjust the position by a signed `delta` instead of a target; used
    /// by the HFT context when fills stream in from the matching engine.
    #[allow(clippy::too_many_arguments)]
    pub fn adjust_position(
        &mut self,
        meta: &MetadataManager,
        code: &str,
        delta: f64,
        price: f64,
        time: u64,
        tdate: u32,
        user_tag: &str,
        barno: u32,
        logs: &mut OutputLogs,
    ) -> Result<(), AccountError> {
        let target = self.volume(code) + delta;
        self.set_position(
            meta,
            code,
            target,
            price,
            time,
            tdate,
            user_tag,
            barno,
            Slippage::default(),
            logs,
        )
    }

    /// Mark the position of `code` to `price`: per-lot floating P&L with
    /// run-up/drawdown tracking, fund-level rollup, and intraday dynamic
    /// balance watermarks stamped with `time` (`YYYYMMDDHHMM`).
    pub fn update_dyn_profit(&mut self, meta: &MetadataManager, code: &str, price: f64, time: u64) {
        if let Some(pos) = self.positions.get_mut(code) {
            if feq(pos.volume, 0.0) {
                pos.dynprofit = 0.0;
            } else if let Some(commodity) = meta.commodity_of(code) {
                let multiplier = commodity.multiplier;
                let mut dynprofit = 0.0;
                for detail in pos.details.iter_mut() {
                    detail.profit = detail.volume
                        * (price - detail.price)
                        * multiplier
                        * if detail.long { 1.0 } else { -1.0 };
                    if detail.profit > 0.0 {
                        detail.max_profit = detail.max_profit.max(detail.profit);
                    } else if detail.profit < 0.0 {
                        detail.max_loss = detail.max_loss.min(detail.profit);
                    }
                    detail.max_price = detail.max_price.max(price);
                    detail.min_price = detail.min_price.min(price);
                    dynprofit += detail.profit;
                }
                pos.dynprofit = dynprofit;
            }
        }

        self.fund.dynprofit = self.positions.values().map(|p| p.dynprofit).sum();

        let dyn_bal = self.fund.dynamic_balance();
        if dyn_bal > self.fund.max_dyn_bal {
            self.fund.max_dyn_bal = dyn_bal;
            self.fund.max_time = time;
        }
        if dyn_bal < self.fund.min_dyn_bal {
            self.fund.min_dyn_bal = dyn_bal;
            self.fund.min_time = time;
        }
        self.fund.update_time = time;
    }

    /// Session open: release T+1 freezes, snapshot the opening balances,
    /// reset the intraday watermarks.
    pub fn on_session_begin(&mut self, tdate: u32) {
        for (code, pos) in self.positions.iter_mut() {
            if !feq(pos.frozen, 0.0) {
                debug!(code = code.as_str(), frozen = pos.frozen, tdate, "frozen released");
                pos.frozen = 0.0;
            }
        }
        self.fund.predynbal = self.fund.dynamic_balance();
        self.fund.prebalance = self.fund.balance;
        self.fund.max_dyn_bal = f64::MIN;
        self.fund.min_dyn_bal = f64::MAX;
        self.fund.max_time = 0;
        self.fund.min_time = 0;
    }

    /// Session close: roll the across-day watermarks and append the
    /// `funds.csv` and `positions.csv` rows.
    pub fn on_session_end(&mut self, tdate: u32, logs: &mut OutputLogs) {
        let dyn_bal = self.fund.dynamic_balance();
        if dyn_bal > self.fund.max_md {
            self.fund.max_md = dyn_bal;
            self.fund.max_md_date = tdate;
        }
        if dyn_bal < self.fund.min_md {
            self.fund.min_md = dyn_bal;
            self.fund.min_md_date = tdate;
        }
        self.fund.last_date = tdate;

        for (code, pos) in self.positions.iter() {
            if feq(pos.volume, 0.0) {
                continue;
            }
            logs.positions.push(crate::output::records::PositionRecord {
                date: tdate,
                code: code.clone(),
                volume: pos.volume,
                closeprofit: pos.closeprofit,
                dynprofit: pos.dynprofit,
            });
        }

        logs.funds.push(crate::output::records::FundRecord {
            date: tdate,
            predynbalance: self.fund.predynbal,
            prebalance: self.fund.prebalance,
            balance: self.fund.balance,
            closeprofit: self.fund.profit,
            positionprofit: self.fund.dynprofit,
            fee: self.fund.fees,
            maxdynbalance: self.fund.max_dyn_bal,
            maxtime: self.fund.max_time,
            mindynbalance: self.fund.min_dyn_bal,
            mintime: self.fund.min_time,
            mdmaxbalance: self.fund.max_md,
            mdmaxdate: self.fund.max_md_date,
            mdminbalance: self.fund.min_md,
            mdmindate: self.fund.min_md_date,
        });
    }

    /// Position-volume invariant: signed lot sum equals tracked volume.
    pub fn check_volume_invariant(&self) -> Result<(), AccountError> {
        for (code, pos) in self.positions.iter() {
            if !feq(pos.detail_volume(), pos.volume) {
                return Err(AccountError::LotUnderflow {
                    code: code.to_string(),
                    left: pos.volume - pos.detail_volume(),
                });
            }
        }
        Ok(())
    }
}
