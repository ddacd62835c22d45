//! Strategy contexts (mockers): the CTA, SEL and HFT flavours each
//! implement the replayer's [`DataSink`](crate::replayer::DataSink) and
//! expose the `stra_*` service surface to user strategies.

use indexmap::{IndexMap, IndexSet};
use smol_str::SmolStr;
use tapesim_data::Tick;
use tapesim_instrument::contract::CodeRef;
use tracing::{debug, error, info};

use crate::{
    error::TapesimError,
    output::{self, OutputLogs, RiskSnapshot, StateSnapshot},
    pool::{RiskMonitor, WorkerPool},
    portfolio::{AccountError, AccountState, Slippage},
    replayer::{Replayer, StopHandle},
};

pub mod cta;
pub mod hft;
pub mod sel;

pub use cta::CtaMocker;
pub use hft::HftMocker;
pub use sel::SelMocker;

/// A pending target-position signal, executed on the instrument's next
/// tick so the reported fill price matches the tick the position changes
/// on.
#[derive(Debug, Clone, PartialEq)]
pub struct SigInfo {
    pub volume: f64,
    pub sigprice: f64,
    /// Desired execution price; 0 executes at the triggering tick.
    pub desprice: f64,
    pub usertag: SmolStr,
    pub gentime: u64,
}

/// Main-contract auto-clear policy: on a rollover date, positions still
/// held on the previous leg are closed to zero before new trades.
#[derive(Debug, Clone, Default)]
pub struct ClearPolicy {
    pub active: bool,
    /// Product keys (`EXCHG.PRODUCT`); empty includes everything.
    pub includes: Vec<SmolStr>,
    pub excludes: Vec<SmolStr>,
}

impl ClearPolicy {
    fn covers(&self, product_key: &str) -> bool {
        if !self.active {
            return false;
        }
        if self.excludes.iter().any(|k| k == product_key) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|k| k == product_key)
    }
}

/// State shared by the CTA and SEL mockers: account, output rows, the
/// pending-signal map and per-strategy user data.
#[derive(Debug, Default)]
pub struct MockerCore {
    pub name: SmolStr,
    pub account: AccountState,
    pub logs: OutputLogs,
    pub sig_map: IndexMap<SmolStr, SigInfo>,
    pub tick_subs: IndexSet<SmolStr>,
    pub user_data: IndexMap<String, String>,
    pub user_data_modified: bool,
    pub slippage: Slippage,
    pub clear_policy: ClearPolicy,
    /// Monotone scheduler step counter, stamped into lots as the bar
    /// number.
    pub schedule_times: u32,
    pub stop: StopHandle,
    pub invariant_failure: Option<String>,
    /// Opt-in background workers for risk recalculation; size 0 runs
    /// inline.
    pub pool: WorkerPool,
    pub risk: RiskMonitor,
}

impl MockerCore {
    pub fn new(name: &str, slippage: Slippage) -> Self {
        Self {
            name: SmolStr::new(name),
            slippage,
            ..Self::default()
        }
    }

    /// Seed fund and positions from a prior run's snapshot.
    pub fn seed_from(&mut self, snapshot: &StateSnapshot) {
        self.account = snapshot.restore();
        info!(
            name = self.name.as_str(),
            balance = self.account.fund.balance,
            positions = self.account.positions.len(),
            "state seeded from incremental base"
        );
    }

    /// Record a target-position signal and its `signals.csv` row.
    pub fn append_signal(
        &mut self,
        rep: &Replayer,
        code: &str,
        qty: f64,
        user_tag: &str,
        desprice: f64,
    ) {
        let sigprice = rep.cur_price(code);
        let gentime = rep.gen_time();
        self.sig_map.insert(
            SmolStr::new(code),
            SigInfo {
                volume: qty,
                sigprice,
                desprice,
                usertag: SmolStr::new(user_tag),
                gentime,
            },
        );
        self.logs.log_signal(code, qty, sigprice, gentime, user_tag);
    }

    /// Execute a position change immediately at `price` (or the current
    /// price when 0). Accounting failures on internal inconsistencies set
    /// the fatal flag and request a graceful stop.
    pub fn do_set_position(&mut self, rep: &Replayer, code: &str, qty: f64, price: f64, tag: &str) {
        let px = if price > 0.0 { price } else { rep.cur_price(code) };
        if px <= 0.0 {
            debug!(code, "no price yet, signal stays pending");
            return;
        }
        let result = self.account.set_position(
            rep.metadata(),
            code,
            qty,
            px,
            rep.full_minute_time(),
            rep.trading_date(),
            tag,
            self.schedule_times,
            self.slippage,
            &mut self.logs,
        );
        match result {
            Ok(()) => {}
            Err(AccountError::UnknownCommodity(code)) => {
                error!(%code, "position change dropped, unknown commodity");
            }
            Err(err @ AccountError::LotUnderflow { .. }) => {
                error!(%err, "fatal accounting inconsistency, stopping replay");
                self.invariant_failure = Some(err.to_string());
                self.stop.stop();
            }
        }
    }

    /// Tick housekeeping shared by CTA and SEL: trigger the pending signal
    /// for `code`, then mark the position to market.
    pub fn proc_tick(&mut self, rep: &Replayer, code: &str, tick: &Tick) {
        if let Some(sig) = self.sig_map.shift_remove(code) {
            let price = if sig.desprice > 0.0 { sig.desprice } else { tick.price };
            self.do_set_position(rep, code, sig.volume, price, sig.usertag.as_str());
        }
        self.account
            .update_dyn_profit(rep.metadata(), code, tick.price, rep.full_minute_time());
    }

    /// Rollover auto-clear: when the main contract switched on `tdate`,
    /// close any position still held on the previous leg before the first
    /// strategy event of the day.
    pub fn check_rollover(&mut self, rep: &Replayer, tdate: u32) {
        let held: Vec<SmolStr> = self
            .account
            .positions
            .iter()
            .filter(|(_, pos)| pos.volume != 0.0)
            .map(|(code, _)| code.clone())
            .collect();

        for code in held {
            let Some(code_ref) = CodeRef::parse(&code) else {
                continue;
            };
            let product_key = code_ref.commodity_key();
            if !self.clear_policy.covers(&product_key) {
                continue;
            }
            let rules = rep.metadata().hot_rules();
            if !rules.is_switch_date(&code_ref.exchange, &code_ref.product, tdate) {
                continue;
            }
            // Raw codes in rollover rules may be bare month symbols
            // (`2412`) or product-prefixed (`ag2412`).
            let Some(prev) = rules.prev_raw_code(&code_ref.exchange, &code_ref.product, tdate)
            else {
                continue;
            };
            let prefixed = format!("{}{}", code_ref.product, code_ref.symbol);
            if prev != code_ref.symbol && prev != prefixed {
                continue;
            }
            info!(code = code.as_str(), tdate, "auto-clearing expired main-contract leg");
            self.append_signal(rep, &code, 0.0, "autoclear", 0.0);
        }
    }

    /// Replace the worker pool; size 0 keeps everything inline and
    /// bit-reproducible.
    pub fn set_pool_size(&mut self, size: usize) {
        self.pool = WorkerPool::new(size);
    }

    /// Post a risk-monitor recalculation from the current fund state.
    pub fn update_risk(&self) {
        let fund = self.account.fund.clone();
        let date = fund.last_date;
        self.risk.update(&self.pool, fund, date);
    }

    pub fn save_user_data(&mut self, key: &str, value: &str) {
        self.user_data.insert(key.to_string(), value.to_string());
        self.user_data_modified = true;
    }

    pub fn load_user_data(&self, key: &str, default: &str) -> String {
        self.user_data
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Flush CSVs, the state snapshot and (if modified) user data.
    pub fn finish(&mut self, dir: &std::path::Path) -> Result<(), TapesimError> {
        let dir = dir.join(self.name.as_str());
        output::write_outputs(&dir, &self.logs)?;

        // Join outstanding workers before reading the risk slot.
        self.pool = WorkerPool::new(0);
        let mut riskmon = self.risk.snapshot();
        if riskmon.date == 0 {
            riskmon = RiskSnapshot::recalc(&self.account.fund, self.account.fund.last_date);
        }
        let snapshot = StateSnapshot::capture(&self.account, riskmon);
        output::write_snapshot(&dir, &snapshot)?;
        if self.user_data_modified {
            output::write_user_data(&dir, self.name.as_str(), &self.user_data)?;
        }
        if let Some(failure) = &self.invariant_failure {
            return Err(TapesimError::Invariant(failure.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_policy_filters() {
        struct TestCase {
            policy: ClearPolicy,
            product: &'static str,
            expected: bool,
        }

        let tests = vec![
            // TC0: inactive policy never clears
            TestCase {
                policy: ClearPolicy::default(),
                product: "SHFE.ag",
                expected: false,
            },
            // TC1: active with empty filters covers everything
            TestCase {
                policy: ClearPolicy { active: true, includes: vec![], excludes: vec![] },
                product: "SHFE.ag",
                expected: true,
            },
            // TC2: excludes win
            TestCase {
                policy: ClearPolicy {
                    active: true,
                    includes: vec![],
                    excludes: vec![SmolStr::new("SHFE.ag")],
                },
                product: "SHFE.ag",
                expected: false,
            },
            // TC3: includes restrict
            TestCase {
                policy: ClearPolicy {
                    active: true,
                    includes: vec![SmolStr::new("DCE.m")],
                    excludes: vec![],
                },
                product: "SHFE.ag",
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.policy.covers(test.product), test.expected, "TC{} failed", index);
        }
    }
}
