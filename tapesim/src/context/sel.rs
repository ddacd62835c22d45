use std::panic::AssertUnwindSafe;

use indexmap::IndexSet;
use smol_str::SmolStr;
use tapesim_data::{
    model::{Bar, Period, Tick},
    slice::{BarSlice, TickSlice},
};
use tapesim_instrument::commodity::CommoditySpec;
use tracing::error;

use crate::{
    context::MockerCore,
    error::TapesimError,
    portfolio::Slippage,
    replayer::{DataSink, Replayer},
    strategy::SelStrategy,
};

fn feq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// SEL strategy context: scheduled multi-asset rebalancing. Targets are
/// restated on every schedule fire; held instruments the schedule did not
/// re-target are automatically exited to zero.
pub struct SelMocker {
    core: MockerCore,
    strategy: Option<Box<dyn SelStrategy>>,
    in_schedule: bool,
    /// Codes targeted during the current schedule fire.
    scheduled_codes: IndexSet<SmolStr>,
}

impl SelMocker {
    pub fn new(name: &str, strategy: Box<dyn SelStrategy>, slippage: Slippage) -> Self {
        Self {
            core: MockerCore::new(name, slippage),
            strategy: Some(strategy),
            in_schedule: false,
            scheduled_codes: IndexSet::new(),
        }
    }

    pub fn bind(&mut self, rep: &Replayer) {
        self.core.stop = rep.stop_handle();
    }

    pub fn core(&self) -> &MockerCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut MockerCore {
        &mut self.core
    }

    pub fn finish(&mut self, dir: &std::path::Path) -> Result<(), TapesimError> {
        self.core.finish(dir)
    }

    fn dispatch(
        &mut self,
        rep: &mut Replayer,
        f: impl FnOnce(&mut dyn SelStrategy, &mut SelContext<'_>),
    ) {
        let Some(mut strategy) = self.strategy.take() else {
            return;
        };
        let in_schedule = self.in_schedule;
        let mut ctx = SelContext {
            core: &mut self.core,
            rep,
            in_schedule,
            scheduled_codes: &mut self.scheduled_codes,
        };
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            f(strategy.as_mut(), &mut ctx);
        }));
        if result.is_err() {
            error!(name = self.core.name.as_str(), "strategy callback panicked, event dropped");
        }
        self.strategy = Some(strategy);
    }
}

impl DataSink for SelMocker {
    fn handle_init(&mut self, rep: &mut Replayer) {
        self.dispatch(rep, |strategy, ctx| strategy.on_init(ctx));
    }

    fn handle_session_begin(&mut self, rep: &mut Replayer, tdate: u32) {
        self.core.check_rollover(rep, tdate);
        self.core.account.on_session_begin(tdate);
        self.dispatch(rep, |strategy, ctx| strategy.on_session_begin(ctx, tdate));
    }

    fn handle_session_end(&mut self, rep: &mut Replayer, tdate: u32) {
        self.dispatch(rep, |strategy, ctx| strategy.on_session_end(ctx, tdate));
        let logs = &mut self.core.logs;
        self.core.account.on_session_end(tdate, logs);
        self.core.update_risk();
    }

    fn handle_tick(&mut self, rep: &mut Replayer, code: &str, tick: &Tick, _px_type: u32) {
        self.core.proc_tick(rep, code, tick);
        if self.core.tick_subs.contains(code) {
            self.dispatch(rep, |strategy, ctx| strategy.on_tick(ctx, code, tick));
        }
    }

    fn handle_bar_close(
        &mut self,
        rep: &mut Replayer,
        code: &str,
        period: Period,
        times: u32,
        bar: &Bar,
    ) {
        self.dispatch(rep, |strategy, ctx| strategy.on_bar(ctx, code, period, times, bar));
    }

    fn handle_schedule(&mut self, rep: &mut Replayer, date: u32, time: u32) {
        self.core.schedule_times += 1;
        self.in_schedule = true;
        self.scheduled_codes.clear();

        self.dispatch(rep, |strategy, ctx| strategy.on_schedule(ctx, date, time));

        // Auto-exit: held instruments the schedule did not re-target go
        // to zero.
        let to_clear: Vec<SmolStr> = self
            .core
            .account
            .positions
            .iter()
            .filter(|(code, pos)| {
                !feq(pos.volume, 0.0) && !self.scheduled_codes.contains(code.as_str())
            })
            .map(|(code, _)| code.clone())
            .collect();
        for code in to_clear {
            self.core.append_signal(rep, &code, 0.0, "autoexit", 0.0);
        }

        self.in_schedule = false;
    }
}

/// Service surface handed to SEL strategy callbacks.
pub struct SelContext<'a> {
    pub(crate) core: &'a mut MockerCore,
    pub(crate) rep: &'a mut Replayer,
    pub(crate) in_schedule: bool,
    pub(crate) scheduled_codes: &'a mut IndexSet<SmolStr>,
}

impl SelContext<'_> {
    pub fn stra_get_bars(&mut self, code: &str, period: Period, times: u32, count: usize) -> BarSlice {
        self.rep.get_kline_slice(code, period, times, count, false)
    }

    pub fn stra_get_ticks(&mut self, code: &str, count: usize) -> TickSlice {
        self.rep.get_tick_slice(code, count)
    }

    pub fn stra_get_last_tick(&self, code: &str) -> Option<Tick> {
        self.rep.last_tick(code).cloned()
    }

    pub fn stra_sub_ticks(&mut self, code: &str) {
        self.core.tick_subs.insert(SmolStr::new(code));
        self.rep.sub_tick(code);
    }

    pub fn stra_get_price(&self, code: &str) -> f64 {
        self.rep.cur_price(code)
    }

    pub fn stra_get_day_price(&self, code: &str, flag: u32) -> f64 {
        self.rep.day_price(code, flag)
    }

    pub fn stra_get_comminfo(&self, code: &str) -> Option<CommoditySpec> {
        self.rep.commodity_info(code).cloned()
    }

    pub fn stra_get_date(&self) -> u32 {
        self.rep.date()
    }

    pub fn stra_get_time(&self) -> u32 {
        self.rep.min_time()
    }

    pub fn stra_get_tdate(&self) -> u32 {
        self.rep.trading_date()
    }

    /// Set the target position; executed on the instrument's next tick.
    pub fn stra_set_position(&mut self, code: &str, qty: f64, user_tag: &str) {
        let Some(commodity) = self.rep.commodity_info(code).cloned() else {
            error!(code, "cannot find corresponding commodity info");
            return;
        };

        if !commodity.can_short && qty < 0.0 {
            error!(code, qty, "cannot short a long-only instrument");
            return;
        }

        let total = self.stra_get_position(code, false);
        if self.in_schedule {
            self.scheduled_codes.insert(SmolStr::new(code));
        }
        if feq(total, qty) {
            return;
        }

        if commodity.is_t1 {
            let frozen = total - self.stra_get_position(code, true);
            if qty < frozen - 1e-9 {
                error!(code, qty, frozen, "target below frozen quantity");
                return;
            }
        }

        self.rep.sub_tick(code);
        self.core.tick_subs.insert(SmolStr::new(code));
        self.core.append_signal(self.rep, code, qty, user_tag, 0.0);
    }

    pub fn stra_get_position(&self, code: &str, only_valid: bool) -> f64 {
        if only_valid {
            self.core.account.valid_volume(code)
        } else {
            self.core.account.volume(code)
        }
    }

    pub fn stra_get_position_avgpx(&self, code: &str) -> f64 {
        self.core
            .account
            .position(code)
            .map(|p| p.average_price())
            .unwrap_or(0.0)
    }

    pub fn stra_get_position_profit(&self, code: &str) -> f64 {
        self.core
            .account
            .position(code)
            .map(|p| p.dynprofit)
            .unwrap_or(0.0)
    }

    /// Walk current holdings plus pending targets, the way a rebalance
    /// sees them.
    pub fn stra_enum_position(&self, mut callback: impl FnMut(&str, f64)) {
        let mut targets: indexmap::IndexMap<SmolStr, f64> = self
            .core
            .account
            .positions
            .iter()
            .map(|(code, pos)| (code.clone(), pos.volume))
            .collect();
        for (code, sig) in &self.core.sig_map {
            targets.insert(code.clone(), sig.volume);
        }
        for (code, volume) in targets {
            callback(code.as_str(), volume);
        }
    }

    pub fn stra_get_fund_data(&self, flag: u32) -> f64 {
        let fund = &self.core.account.fund;
        match flag {
            1 => fund.profit,
            2 => fund.dynprofit,
            3 => fund.fees,
            _ => fund.dynamic_balance(),
        }
    }

    pub fn stra_save_user_data(&mut self, key: &str, value: &str) {
        self.core.save_user_data(key, value);
    }

    pub fn stra_load_user_data(&self, key: &str, default: &str) -> String {
        self.core.load_user_data(key, default)
    }

    pub fn stra_log_info(&self, message: &str) {
        tracing::info!(strategy = self.core.name.as_str(), "{message}");
    }

    pub fn stra_log_error(&self, message: &str) {
        tracing::error!(strategy = self.core.name.as_str(), "{message}");
    }
}
