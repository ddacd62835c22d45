use std::panic::AssertUnwindSafe;

use smol_str::SmolStr;
use tapesim_data::{
    model::{Bar, Period, Tick},
    slice::{BarSlice, TickSlice},
};
use tapesim_instrument::{commodity::CommoditySpec, session::SessionSpec};
use tracing::error;

use crate::{
    context::MockerCore,
    error::TapesimError,
    portfolio::Slippage,
    replayer::{DataSink, Replayer},
    strategy::CtaStrategy,
};

fn feq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// CTA strategy context: signal-driven, bar-scheduled. Position changes
/// requested inside `on_bar` execute immediately at the bar close; those
/// requested on ticks defer to the instrument's next tick.
pub struct CtaMocker {
    core: MockerCore,
    strategy: Option<Box<dyn CtaStrategy>>,
    in_bar: bool,
}

impl CtaMocker {
    pub fn new(name: &str, strategy: Box<dyn CtaStrategy>, slippage: Slippage) -> Self {
        Self {
            core: MockerCore::new(name, slippage),
            strategy: Some(strategy),
            in_bar: false,
        }
    }

    /// Attach the replayer's stop handle so fatal accounting errors can
    /// end the run gracefully.
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

    /// Run one strategy callback with panic isolation: a panicking user
    /// callback is logged and the current event dropped.
    fn dispatch(
        &mut self,
        rep: &mut Replayer,
        f: impl FnOnce(&mut dyn CtaStrategy, &mut CtaContext<'_>),
    ) {
        let Some(mut strategy) = self.strategy.take() else {
            return;
        };
        let in_bar = self.in_bar;
        let mut ctx = CtaContext { core: &mut self.core, rep, in_bar };
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            f(strategy.as_mut(), &mut ctx);
        }));
        if result.is_err() {
            error!(name = self.core.name.as_str(), "strategy callback panicked, event dropped");
        }
        self.strategy = Some(strategy);
    }
}

impl DataSink for CtaMocker {
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
        let is_main = rep
            .main_sub()
            .is_some_and(|sub| sub.code == code && sub.period == period && sub.times == times);
        if is_main {
            self.core.schedule_times += 1;
        }

        self.in_bar = true;
        self.dispatch(rep, |strategy, ctx| strategy.on_bar(ctx, code, period, times, bar));
        self.in_bar = false;
    }
}

/// Service surface handed to CTA strategy callbacks; borrows the mocker
/// state and the replayer for the duration of one callback.
pub struct CtaContext<'a> {
    pub(crate) core: &'a mut MockerCore,
    pub(crate) rep: &'a mut Replayer,
    pub(crate) in_bar: bool,
}

impl CtaContext<'_> {
    pub fn stra_get_bars(&mut self, code: &str, period: Period, times: u32, count: usize) -> BarSlice {
        self.rep.get_kline_slice(code, period, times, count, false)
    }

    /// Subscribe the main bar series driving the replay clock.
    pub fn stra_get_main_bars(
        &mut self,
        code: &str,
        period: Period,
        times: u32,
        count: usize,
    ) -> BarSlice {
        self.rep.get_kline_slice(code, period, times, count, true)
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

    /// Current-day OHLC: `flag` 0 close, 1 open, 2 high, 3 low.
    pub fn stra_get_day_price(&self, code: &str, flag: u32) -> f64 {
        self.rep.day_price(code, flag)
    }

    pub fn stra_get_comminfo(&self, code: &str) -> Option<CommoditySpec> {
        self.rep.commodity_info(code).cloned()
    }

    pub fn stra_get_sessinfo(&self, code: &str) -> Option<SessionSpec> {
        self.rep.session_info(code).cloned()
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

    /// Set the target position. `limit_px` of 0 executes at market;
    /// `stop_px` is recorded on the signal for collaborating executors.
    pub fn stra_set_position(
        &mut self,
        code: &str,
        qty: f64,
        user_tag: &str,
        limit_px: f64,
        _stop_px: f64,
    ) {
        let Some(commodity) = self.rep.commodity_info(code).cloned() else {
            error!(code, "cannot find corresponding commodity info");
            return;
        };

        if !commodity.can_short && qty < 0.0 {
            error!(code, qty, "cannot short a long-only instrument");
            return;
        }

        let total = self.stra_get_position(code, false);
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

        if self.in_bar {
            // Inside on_bar the close price is the fill price; execute now.
            let sigprice = self.rep.cur_price(code);
            self.core
                .logs
                .log_signal(code, qty, sigprice, self.rep.gen_time(), user_tag);
            self.core.do_set_position(self.rep, code, qty, limit_px, user_tag);
        } else {
            self.core.append_signal(self.rep, code, qty, user_tag, limit_px);
        }
    }

    /// Position volume; `only_valid` excludes the T+1 frozen quantity.
    pub fn stra_get_position(&self, code: &str, only_valid: bool) -> f64 {
        if only_valid {
            self.core.account.valid_volume(code)
        } else {
            self.core.account.volume(code)
        }
    }

    /// Signed open volume carrying `user_tag`.
    pub fn stra_get_position_by_tag(&self, code: &str, user_tag: &str) -> f64 {
        let Some(pos) = self.core.account.position(code) else {
            return 0.0;
        };
        pos.details
            .iter()
            .filter(|d| d.open_tag == user_tag)
            .map(|d| d.volume * if d.long { 1.0 } else { -1.0 })
            .sum()
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

    pub fn stra_get_first_entertime(&self, code: &str) -> u64 {
        self.core
            .account
            .position(code)
            .and_then(|p| p.first_entertime())
            .unwrap_or(0)
    }

    pub fn stra_get_last_entertime(&self, code: &str) -> u64 {
        self.core
            .account
            .position(code)
            .map(|p| p.last_entertime)
            .unwrap_or(0)
    }

    pub fn stra_get_last_exittime(&self, code: &str) -> u64 {
        self.core
            .account
            .position(code)
            .map(|p| p.last_exittime)
            .unwrap_or(0)
    }

    pub fn stra_get_last_enterprice(&self, code: &str) -> f64 {
        self.core
            .account
            .position(code)
            .and_then(|p| p.details.last())
            .map(|d| d.price)
            .unwrap_or(0.0)
    }

    pub fn stra_get_last_entertag(&self, code: &str) -> SmolStr {
        self.core
            .account
            .position(code)
            .and_then(|p| p.details.last())
            .map(|d| d.open_tag.clone())
            .unwrap_or_default()
    }

    pub fn stra_get_detail_entertime(&self, code: &str, user_tag: &str) -> u64 {
        self.core
            .account
            .position(code)
            .and_then(|p| p.details.iter().find(|d| d.open_tag == user_tag))
            .map(|d| d.opentime)
            .unwrap_or(0)
    }

    pub fn stra_get_detail_cost(&self, code: &str, user_tag: &str) -> f64 {
        self.core
            .account
            .position(code)
            .and_then(|p| p.details.iter().find(|d| d.open_tag == user_tag))
            .map(|d| d.price)
            .unwrap_or(0.0)
    }

    /// Lot P&L by tag: `flag` 0 current, 1 best run-up, -1 worst drawdown.
    pub fn stra_get_detail_profit(&self, code: &str, user_tag: &str, flag: i32) -> f64 {
        self.core
            .account
            .position(code)
            .and_then(|p| p.details.iter().find(|d| d.open_tag == user_tag))
            .map(|d| match flag {
                1 => d.max_profit,
                -1 => d.max_loss,
                _ => d.profit,
            })
            .unwrap_or(0.0)
    }

    /// Fund figures: `flag` 0 dynamic balance, 1 realised P&L, 2 floating
    /// P&L, 3 fees.
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

    pub fn stra_log_debug(&self, message: &str) {
        tracing::debug!(strategy = self.core.name.as_str(), "{message}");
    }

    pub fn stra_log_warn(&self, message: &str) {
        tracing::warn!(strategy = self.core.name.as_str(), "{message}");
    }

    pub fn stra_log_error(&self, message: &str) {
        tracing::error!(strategy = self.core.name.as_str(), "{message}");
    }
}
