use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;

use smol_str::SmolStr;
use tapesim_data::{
    model::{Bar, Period, Tick},
    slice::{BarSlice, OrderDetailSlice, OrderQueueSlice, TickSlice, TransactionSlice},
};
use tapesim_execution::{MatchEngine, MatchError, MatchEvent, TimeInForce};
use tapesim_instrument::commodity::CommoditySpec;
use tracing::error;

use crate::{
    context::MockerCore,
    error::TapesimError,
    portfolio::Slippage,
    replayer::{DataSink, Replayer},
    strategy::HftStrategy,
};

/// How many recently terminal orders keep their user tag resolvable.
const TAG_RING_CAPACITY: usize = 1024;

/// An order turned away before reaching the matching engine; reported as
/// a failed entrust with no order or trade to follow.
#[derive(Debug, Clone)]
pub(crate) struct EntrustReject {
    code: SmolStr,
    message: SmolStr,
    user_tag: SmolStr,
}

fn reject_message(err: &MatchError) -> &'static str {
    match err {
        MatchError::UnknownCode(_) => "unknown code",
        MatchError::TickPredatesOrder { .. } => "tick predates order",
    }
}

/// HFT strategy context: a thin wrapper over the matching engine exposing
/// explicit buy/sell/cancel, with the full order/trade/entrust stream
/// routed back to the strategy.
pub struct HftMocker {
    core: MockerCore,
    engine: MatchEngine,
    strategy: Option<Box<dyn HftStrategy>>,
    /// Live and recently terminal local-id -> user-tag mappings.
    tag_ring: VecDeque<(u32, SmolStr)>,
    /// Rejections queued while a strategy callback held the context.
    pending_rejects: Vec<EntrustReject>,
    channel_ready_sent: bool,
}

impl HftMocker {
    pub fn new(name: &str, strategy: Box<dyn HftStrategy>, cancel_rate: f64) -> Self {
        Self {
            core: MockerCore::new(name, Slippage::default()),
            engine: MatchEngine::new(cancel_rate),
            strategy: Some(strategy),
            tag_ring: VecDeque::new(),
            pending_rejects: Vec::new(),
            channel_ready_sent: false,
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

    fn tag_of(&self, local_id: u32) -> SmolStr {
        self.tag_ring
            .iter()
            .rev()
            .find(|(id, _)| *id == local_id)
            .map(|(_, tag)| tag.clone())
            .unwrap_or_default()
    }

    fn dispatch(
        &mut self,
        rep: &mut Replayer,
        f: impl FnOnce(&mut dyn HftStrategy, &mut HftContext<'_>),
    ) {
        let Some(mut strategy) = self.strategy.take() else {
            return;
        };
        let mut ctx = HftContext {
            core: &mut self.core,
            engine: &mut self.engine,
            tag_ring: &mut self.tag_ring,
            pending_rejects: &mut self.pending_rejects,
            rep,
        };
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            f(strategy.as_mut(), &mut ctx);
        }));
        if result.is_err() {
            error!(name = self.core.name.as_str(), "strategy callback panicked, event dropped");
        }
        self.strategy = Some(strategy);
        self.flush_rejects(rep);
    }

    /// Deliver failed entrusts queued during the last callback. The
    /// strategy is exclusively borrowed while it runs, so rejections
    /// raised inside `stra_buy`/`stra_sell` report here, as soon as the
    /// requesting callback returns and still within the same event.
    fn flush_rejects(&mut self, rep: &mut Replayer) {
        while !self.pending_rejects.is_empty() {
            let pending = std::mem::take(&mut self.pending_rejects);
            for reject in pending {
                self.dispatch(rep, |strategy, ctx| {
                    strategy.on_entrust(
                        ctx,
                        0,
                        &reject.code,
                        false,
                        &reject.message,
                        reject.user_tag.as_str(),
                    )
                });
            }
        }
    }

    /// Apply one matching-engine event: book fills into the account, then
    /// notify the strategy.
    fn process_event(&mut self, rep: &mut Replayer, event: MatchEvent) {
        match event {
            MatchEvent::Entrust { local_id, code, success, message, .. } => {
                let tag = self.tag_of(local_id);
                self.dispatch(rep, |strategy, ctx| {
                    strategy.on_entrust(ctx, local_id, &code, success, &message, tag.as_str())
                });
            }
            MatchEvent::Order { local_id, code, buy, left, price, cancelled, .. } => {
                let tag = self.tag_of(local_id);
                self.dispatch(rep, |strategy, ctx| {
                    strategy.on_order(ctx, local_id, &code, buy, left, price, cancelled, tag.as_str())
                });
            }
            MatchEvent::Trade { local_id, code, buy, qty, price, .. } => {
                let tag = self.tag_of(local_id);
                let delta = if buy { qty } else { -qty };
                let time = rep.full_minute_time();
                let tdate = rep.trading_date();
                let barno = self.core.schedule_times;
                let result = self.core.account.adjust_position(
                    rep.metadata(),
                    &code,
                    delta,
                    price,
                    time,
                    tdate,
                    tag.as_str(),
                    barno,
                    &mut self.core.logs,
                );
                if let Err(err) = result {
                    error!(%err, "fatal accounting inconsistency, stopping replay");
                    self.core.invariant_failure = Some(err.to_string());
                    self.core.stop.stop();
                    return;
                }
                self.dispatch(rep, |strategy, ctx| {
                    strategy.on_trade(ctx, local_id, &code, buy, qty, price, tag.as_str())
                });
            }
        }
    }
}

impl DataSink for HftMocker {
    fn handle_init(&mut self, rep: &mut Replayer) {
        self.dispatch(rep, |strategy, ctx| strategy.on_init(ctx));

        if !self.channel_ready_sent {
            self.channel_ready_sent = true;
            self.dispatch(rep, |strategy, ctx| strategy.on_channel_ready(ctx));
            // Restored positions from an incremental base are announced
            // once the channel is up.
            let held: Vec<(SmolStr, f64, f64)> = self
                .core
                .account
                .positions
                .iter()
                .filter(|(_, pos)| pos.volume != 0.0)
                .map(|(code, pos)| (code.clone(), pos.volume, pos.valid_volume()))
                .collect();
            for (code, volume, valid) in held {
                self.dispatch(rep, |strategy, ctx| {
                    strategy.on_position(ctx, &code, volume, valid)
                });
            }
        }
    }

    fn handle_session_begin(&mut self, rep: &mut Replayer, tdate: u32) {
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
        match self.engine.handle_tick(tick) {
            Ok(events) => {
                for event in events {
                    if self.core.stop.is_stopped() {
                        break;
                    }
                    self.process_event(rep, event);
                }
            }
            Err(err @ MatchError::TickPredatesOrder { .. }) => {
                error!(%err, "corrupt replay stream, stopping");
                self.core.invariant_failure = Some(err.to_string());
                self.core.stop.stop();
                return;
            }
            Err(err) => {
                error!(%err, "matching failed for tick");
            }
        }

        self.core
            .account
            .update_dyn_profit(rep.metadata(), code, tick.price, rep.full_minute_time());

        if self.core.tick_subs.contains(code) {
            self.dispatch(rep, |strategy, ctx| strategy.on_tick(ctx, code, tick));
        }
    }

    fn handle_order_queue(
        &mut self,
        rep: &mut Replayer,
        code: &str,
        item: &tapesim_data::OrderQueueItem,
    ) {
        self.dispatch(rep, |strategy, ctx| strategy.on_order_queue(ctx, code, item));
    }

    fn handle_order_detail(
        &mut self,
        rep: &mut Replayer,
        code: &str,
        item: &tapesim_data::OrderDetailItem,
    ) {
        self.dispatch(rep, |strategy, ctx| strategy.on_order_detail(ctx, code, item));
    }

    fn handle_transaction(
        &mut self,
        rep: &mut Replayer,
        code: &str,
        item: &tapesim_data::TransactionItem,
    ) {
        self.dispatch(rep, |strategy, ctx| strategy.on_transaction(ctx, code, item));
    }

    fn handle_bar_close(
        &mut self,
        rep: &mut Replayer,
        code: &str,
        period: Period,
        times: u32,
        bar: &Bar,
    ) {
        self.core.schedule_times += 1;
        self.dispatch(rep, |strategy, ctx| strategy.on_bar(ctx, code, period, times, bar));
    }
}

/// Service surface handed to HFT strategy callbacks.
pub struct HftContext<'a> {
    pub(crate) core: &'a mut MockerCore,
    pub(crate) engine: &'a mut MatchEngine,
    pub(crate) tag_ring: &'a mut VecDeque<(u32, SmolStr)>,
    pub(crate) pending_rejects: &'a mut Vec<EntrustReject>,
    pub(crate) rep: &'a mut Replayer,
}

impl HftContext<'_> {
    fn remember_tag(&mut self, local_id: u32, tag: &str) {
        if self.tag_ring.len() == TAG_RING_CAPACITY {
            self.tag_ring.pop_front();
        }
        self.tag_ring.push_back((local_id, SmolStr::new(tag)));
    }

    /// Pre-trade check: a close on a long-only commodity must be covered
    /// by the closeable position; no partial rejection.
    fn entrust_guard(&self, code: &str, is_buy: bool, qty: f64) -> Option<&'static str> {
        if is_buy {
            return None;
        }
        let commodity = self.rep.commodity_info(code)?;
        if commodity.can_short {
            return None;
        }
        let closeable = if commodity.is_t1 {
            self.core.account.valid_volume(code)
        } else {
            self.core.account.volume(code)
        };
        (qty > closeable + 1e-9).then_some("insufficient position")
    }

    /// Queue a failed entrust; the mocker reports it through
    /// `on_entrust(success=false)` as soon as this callback returns.
    fn reject(&mut self, code: &str, message: &str, user_tag: &str) {
        error!(code, message, "order rejected");
        self.pending_rejects.push(EntrustReject {
            code: SmolStr::new(code),
            message: SmolStr::new(message),
            user_tag: SmolStr::new(user_tag),
        });
    }

    /// Submit a buy order. A rejection (unknown code, insufficient
    /// position) returns an empty id list and is reported through
    /// `on_entrust(success=false)` as soon as the current callback
    /// returns, before any order or trade events.
    pub fn stra_buy(
        &mut self,
        code: &str,
        price: f64,
        qty: f64,
        user_tag: &str,
        tif: TimeInForce,
    ) -> Vec<u32> {
        if let Some(message) = self.entrust_guard(code, true, qty) {
            self.reject(code, message, user_tag);
            return Vec::new();
        }
        match self.engine.buy(code, price, qty, tif, user_tag, order_stamp(self.rep)) {
            Ok(local_id) => {
                self.remember_tag(local_id, user_tag);
                vec![local_id]
            }
            Err(err) => {
                self.reject(code, reject_message(&err), user_tag);
                Vec::new()
            }
        }
    }

    /// Submit a sell order; rejections mirror [`stra_buy`](Self::stra_buy).
    pub fn stra_sell(
        &mut self,
        code: &str,
        price: f64,
        qty: f64,
        user_tag: &str,
        tif: TimeInForce,
    ) -> Vec<u32> {
        if let Some(message) = self.entrust_guard(code, false, qty) {
            self.reject(code, message, user_tag);
            return Vec::new();
        }
        match self.engine.sell(code, price, qty, tif, user_tag, order_stamp(self.rep)) {
            Ok(local_id) => {
                self.remember_tag(local_id, user_tag);
                vec![local_id]
            }
            Err(err) => {
                self.reject(code, reject_message(&err), user_tag);
                Vec::new()
            }
        }
    }

    /// Request a cancel; returns the signed remaining quantity.
    pub fn stra_cancel(&mut self, local_id: u32) -> f64 {
        self.engine.cancel(local_id).unwrap_or(0.0)
    }

    /// Cancel all active orders on `code` and side; returns the ids.
    pub fn stra_cancel_all(&mut self, code: &str, is_buy: bool) -> Vec<u32> {
        self.engine.cancel_side(code, is_buy, 0.0)
    }

    pub fn stra_get_undone(&self, code: &str) -> f64 {
        self.engine
            .orders()
            .filter(|order| order.code == code && !order.is_terminal())
            .map(|order| order.left * if order.buy { 1.0 } else { -1.0 })
            .sum()
    }

    pub fn stra_get_position(&self, code: &str, only_valid: bool) -> f64 {
        if only_valid {
            self.core.account.valid_volume(code)
        } else {
            self.core.account.volume(code)
        }
    }

    pub fn stra_get_position_profit(&self, code: &str) -> f64 {
        self.core
            .account
            .position(code)
            .map(|p| p.dynprofit)
            .unwrap_or(0.0)
    }

    pub fn stra_get_price(&self, code: &str) -> f64 {
        self.rep.cur_price(code)
    }

    pub fn stra_get_comminfo(&self, code: &str) -> Option<CommoditySpec> {
        self.rep.commodity_info(code).cloned()
    }

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

    pub fn stra_sub_order_queues(&mut self, code: &str) {
        self.rep.sub_order_queue(code);
    }

    pub fn stra_sub_order_details(&mut self, code: &str) {
        self.rep.sub_order_detail(code);
    }

    pub fn stra_sub_transactions(&mut self, code: &str) {
        self.rep.sub_transaction(code);
    }

    pub fn stra_get_order_queues(&self, code: &str, count: usize) -> OrderQueueSlice {
        self.rep.get_order_queue_slice(code, count)
    }

    pub fn stra_get_order_details(&self, code: &str, count: usize) -> OrderDetailSlice {
        self.rep.get_order_detail_slice(code, count)
    }

    pub fn stra_get_transactions(&self, code: &str, count: usize) -> TransactionSlice {
        self.rep.get_transaction_slice(code, count)
    }

    pub fn stra_get_date(&self) -> u32 {
        self.rep.date()
    }

    pub fn stra_get_time(&self) -> u32 {
        self.rep.min_time()
    }

    pub fn stra_get_secs(&self) -> u32 {
        self.rep.secs()
    }

    pub fn stra_get_tdate(&self) -> u32 {
        self.rep.trading_date()
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

/// Full-precision order submission stamp derived from the virtual clock.
fn order_stamp(rep: &Replayer) -> u64 {
    rep.date() as u64 * 1_000_000_000 + rep.min_time() as u64 * 100_000 + rep.secs() as u64
}
