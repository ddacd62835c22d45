//! Strategy capability traits for the three context flavours, plus the
//! in-process factory registry through which the runner instantiates
//! strategies by `(module, name, id)`.

use indexmap::IndexMap;
use tapesim_data::model::{Bar, Period, Tick};

use crate::context::{cta::CtaContext, hft::HftContext, sel::SelContext};

/// Signal-driven, bar-scheduled strategy.
#[allow(unused_variables)]
pub trait CtaStrategy: Send {
    fn name(&self) -> &str;

    fn on_init(&mut self, ctx: &mut CtaContext<'_>) {}
    fn on_session_begin(&mut self, ctx: &mut CtaContext<'_>, tdate: u32) {}
    fn on_session_end(&mut self, ctx: &mut CtaContext<'_>, tdate: u32) {}
    fn on_tick(&mut self, ctx: &mut CtaContext<'_>, code: &str, tick: &Tick) {}
    fn on_bar(&mut self, ctx: &mut CtaContext<'_>, code: &str, period: Period, times: u32, bar: &Bar) {
    }
}

/// Scheduled multi-asset portfolio strategy.
#[allow(unused_variables)]
pub trait SelStrategy: Send {
    fn name(&self) -> &str;

    fn on_init(&mut self, ctx: &mut SelContext<'_>) {}
    fn on_session_begin(&mut self, ctx: &mut SelContext<'_>, tdate: u32) {}
    fn on_session_end(&mut self, ctx: &mut SelContext<'_>, tdate: u32) {}
    fn on_tick(&mut self, ctx: &mut SelContext<'_>, code: &str, tick: &Tick) {}
    fn on_bar(&mut self, ctx: &mut SelContext<'_>, code: &str, period: Period, times: u32, bar: &Bar) {
    }
    /// The scheduled rebalance fire.
    fn on_schedule(&mut self, ctx: &mut SelContext<'_>, date: u32, time: u32);
}

/// Tick/order-book driven strategy with an explicit order lifecycle.
#[allow(unused_variables)]
pub trait HftStrategy: Send {
    fn name(&self) -> &str;

    fn on_init(&mut self, ctx: &mut HftContext<'_>) {}
    fn on_session_begin(&mut self, ctx: &mut HftContext<'_>, tdate: u32) {}
    fn on_session_end(&mut self, ctx: &mut HftContext<'_>, tdate: u32) {}
    fn on_tick(&mut self, ctx: &mut HftContext<'_>, code: &str, tick: &Tick) {}
    fn on_bar(&mut self, ctx: &mut HftContext<'_>, code: &str, period: Period, times: u32, bar: &Bar) {
    }
    fn on_order_queue(&mut self, ctx: &mut HftContext<'_>, code: &str, item: &tapesim_data::OrderQueueItem) {
    }
    fn on_order_detail(&mut self, ctx: &mut HftContext<'_>, code: &str, item: &tapesim_data::OrderDetailItem) {
    }
    fn on_transaction(&mut self, ctx: &mut HftContext<'_>, code: &str, item: &tapesim_data::TransactionItem) {
    }

    /// Entrust acknowledgement, at most once per local id, before any
    /// order/trade for that id.
    fn on_entrust(&mut self, ctx: &mut HftContext<'_>, local_id: u32, code: &str, success: bool, message: &str, user_tag: &str) {
    }
    fn on_order(&mut self, ctx: &mut HftContext<'_>, local_id: u32, code: &str, buy: bool, left: f64, price: f64, cancelled: bool, user_tag: &str) {
    }
    fn on_trade(&mut self, ctx: &mut HftContext<'_>, local_id: u32, code: &str, buy: bool, qty: f64, price: f64, user_tag: &str) {
    }
    fn on_position(&mut self, ctx: &mut HftContext<'_>, code: &str, volume: f64, valid: f64) {}
    fn on_channel_ready(&mut self, ctx: &mut HftContext<'_>) {}
    fn on_channel_lost(&mut self, ctx: &mut HftContext<'_>) {}
}

/// Strategy factory: enumerates the strategies a module provides and
/// instantiates them by name. Mirrors the dynamic-module export contract
/// so a shared-library loader can wrap implementations of this trait.
#[allow(unused_variables)]
pub trait StrategyFactory: Send {
    fn name(&self) -> &str;

    fn enum_strategies(&self, callback: &mut dyn FnMut(&str));

    fn create_cta(
        &self,
        name: &str,
        id: &str,
        params: &serde_json::Value,
    ) -> Option<Box<dyn CtaStrategy>> {
        None
    }

    fn create_sel(
        &self,
        name: &str,
        id: &str,
        params: &serde_json::Value,
    ) -> Option<Box<dyn SelStrategy>> {
        None
    }

    fn create_hft(
        &self,
        name: &str,
        id: &str,
        params: &serde_json::Value,
    ) -> Option<Box<dyn HftStrategy>> {
        None
    }
}

/// Registry of factories keyed by module name.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: IndexMap<String, Box<dyn StrategyFactory>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Box<dyn StrategyFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn factory(&self, module: &str) -> Option<&dyn StrategyFactory> {
        self.factories.get(module).map(Box::as_ref)
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("modules", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
