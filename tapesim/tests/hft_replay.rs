//! End-to-end HFT replay: real tick streams through the matching engine,
//! order lifecycle callbacks, FAK semantics and position booking.

use std::sync::{Arc, Mutex};

use smol_str::SmolStr;
use tapesim::{
    HftMocker, HftStrategy, ReplayMode, Replayer, ReplayerOptions,
    context::hft::HftContext,
};
use tapesim_data::{MemoryReader, Tick};
use tapesim_execution::TimeInForce;
use tapesim_instrument::{
    MetadataManager,
    commodity::CommoditySpec,
    fee::FeeTemplate,
    holiday::HolidayCalendar,
    session::{SessionSpec, TimeWindow},
};

const CODE: &str = "SHFE.ag.2412";

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Entrust { local_id: u32, success: bool, message: String },
    Order { local_id: u32, left: f64, cancelled: bool },
    Trade { local_id: u32, qty: f64, price: f64, tag: String },
}

type EventLog = Arc<Mutex<Vec<Event>>>;

fn metadata_with(can_short: bool) -> MetadataManager {
    let mut meta = MetadataManager::default();
    meta.add_session(SessionSpec {
        id: SmolStr::new("FD0900"),
        name: SmolStr::new("futures day"),
        offset: 0,
        auction: None,
        sections: vec![TimeWindow::new(900, 1500)],
    });
    meta.add_calendar(HolidayCalendar::new("CHINA", []));
    meta.add_commodity(CommoditySpec {
        exchange: SmolStr::new("SHFE"),
        product: SmolStr::new("ag"),
        name: SmolStr::new("silver"),
        multiplier: 10.0,
        price_tick: 1.0,
        margin_rate: 0.1,
        session_id: SmolStr::new("FD0900"),
        calendar: SmolStr::new("CHINA"),
        is_t1: false,
        can_short,
        is_stock: false,
    });
    meta.add_fee("SHFE.ag", FeeTemplate::new(1.0, 1.0, 1.0, true, 0.1));
    meta
}

fn metadata() -> MetadataManager {
    metadata_with(true)
}

fn tick(price: f64, volume: f64, bid: (f64, f64), ask: (f64, f64), action_time: u32) -> Tick {
    let mut tick = Tick {
        exchg: SmolStr::new("SHFE"),
        code: SmolStr::new(CODE),
        price,
        volume,
        total_volume: volume,
        trading_date: 20240105,
        action_date: 20240105,
        action_time,
        ..Tick::default()
    };
    tick.bid_prices[0] = bid.0;
    tick.bid_qty[0] = bid.1;
    tick.ask_prices[0] = ask.0;
    tick.ask_qty[0] = ask.1;
    tick
}

/// Joins the bid on the first tick and records every callback.
struct JoinBid {
    events: EventLog,
    tif: TimeInForce,
    qty: f64,
    submitted: bool,
}

impl HftStrategy for JoinBid {
    fn name(&self) -> &str {
        "join_bid"
    }

    fn on_init(&mut self, ctx: &mut HftContext<'_>) {
        ctx.stra_sub_ticks(CODE);
    }

    fn on_tick(&mut self, ctx: &mut HftContext<'_>, code: &str, tick: &Tick) {
        if !self.submitted {
            self.submitted = true;
            let ids = ctx.stra_buy(code, tick.bid_price(0), self.qty, "jb", self.tif);
            assert_eq!(ids.len(), 1);
        }
    }

    fn on_entrust(
        &mut self,
        _ctx: &mut HftContext<'_>,
        local_id: u32,
        _code: &str,
        success: bool,
        message: &str,
        _tag: &str,
    ) {
        self.events.lock().unwrap().push(Event::Entrust {
            local_id,
            success,
            message: message.to_string(),
        });
    }

    fn on_order(
        &mut self,
        _ctx: &mut HftContext<'_>,
        local_id: u32,
        _code: &str,
        _buy: bool,
        left: f64,
        _price: f64,
        cancelled: bool,
        _tag: &str,
    ) {
        self.events.lock().unwrap().push(Event::Order { local_id, left, cancelled });
    }

    fn on_trade(
        &mut self,
        _ctx: &mut HftContext<'_>,
        local_id: u32,
        _code: &str,
        _buy: bool,
        qty: f64,
        price: f64,
        tag: &str,
    ) {
        self.events.lock().unwrap().push(Event::Trade {
            local_id,
            qty,
            price,
            tag: tag.to_string(),
        });
    }
}

fn run_join_bid(ticks: Vec<Tick>, tif: TimeInForce, qty: f64) -> (HftMocker, EventLog) {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));

    let mut reader = MemoryReader::new();
    reader.add_ticks(CODE, ticks);

    let mut rep = Replayer::new(
        Box::new(reader),
        Arc::new(metadata()),
        ReplayerOptions {
            begin_time: 202401050900,
            end_time: 202401051500,
            tick_enabled: true,
            ..ReplayerOptions::default()
        },
    );
    let strategy = JoinBid { events: Arc::clone(&events), tif, qty, submitted: false };
    let mut mocker = HftMocker::new("jb0", Box::new(strategy), 0.2);
    mocker.bind(&rep);
    rep.set_mode(ReplayMode::Tick);
    rep.run(&mut mocker).unwrap();

    (mocker, events)
}

#[test]
fn test_gfd_queue_then_fill() {
    // bid 100 shows 5 lots; queue = 5 * (1 - 0.2) = 4. The second tick
    // trades 8 at the limit: 4 consume the queue, 4 hit us.
    let ticks = vec![
        tick(100.5, 10.0, (100.0, 5.0), (101.0, 5.0), 90_000_000),
        tick(100.0, 8.0, (100.0, 5.0), (101.0, 5.0), 90_030_000),
        tick(100.0, 8.0, (100.0, 5.0), (101.0, 5.0), 90_100_000),
    ];
    let (mocker, events) = run_join_bid(ticks, TimeInForce::Gfd, 10.0);

    let events = events.lock().unwrap().clone();
    assert!(matches!(events[0], Event::Entrust { success: true, .. }));
    assert!(matches!(events[1], Event::Order { cancelled: false, .. }));

    let fills: Vec<(f64, f64)> = events
        .iter()
        .filter_map(|e| match e {
            Event::Trade { qty, price, .. } => Some((*qty, *price)),
            _ => None,
        })
        .collect();
    // Tick two: queue 4 of 8 consumed, 4 filled. Tick three: another 8
    // trades at the limit with the queue gone, filling the rest.
    assert_eq!(fills, vec![(4.0, 100.0), (6.0, 100.0)]);

    let core = mocker.core();
    assert_eq!(core.account.volume(CODE), 10.0);
    // Two fills, one trades.csv row each.
    assert_eq!(core.logs.trades.len(), 2);
    core.account.check_volume_invariant().unwrap();
}

#[test]
fn test_fak_cancels_remainder() {
    let ticks = vec![
        tick(100.5, 10.0, (100.0, 5.0), (101.0, 5.0), 90_000_000),
        tick(100.0, 8.0, (100.0, 5.0), (101.0, 5.0), 90_030_000),
        tick(100.0, 8.0, (100.0, 5.0), (101.0, 5.0), 90_100_000),
    ];
    let (mocker, events) = run_join_bid(ticks, TimeInForce::Fak, 10.0);

    let events = events.lock().unwrap().clone();
    let fills: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            Event::Trade { qty, .. } => Some(*qty),
            _ => None,
        })
        .collect();
    // Queue 4 consumed, 4 filled, remaining 6 killed; the third tick
    // fills nothing.
    assert_eq!(fills, vec![4.0]);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, Event::Order { cancelled: true, left, .. } if *left == 0.0))
    );
    assert_eq!(mocker.core().account.volume(CODE), 4.0);
}

#[test]
fn test_fak_zero_reference_volume_cancels_clean() {
    let ticks = vec![
        tick(100.5, 10.0, (100.0, 5.0), (101.0, 5.0), 90_000_000),
        // Dry tick: zero traded volume at the submission tick.
        tick(100.0, 0.0, (100.0, 5.0), (101.0, 5.0), 90_030_000),
    ];
    let (mocker, events) = run_join_bid(ticks, TimeInForce::Fak, 5.0);

    let events = events.lock().unwrap().clone();
    assert!(!events.iter().any(|e| matches!(e, Event::Trade { .. })));
    assert!(events.iter().any(|e| matches!(e, Event::Order { cancelled: true, .. })));
    assert_eq!(mocker.core().account.volume(CODE), 0.0);
}

/// Submits one order on the first tick through a caller-supplied action.
struct SubmitOnce {
    events: EventLog,
    action: fn(&mut HftContext<'_>, &str) -> Vec<u32>,
    returned_ids: Arc<Mutex<Option<Vec<u32>>>>,
    submitted: bool,
}

impl HftStrategy for SubmitOnce {
    fn name(&self) -> &str {
        "submit_once"
    }

    fn on_init(&mut self, ctx: &mut HftContext<'_>) {
        ctx.stra_sub_ticks(CODE);
    }

    fn on_tick(&mut self, ctx: &mut HftContext<'_>, code: &str, _tick: &Tick) {
        if !self.submitted {
            self.submitted = true;
            let ids = (self.action)(ctx, code);
            *self.returned_ids.lock().unwrap() = Some(ids);
        }
    }

    fn on_entrust(
        &mut self,
        _ctx: &mut HftContext<'_>,
        local_id: u32,
        _code: &str,
        success: bool,
        message: &str,
        _tag: &str,
    ) {
        self.events.lock().unwrap().push(Event::Entrust {
            local_id,
            success,
            message: message.to_string(),
        });
    }

    fn on_trade(
        &mut self,
        _ctx: &mut HftContext<'_>,
        local_id: u32,
        _code: &str,
        _buy: bool,
        qty: f64,
        price: f64,
        tag: &str,
    ) {
        self.events.lock().unwrap().push(Event::Trade {
            local_id,
            qty,
            price,
            tag: tag.to_string(),
        });
    }
}

fn run_submit_once(
    can_short: bool,
    action: fn(&mut HftContext<'_>, &str) -> Vec<u32>,
) -> (HftMocker, EventLog, Vec<u32>) {
    let events: EventLog = Arc::new(Mutex::new(Vec::new()));
    let returned_ids = Arc::new(Mutex::new(None));

    let mut reader = MemoryReader::new();
    reader.add_ticks(
        CODE,
        vec![
            tick(100.5, 10.0, (100.0, 5.0), (101.0, 5.0), 90_000_000),
            tick(100.0, 8.0, (100.0, 5.0), (101.0, 5.0), 90_030_000),
        ],
    );

    let mut rep = Replayer::new(
        Box::new(reader),
        Arc::new(metadata_with(can_short)),
        ReplayerOptions {
            begin_time: 202401050900,
            end_time: 202401051500,
            tick_enabled: true,
            ..ReplayerOptions::default()
        },
    );
    let strategy = SubmitOnce {
        events: Arc::clone(&events),
        action,
        returned_ids: Arc::clone(&returned_ids),
        submitted: false,
    };
    let mut mocker = HftMocker::new("so0", Box::new(strategy), 0.0);
    mocker.bind(&rep);
    rep.set_mode(ReplayMode::Tick);
    rep.run(&mut mocker).unwrap();

    let ids = returned_ids.lock().unwrap().clone().unwrap_or_default();
    (mocker, events, ids)
}

#[test]
fn test_unknown_code_reports_failed_entrust() {
    // No tick has been seen for the copper leg: the submission fails
    // synchronously with a failed entrust and no order or trade.
    let (mocker, events, ids) = run_submit_once(true, |ctx, _code| {
        ctx.stra_buy("SHFE.cu.2412", 100.0, 1.0, "uc", TimeInForce::Gfd)
    });

    assert!(ids.is_empty());
    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        Event::Entrust { local_id: 0, success: false, message } if message == "unknown code"
    ));
    assert_eq!(mocker.core().account.volume("SHFE.cu.2412"), 0.0);
}

#[test]
fn test_uncovered_sell_on_long_only_rejected() {
    // Flat position, can_short = false: a sell cannot be covered and is
    // rejected entirely, with no partial fill.
    let (mocker, events, ids) = run_submit_once(false, |ctx, code| {
        ctx.stra_sell(code, 100.0, 2.0, "ns", TimeInForce::Gfd)
    });

    assert!(ids.is_empty());
    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        Event::Entrust { local_id: 0, success: false, message } if message == "insufficient position"
    ));
    assert_eq!(mocker.core().account.volume(CODE), 0.0);
    assert!(mocker.core().logs.trades.is_empty());
}

#[test]
fn test_trade_attributed_to_user_tag() {
    let ticks = vec![
        tick(100.5, 10.0, (100.0, 5.0), (101.0, 5.0), 90_000_000),
        tick(100.0, 20.0, (100.0, 5.0), (101.0, 5.0), 90_030_000),
    ];
    let (_, events) = run_join_bid(ticks, TimeInForce::Gfd, 2.0);

    let events = events.lock().unwrap().clone();
    let tags: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            Event::Trade { tag, .. } => Some(tag.clone()),
            _ => None,
        })
        .collect();
    assert!(!tags.is_empty());
    assert!(tags.iter().all(|tag| tag == "jb"));
}
