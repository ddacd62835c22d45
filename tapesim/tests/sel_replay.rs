//! End-to-end SEL replay: task-mode scheduling through the trading
//! calendar, deferred rebalance execution, and auto-exit of instruments
//! a schedule stops targeting.

use std::sync::Arc;

use smol_str::SmolStr;
use tapesim::{
    ReplayMode, Replayer, ReplayerOptions, SelMocker, SelStrategy, Slippage,
    context::sel::SelContext,
    replayer::{TaskInfo, TaskPeriod},
};
use tapesim_data::{Bar, MemoryReader, Period, model::time::encode_bar_time};
use tapesim_instrument::{
    MetadataManager,
    commodity::CommoditySpec,
    fee::FeeTemplate,
    holiday::HolidayCalendar,
    session::{SessionSpec, TimeWindow},
};

const AG: &str = "SHFE.ag.2412";
const AU: &str = "SHFE.au.2412";

fn commodity(product: &str, multiplier: f64) -> CommoditySpec {
    CommoditySpec {
        exchange: SmolStr::new("SHFE"),
        product: SmolStr::new(product),
        name: SmolStr::new(product),
        multiplier,
        price_tick: 1.0,
        margin_rate: 0.1,
        session_id: SmolStr::new("FD0900"),
        calendar: SmolStr::new("CHINA"),
        is_t1: false,
        can_short: true,
        is_stock: false,
    }
}

fn metadata() -> MetadataManager {
    let mut meta = MetadataManager::default();
    meta.add_session(SessionSpec {
        id: SmolStr::new("FD0900"),
        name: SmolStr::new("futures day"),
        offset: 0,
        auction: None,
        sections: vec![TimeWindow::new(900, 1130)],
    });
    meta.add_calendar(HolidayCalendar::new("CHINA", []));
    meta.add_commodity(commodity("ag", 10.0));
    meta.add_commodity(commodity("au", 100.0));
    meta.add_fee("SHFE.ag", FeeTemplate::new(1.0, 1.0, 1.0, true, 0.1));
    meta.add_fee("SHFE.au", FeeTemplate::new(2.0, 2.0, 2.0, true, 0.1));
    meta
}

fn day_bars(date: u32, base: f64) -> Vec<Bar> {
    // 09:31 .. 10:30, close = base + index
    let mut bars = Vec::new();
    let (mut hh, mut mm) = (9, 31);
    for i in 0..60 {
        let close = base + i as f64;
        bars.push(Bar {
            date,
            time: encode_bar_time(date, hh * 100 + mm),
            open: close - 0.5,
            high: close + 0.5,
            low: close - 1.0,
            close,
            volume: 20.0,
            turnover: close * 20.0,
            open_interest: 50.0,
            ..Bar::default()
        });
        mm += 1;
        if mm == 60 {
            mm = 0;
            hh += 1;
        }
    }
    bars
}

/// Targets both legs on day one, only gold on day two.
struct Rebalance;

impl SelStrategy for Rebalance {
    fn name(&self) -> &str {
        "rebalance"
    }

    fn on_init(&mut self, ctx: &mut SelContext<'_>) {
        let _ = ctx.stra_get_bars(AG, Period::Min1, 1, 5);
        let _ = ctx.stra_get_bars(AU, Period::Min1, 1, 5);
    }

    fn on_schedule(&mut self, ctx: &mut SelContext<'_>, date: u32, _time: u32) {
        if date == 20240105 {
            ctx.stra_set_position(AG, 2.0, "d1");
            ctx.stra_set_position(AU, 1.0, "d1");
        } else {
            // ag is deliberately not restated: the engine must exit it.
            ctx.stra_set_position(AU, 1.0, "d2");
        }
    }
}

fn run_rebalance() -> SelMocker {
    let mut reader = MemoryReader::new();
    let mut ag = day_bars(20240105, 100.0);
    ag.extend(day_bars(20240108, 130.0));
    reader.add_bars(AG, Period::Min1, ag);
    let mut au = day_bars(20240105, 500.0);
    au.extend(day_bars(20240108, 520.0));
    reader.add_bars(AU, Period::Min1, au);

    let mut rep = Replayer::new(
        Box::new(reader),
        Arc::new(metadata()),
        ReplayerOptions {
            begin_time: 202401050900,
            end_time: 202401081130,
            align_by_section: true,
            ..ReplayerOptions::default()
        },
    );
    rep.register_task(TaskInfo { day_rule: 0, time: 1000, period: TaskPeriod::Daily });

    let mut mocker = SelMocker::new("rb0", Box::new(Rebalance), Slippage::default());
    mocker.bind(&rep);
    rep.run(&mut mocker).unwrap();
    mocker
}

#[test]
fn test_schedule_targets_execute_on_next_tick() {
    let mocker = run_rebalance();
    let core = mocker.core();

    // Day one opened both legs after the 10:00 fire; day two kept gold.
    assert_eq!(core.account.volume(AU), 1.0);
    // Silver was auto-exited on day two.
    assert_eq!(core.account.volume(AG), 0.0);

    // The day-one entries filled on the first tick after the fire: the
    // 10:01 bar opens at base + 30 - 0.5.
    let ag_open = core
        .logs
        .trades
        .iter()
        .find(|t| t.code == AG && t.action == "OPEN")
        .expect("silver open trade");
    assert_eq!(ag_open.price, 129.5);
    assert_eq!(ag_open.qty, 2.0);

    core.account.check_volume_invariant().unwrap();
}

#[test]
fn test_auto_exit_logs_signal_and_close() {
    let mocker = run_rebalance();
    let core = mocker.core();

    // The missing silver target produced an autoexit signal on day two.
    assert!(
        core.logs
            .signals
            .iter()
            .any(|s| s.code == AG && s.target == 0.0 && s.usertag.as_str() == "autoexit")
    );

    // And exactly one close row for the silver leg, tagged accordingly.
    let closes: Vec<_> = core.logs.closes.iter().filter(|c| c.code == AG).collect();
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].qty, 2.0);
    assert_eq!(closes[0].entertag.as_str(), "d1");
    assert_eq!(closes[0].exittag.as_str(), "autoexit");

    // Gold was restated, not churned: one open, no closes.
    assert!(core.logs.closes.iter().all(|c| c.code != AU));
    assert_eq!(
        core.logs
            .trades
            .iter()
            .filter(|t| t.code == AU && t.action == "OPEN")
            .count(),
        1
    );
}

#[test]
fn test_two_sessions_two_fund_rows() {
    let mocker = run_rebalance();
    let core = mocker.core();

    assert_eq!(core.logs.funds.len(), 2);
    assert_eq!(core.logs.funds[0].date, 20240105);
    assert_eq!(core.logs.funds[1].date, 20240108);
    // Open positions at each session end produce positions.csv rows.
    assert!(core.logs.positions.iter().any(|p| p.date == 20240105 && p.code == AG));
    assert!(core.logs.positions.iter().any(|p| p.date == 20240108 && p.code == AU));
}

#[test]
fn test_bar_mode_fallback_without_task() {
    // A SEL context can also run bar-driven when no task is registered.
    struct Passive;
    impl SelStrategy for Passive {
        fn name(&self) -> &str {
            "passive"
        }
        fn on_init(&mut self, ctx: &mut SelContext<'_>) {
            let _ = ctx.stra_get_bars(AG, Period::Min1, 1, 5);
        }
        fn on_schedule(&mut self, _ctx: &mut SelContext<'_>, _date: u32, _time: u32) {}
    }

    let mut reader = MemoryReader::new();
    reader.add_bars(AG, Period::Min1, day_bars(20240105, 100.0));
    let mut rep = Replayer::new(
        Box::new(reader),
        Arc::new(metadata()),
        ReplayerOptions {
            begin_time: 202401050900,
            end_time: 202401051130,
            ..ReplayerOptions::default()
        },
    );
    rep.set_mode(ReplayMode::Bar);
    let mut mocker = SelMocker::new("pv0", Box::new(Passive), Slippage::default());
    mocker.bind(&rep);
    rep.run(&mut mocker).unwrap();

    // No trades, but the session still produced a funds row.
    assert!(mocker.core().logs.trades.is_empty());
    assert_eq!(mocker.core().logs.funds.len(), 1);
}
