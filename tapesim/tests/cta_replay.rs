//! End-to-end CTA replay: bar-mode scheduling, immediate in-bar fills,
//! deferred tick signals, accounting identities, rollover auto-clear and
//! byte-identical re-runs.

use std::sync::Arc;

use smol_str::SmolStr;
use tapesim::{
    CtaMocker, CtaStrategy, ReplayMode, Replayer, ReplayerOptions, Slippage,
    context::ClearPolicy,
    context::cta::CtaContext,
};
use tapesim_data::{
    Bar, MemoryReader, Period,
    model::time::{bar_minute, encode_bar_time},
};
use tapesim_instrument::{
    MetadataManager,
    commodity::CommoditySpec,
    fee::FeeTemplate,
    holiday::HolidayCalendar,
    hot::{HotRules, HotSwitch},
    session::{SessionSpec, TimeWindow},
};

const CODE: &str = "SHFE.ag.2412";

fn metadata() -> MetadataManager {
    let mut meta = MetadataManager::default();
    meta.add_session(SessionSpec {
        id: SmolStr::new("FD0900"),
        name: SmolStr::new("futures day"),
        offset: 0,
        auction: None,
        sections: vec![TimeWindow::new(900, 1130), TimeWindow::new(1330, 1500)],
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
        can_short: true,
        is_stock: false,
    });
    meta.add_fee("SHFE.ag", FeeTemplate::new(1.0, 1.0, 1.0, true, 0.1));
    meta
}

/// One trading day of 1-minute bars, closes `base + index`.
fn day_bars(date: u32, labels: &[u32], base: f64) -> Vec<Bar> {
    labels
        .iter()
        .enumerate()
        .map(|(i, &hhmm)| {
            let close = base + i as f64;
            Bar {
                date,
                time: encode_bar_time(date, hhmm),
                open: close - 0.5,
                high: close + 0.5,
                low: close - 1.0,
                close,
                volume: 40.0,
                turnover: close * 40.0,
                open_interest: 100.0,
                ..Bar::default()
            }
        })
        .collect()
}

fn labels(from: u32, count: usize) -> Vec<u32> {
    let mut labels = Vec::with_capacity(count);
    let (mut hh, mut mm) = (from / 100, from % 100);
    for _ in 0..count {
        labels.push(hh * 100 + mm);
        mm += 1;
        if mm == 60 {
            mm = 0;
            hh += 1;
        }
    }
    labels
}

fn replayer(reader: MemoryReader, meta: MetadataManager, begin: u64, end: u64) -> Replayer {
    Replayer::new(
        Box::new(reader),
        Arc::new(meta),
        ReplayerOptions {
            begin_time: begin,
            end_time: end,
            align_by_section: true,
            ..ReplayerOptions::default()
        },
    )
}

/// Opens one lot when the 09:33 bar closes, exits on the 09:36 close.
struct OpenClose;

impl CtaStrategy for OpenClose {
    fn name(&self) -> &str {
        "open_close"
    }

    fn on_init(&mut self, ctx: &mut CtaContext<'_>) {
        let _ = ctx.stra_get_main_bars(CODE, Period::Min1, 1, 10);
    }

    fn on_bar(&mut self, ctx: &mut CtaContext<'_>, code: &str, _p: Period, _t: u32, bar: &Bar) {
        match bar_minute(bar.time) {
            933 => ctx.stra_set_position(code, 1.0, "enter", 0.0, 0.0),
            936 => ctx.stra_set_position(code, 0.0, "exit", 0.0, 0.0),
            _ => {}
        }
    }
}

fn run_open_close() -> CtaMocker {
    let mut reader = MemoryReader::new();
    reader.add_bars(CODE, Period::Min1, day_bars(20240105, &labels(931, 10), 100.0));

    let mut rep = replayer(reader, metadata(), 202401050900, 202401051500);
    let mut mocker = CtaMocker::new("oc0", Box::new(OpenClose), Slippage::default());
    mocker.bind(&rep);
    rep.set_mode(ReplayMode::Bar);
    rep.run(&mut mocker).unwrap();
    mocker
}

#[test]
fn test_cta_open_close_accounting() {
    let mocker = run_open_close();
    let core = mocker.core();

    // 09:33 closes at 102, 09:36 at 105: profit (105-102)*1*10 = 30,
    // per-lot fees 1.0 on each leg.
    assert_eq!(core.logs.trades.len(), 2);
    assert_eq!(core.logs.closes.len(), 1);
    let close = &core.logs.closes[0];
    assert_eq!(close.openprice, 102.0);
    assert_eq!(close.closeprice, 105.0);
    assert!((close.profit - 30.0).abs() < 1e-6);
    assert_eq!(close.entertag.as_str(), "enter");
    assert_eq!(close.exittag.as_str(), "exit");

    let fund = &core.account.fund;
    assert!((fund.profit - 30.0).abs() < 1e-6);
    assert!((fund.fees - 2.0).abs() < 1e-6);
    // balance = prebalance of first session + realised - fees
    assert!((fund.balance - (0.0 + 30.0 - 2.0)).abs() < 1e-6);

    // Signals were logged for both actions.
    assert_eq!(core.logs.signals.len(), 2);

    // One session, one funds row.
    assert_eq!(core.logs.funds.len(), 1);
    assert_eq!(core.logs.funds[0].date, 20240105);

    core.account.check_volume_invariant().unwrap();
}

#[test]
fn test_cta_trade_rows_match_fill_count() {
    let mocker = run_open_close();
    let core = mocker.core();

    // Every fill appends exactly one trades.csv row and every
    // FIFO-consuming fill one closes.csv row.
    let opens = core.logs.trades.iter().filter(|t| t.action == "OPEN").count();
    let closes = core.logs.trades.iter().filter(|t| t.action == "CLOSE").count();
    assert_eq!(opens, 1);
    assert_eq!(closes, core.logs.closes.len());
}

#[test]
fn test_replay_is_byte_identical() {
    let dir = std::env::temp_dir().join(format!("tapesim-det-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    let mut first = run_open_close();
    first.finish(&dir.join("a")).unwrap();
    let mut second = run_open_close();
    second.finish(&dir.join("b")).unwrap();

    for file in ["trades.csv", "closes.csv", "funds.csv", "signals.csv", "positions.csv"] {
        let a = std::fs::read(dir.join("a").join("oc0").join(file)).unwrap();
        let b = std::fs::read(dir.join("b").join("oc0").join(file)).unwrap();
        assert_eq!(a, b, "{file} differs between identical replays");
    }

    let _ = std::fs::remove_dir_all(&dir);
}

/// Requests the position change from on_tick, so the signal defers to the
/// instrument's next tick.
struct DeferredEntry {
    armed: bool,
}

impl CtaStrategy for DeferredEntry {
    fn name(&self) -> &str {
        "deferred_entry"
    }

    fn on_init(&mut self, ctx: &mut CtaContext<'_>) {
        let _ = ctx.stra_get_main_bars(CODE, Period::Min1, 1, 10);
        ctx.stra_sub_ticks(CODE);
    }

    fn on_tick(&mut self, ctx: &mut CtaContext<'_>, code: &str, tick: &tapesim_data::Tick) {
        if !self.armed && tick.action_time / 100_000 == 933 {
            self.armed = true;
            ctx.stra_set_position(code, 1.0, "tick-entry", 0.0, 0.0);
        }
    }
}

#[test]
fn test_tick_signal_defers_to_next_tick() {
    let mut reader = MemoryReader::new();
    reader.add_bars(CODE, Period::Min1, day_bars(20240105, &labels(931, 10), 100.0));

    let mut rep = replayer(reader, metadata(), 202401050900, 202401051500);
    let mut mocker = CtaMocker::new("df0", Box::new(DeferredEntry { armed: false }), Slippage::default());
    mocker.bind(&rep);
    rep.set_mode(ReplayMode::Bar);
    rep.run(&mut mocker).unwrap();

    let core = mocker.core();
    assert_eq!(core.logs.trades.len(), 1);
    let trade = &core.logs.trades[0];
    // Armed on the first synthetic tick of the 09:33 bar (its open,
    // 101.5); the fill lands on the following tick, the bar's high.
    assert_eq!(trade.price, 102.5);
    assert_eq!(core.account.volume(CODE), 1.0);
}

/// Holds a lot into a rollover date; the engine must flatten it before
/// day-two trading.
struct HoldThrough;

impl CtaStrategy for HoldThrough {
    fn name(&self) -> &str {
        "hold_through"
    }

    fn on_init(&mut self, ctx: &mut CtaContext<'_>) {
        let _ = ctx.stra_get_main_bars(CODE, Period::Min1, 1, 10);
    }

    fn on_bar(&mut self, ctx: &mut CtaContext<'_>, code: &str, _p: Period, _t: u32, bar: &Bar) {
        if bar.date == 20240105 && bar_minute(bar.time) == 933 {
            ctx.stra_set_position(code, 3.0, "hold", 0.0, 0.0);
        }
    }
}

#[test]
fn test_rollover_auto_clear() {
    let mut meta = metadata();
    let mut rules = HotRules::default();
    rules.insert(
        "SHFE.ag",
        vec![
            HotSwitch::new(20240101, SmolStr::default(), SmolStr::new("ag2412"), 1.0),
            HotSwitch::new(20240108, SmolStr::new("ag2412"), SmolStr::new("ag2506"), 1.0),
        ],
    );
    meta.set_hot_rules(rules);

    let mut reader = MemoryReader::new();
    let mut bars = day_bars(20240105, &labels(931, 10), 100.0);
    bars.extend(day_bars(20240108, &labels(931, 10), 120.0));
    reader.add_bars(CODE, Period::Min1, bars);

    let mut rep = replayer(reader, meta, 202401050900, 202401081500);
    let mut mocker = CtaMocker::new("rc0", Box::new(HoldThrough), Slippage::default());
    mocker.core_mut().clear_policy = ClearPolicy { active: true, includes: vec![], excludes: vec![] };
    mocker.bind(&rep);
    rep.set_mode(ReplayMode::Bar);
    rep.run(&mut mocker).unwrap();

    let core = mocker.core();
    // The leg was flattened at the first tick of the switch date.
    assert_eq!(core.account.volume(CODE), 0.0);
    assert_eq!(core.logs.closes.len(), 1);
    assert_eq!(core.logs.closes[0].exittag.as_str(), "autoclear");
    assert_eq!(core.logs.closes[0].qty, 3.0);
    // Booked at the first synthetic tick price of day two (09:31 open).
    assert_eq!(core.logs.closes[0].closeprice, 119.5);
    assert!(
        core.logs
            .signals
            .iter()
            .any(|s| s.usertag.as_str() == "autoclear" && s.target == 0.0)
    );
}

#[test]
fn test_snapshot_resume_round_trip() {
    let dir = std::env::temp_dir().join(format!("tapesim-resume-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    // First leg: open one lot and keep it.
    struct OpenOnly;
    impl CtaStrategy for OpenOnly {
        fn name(&self) -> &str {
            "open_only"
        }
        fn on_init(&mut self, ctx: &mut CtaContext<'_>) {
            let _ = ctx.stra_get_main_bars(CODE, Period::Min1, 1, 10);
        }
        fn on_bar(&mut self, ctx: &mut CtaContext<'_>, code: &str, _p: Period, _t: u32, bar: &Bar) {
            if bar_minute(bar.time) == 933 {
                ctx.stra_set_position(code, 1.0, "keep", 0.0, 0.0);
            }
        }
    }

    let mut reader = MemoryReader::new();
    reader.add_bars(CODE, Period::Min1, day_bars(20240105, &labels(931, 10), 100.0));
    let mut rep = replayer(reader, metadata(), 202401050900, 202401051500);
    let mut mocker = CtaMocker::new("rs0", Box::new(OpenOnly), Slippage::default());
    mocker.bind(&rep);
    rep.set_mode(ReplayMode::Bar);
    rep.run(&mut mocker).unwrap();
    let fund_before = mocker.core().account.fund.clone();
    mocker.finish(&dir).unwrap();

    // The snapshot restores to an equivalent account.
    let snapshot = tapesim::output::load_snapshot(dir.join("rs0")).unwrap();
    let restored = snapshot.restore();
    assert_eq!(restored.fund, fund_before);
    assert_eq!(restored.volume(CODE), 1.0);
    restored.check_volume_invariant().unwrap();

    let _ = std::fs::remove_dir_all(&dir);
}
