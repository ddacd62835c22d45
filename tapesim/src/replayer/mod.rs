//! The virtual clock and replay scheduler: merges bar, tick and L2 streams
//! by virtual timestamp, synthesises ticks where only bars exist, and
//! drives a [`DataSink`] through session, tick, bar-close and task
//! callbacks in deterministic order.

use fnv::FnvHashMap;
use indexmap::{IndexMap, IndexSet};
use smol_str::SmolStr;
use std::collections::BTreeSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Instant;

use tapesim_data::{
    cache::{CURSOR_UNSET, ReplayCache},
    model::{
        Bar, Period, Tick,
        time::{bar_date, bar_minute, encode_bar_time},
    },
    reader::HistoryReader,
    slice::{BarSlice, TickSlice},
};
use tapesim_instrument::{
    MetadataManager, commodity::CommoditySpec, holiday::HolidayCalendar, session::SessionSpec,
};
use tracing::{debug, error, info, warn};

use crate::error::TapesimError;

pub mod task;

pub use task::{TaskInfo, TaskPeriod};

/// How the scheduler steps the virtual clock.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReplayMode {
    /// Steps are bar closes of the main subscription (CTA default).
    Bar,
    /// Every tick is a step (HFT); bars close on minute rollover.
    Tick,
    /// Cron-like fires resolved through the trading calendar (SEL).
    Task,
}

/// Receiver of replayed events. All callbacks run on the scheduler thread
/// and take the replayer re-entrantly so contexts can query engine
/// services mid-callback.
#[allow(unused_variables)]
pub trait DataSink {
    fn handle_init(&mut self, rep: &mut Replayer);
    fn handle_session_begin(&mut self, rep: &mut Replayer, tdate: u32);
    fn handle_session_end(&mut self, rep: &mut Replayer, tdate: u32);
    fn handle_section_end(&mut self, rep: &mut Replayer, tdate: u32, time: u32) {}
    /// `px_type`: 0 open, 1 high, 2 low, 3 close for synthetic ticks,
    /// 0 for real ticks.
    fn handle_tick(&mut self, rep: &mut Replayer, code: &str, tick: &Tick, px_type: u32);
    fn handle_order_queue(
        &mut self,
        rep: &mut Replayer,
        code: &str,
        item: &tapesim_data::OrderQueueItem,
    ) {
    }
    fn handle_order_detail(
        &mut self,
        rep: &mut Replayer,
        code: &str,
        item: &tapesim_data::OrderDetailItem,
    ) {
    }
    fn handle_transaction(
        &mut self,
        rep: &mut Replayer,
        code: &str,
        item: &tapesim_data::TransactionItem,
    ) {
    }
    fn handle_bar_close(
        &mut self,
        rep: &mut Replayer,
        code: &str,
        period: Period,
        times: u32,
        bar: &Bar,
    );
    fn handle_schedule(&mut self, rep: &mut Replayer, date: u32, time: u32) {}
    fn handle_replay_done(&mut self, rep: &mut Replayer) {}
}

/// Replay progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Current virtual time, `YYYYMMDDHHMM`.
    pub t_cur: u64,
    /// Replay end, `YYYYMMDDHHMM`.
    pub t_end: u64,
    /// Fraction completed in `[0, 1]`.
    pub progress: f64,
    pub elapsed_ms: u128,
}

/// Cooperative stop flag, checked between steps; in-flight callbacks run
/// to completion.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct ReplayerOptions {
    /// `YYYYMMDDHHMM`
    pub begin_time: u64,
    pub end_time: u64,
    pub align_by_section: bool,
    pub tick_enabled: bool,
    pub nosim_if_notrade: bool,
    pub cache_clear_days: u32,
    /// Calendar used for day iteration and task rolling.
    pub calendar: SmolStr,
}

impl Default for ReplayerOptions {
    fn default() -> Self {
        Self {
            begin_time: 0,
            end_time: 0,
            align_by_section: false,
            tick_enabled: false,
            nosim_if_notrade: false,
            cache_clear_days: 30,
            calendar: SmolStr::new_static("CHINA"),
        }
    }
}

/// One bar subscription.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BarSub {
    pub code: SmolStr,
    pub period: Period,
    pub times: u32,
}

impl BarSub {
    fn key(&self) -> SmolStr {
        SmolStr::new(format!("{}#{}#{}", self.code, self.period, self.times))
    }

    /// Minutes covered per bar, for close ordering (daily sorts last).
    fn span(&self) -> u32 {
        if self.period.is_day() {
            u32::MAX
        } else {
            self.period.minutes() * self.times.max(1)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DayPrice {
    date: u32,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

type ProgressCallback = Box<dyn FnMut(&Progress) + Send>;

/// The historical-data replayer: owns the reader, the replay caches, and
/// the virtual clock; drives a [`DataSink`] through one backtest run.
pub struct Replayer {
    reader: Box<dyn HistoryReader>,
    meta: Arc<MetadataManager>,
    cache: ReplayCache,

    mode: ReplayMode,
    begin_time: u64,
    end_time: u64,
    tick_enabled: bool,
    nosim_if_notrade: bool,
    calendar_name: SmolStr,

    cur_date: u32,
    cur_time: u32,
    cur_secs: u32,
    cur_tdate: u32,
    closed_tdate: u32,
    opened_tdate: u32,

    main_key: Option<BarSub>,
    bar_subs: IndexMap<SmolStr, BarSub>,
    tick_subs: IndexSet<SmolStr>,
    ordque_subs: IndexSet<SmolStr>,
    orddtl_subs: IndexSet<SmolStr>,
    trans_subs: IndexSet<SmolStr>,

    price_map: FnvHashMap<SmolStr, f64>,
    day_prices: FnvHashMap<SmolStr, DayPrice>,
    last_ticks: FnvHashMap<SmolStr, Tick>,

    task: Option<TaskInfo>,
    stop: StopHandle,
    progress_cb: Option<ProgressCallback>,
    progress_every: u32,
    steps: u64,
    started_at: Option<Instant>,
    /// Set while a real tick stream drives the day; suppresses synthetic
    /// ticks during minute-close stepping.
    real_ticks_active: bool,
}

impl std::fmt::Debug for Replayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replayer")
            .field("mode", &self.mode)
            .field("begin_time", &self.begin_time)
            .field("end_time", &self.end_time)
            .field("cur_date", &self.cur_date)
            .field("cur_time", &self.cur_time)
            .field("cur_tdate", &self.cur_tdate)
            .finish_non_exhaustive()
    }
}

fn next_minute(hhmm: u32) -> u32 {
    let (hh, mm) = (hhmm / 100, hhmm % 100);
    if mm >= 59 { (hh + 1) % 24 * 100 } else { hhmm / 100 * 100 + mm + 1 }
}

impl Replayer {
    pub fn new(
        reader: Box<dyn HistoryReader>,
        meta: Arc<MetadataManager>,
        options: ReplayerOptions,
    ) -> Self {
        let cache = ReplayCache::new(options.align_by_section, options.cache_clear_days);
        let cur_date = (options.begin_time / 10_000) as u32;
        let cur_time = (options.begin_time % 10_000) as u32;
        Self {
            reader,
            meta,
            cache,
            mode: ReplayMode::Bar,
            begin_time: options.begin_time,
            end_time: options.end_time,
            tick_enabled: options.tick_enabled,
            nosim_if_notrade: options.nosim_if_notrade,
            calendar_name: options.calendar,
            cur_date,
            cur_time,
            cur_secs: 0,
            cur_tdate: 0,
            closed_tdate: 0,
            opened_tdate: 0,
            main_key: None,
            bar_subs: IndexMap::new(),
            tick_subs: IndexSet::new(),
            ordque_subs: IndexSet::new(),
            orddtl_subs: IndexSet::new(),
            trans_subs: IndexSet::new(),
            price_map: FnvHashMap::default(),
            day_prices: FnvHashMap::default(),
            last_ticks: FnvHashMap::default(),
            task: None,
            stop: StopHandle::default(),
            progress_cb: None,
            progress_every: 64,
            steps: 0,
            started_at: None,
            real_ticks_active: false,
        }
    }

    pub fn set_mode(&mut self, mode: ReplayMode) {
        self.mode = mode;
    }

    pub fn register_task(&mut self, task: TaskInfo) {
        self.task = Some(task);
        self.mode = ReplayMode::Task;
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Install a progress callback fired every `every` steps.
    pub fn set_progress_callback(
        &mut self,
        every: u32,
        callback: impl FnMut(&Progress) + Send + 'static,
    ) {
        self.progress_every = every.max(1);
        self.progress_cb = Some(Box::new(callback));
    }

    // --- virtual clock accessors -----------------------------------------

    pub fn date(&self) -> u32 {
        self.cur_date
    }

    /// `HHMM` minute time.
    pub fn min_time(&self) -> u32 {
        self.cur_time
    }

    /// `SSmmm` seconds part.
    pub fn secs(&self) -> u32 {
        self.cur_secs
    }

    pub fn trading_date(&self) -> u32 {
        self.cur_tdate
    }

    /// The most recently completed trading date.
    pub fn closed_tdate(&self) -> u32 {
        self.closed_tdate
    }

    /// The most recently opened trading date.
    pub fn opened_tdate(&self) -> u32 {
        self.opened_tdate
    }

    /// `YYYYMMDDHHMM`, the stamp used in accounting rows.
    pub fn full_minute_time(&self) -> u64 {
        self.cur_date as u64 * 10_000 + self.cur_time as u64
    }

    /// Full-precision signal stamp: `YYYYMMDD * 1e9 + HHMM * 1e5 + SSmmm`.
    pub fn gen_time(&self) -> u64 {
        self.cur_date as u64 * 1_000_000_000 + self.cur_time as u64 * 100_000 + self.cur_secs as u64
    }

    fn cur_bar_stamp(&self) -> u64 {
        encode_bar_time(self.cur_date, self.cur_time)
    }

    // --- metadata & price services ---------------------------------------

    pub fn metadata(&self) -> &MetadataManager {
        &self.meta
    }

    pub fn commodity_info(&self, code: &str) -> Option<&CommoditySpec> {
        self.meta.commodity_of(code)
    }

    pub fn session_info(&self, code: &str) -> Option<&SessionSpec> {
        self.meta.session_of(code)
    }

    pub fn calc_fee(
        &self,
        code: &str,
        price: f64,
        qty: f64,
        kind: tapesim_instrument::fee::FeeKind,
    ) -> f64 {
        self.meta.calc_fee(code, price, qty, kind)
    }

    pub fn cur_price(&self, code: &str) -> f64 {
        self.price_map.get(code).copied().unwrap_or(0.0)
    }

    pub fn update_price(&mut self, code: &str, price: f64) {
        self.price_map.insert(SmolStr::new(code), price);
    }

    /// Current-day OHLC: `flag` 0 close, 1 open, 2 high, 3 low.
    pub fn day_price(&self, code: &str, flag: u32) -> f64 {
        let Some(day) = self.day_prices.get(code) else {
            return 0.0;
        };
        match flag {
            1 => day.open,
            2 => day.high,
            3 => day.low,
            _ => day.close,
        }
    }

    pub fn last_tick(&self, code: &str) -> Option<&Tick> {
        self.last_ticks.get(code)
    }

    // --- subscriptions ----------------------------------------------------

    /// Subscribe to a bar series and return the closed history up to the
    /// virtual clock. A reader failure logs and returns an empty slice.
    pub fn get_kline_slice(
        &mut self,
        code: &str,
        period: Period,
        times: u32,
        count: usize,
        is_main: bool,
    ) -> BarSlice {
        let Some(session) = self.meta.session_of(code).cloned() else {
            warn!(code, "no session template, bar subscription ignored");
            return BarSlice::empty();
        };

        let now = self.cur_bar_stamp();
        let times = times.max(1);
        let entry = match self
            .cache
            .ensure_bars(self.reader.as_ref(), &session, code, period, times, now)
        {
            Ok(entry) => entry,
            Err(err) => {
                error!(code, %err, "bar cache load failed, treating as empty");
                return BarSlice::empty();
            }
        };

        if entry.cursor == CURSOR_UNSET {
            // Bars at or before the clock are history, not replay events.
            let target = if period.is_day() { self.cur_date as u64 } else { now };
            entry.advance_to(target);
        }
        let slice = entry.closed_slice(count);

        let sub = BarSub { code: SmolStr::new(code), period, times };
        if is_main || self.main_key.is_none() {
            self.main_key = Some(sub.clone());
        }
        self.bar_subs.entry(sub.key()).or_insert(sub);

        if let Some(last) = slice.last() {
            self.price_map.insert(SmolStr::new(code), last.close);
        }
        slice
    }

    /// Already-replayed order-queue events of the current day, newest
    /// `count`.
    pub fn get_order_queue_slice(
        &self,
        code: &str,
        count: usize,
    ) -> tapesim_data::OrderQueueSlice {
        match self.cache.order_queues_entry(code) {
            Some(entry) => {
                let end = entry.cursor.min(entry.items.len());
                tapesim_data::Slice::from_range(
                    Arc::clone(&entry.items),
                    end.saturating_sub(count)..end,
                )
            }
            None => tapesim_data::Slice::empty(),
        }
    }

    /// Already-replayed order-detail events of the current day, newest
    /// `count`.
    pub fn get_order_detail_slice(
        &self,
        code: &str,
        count: usize,
    ) -> tapesim_data::OrderDetailSlice {
        match self.cache.order_details_entry(code) {
            Some(entry) => {
                let end = entry.cursor.min(entry.items.len());
                tapesim_data::Slice::from_range(
                    Arc::clone(&entry.items),
                    end.saturating_sub(count)..end,
                )
            }
            None => tapesim_data::Slice::empty(),
        }
    }

    /// Already-replayed trade prints of the current day, newest `count`.
    pub fn get_transaction_slice(
        &self,
        code: &str,
        count: usize,
    ) -> tapesim_data::TransactionSlice {
        match self.cache.transactions_entry(code) {
            Some(entry) => {
                let end = entry.cursor.min(entry.items.len());
                tapesim_data::Slice::from_range(
                    Arc::clone(&entry.items),
                    end.saturating_sub(count)..end,
                )
            }
            None => tapesim_data::Slice::empty(),
        }
    }

    /// Recent ticks ending at the virtual clock.
    pub fn get_tick_slice(&mut self, code: &str, count: usize) -> TickSlice {
        let end = self.cur_date as u64 * 1_000_000_000
            + self.cur_time as u64 * 100_000
            + self.cur_secs as u64;
        match self.reader.read_ticks_by_count(code, count, end) {
            Ok(slice) => slice,
            Err(err) => {
                error!(code, %err, "tick read failed, treating as empty");
                TickSlice::empty()
            }
        }
    }

    pub fn sub_tick(&mut self, code: &str) {
        self.tick_subs.insert(SmolStr::new(code));
        // A tick-only code still needs a bar series to synthesise from.
        if !self.bar_subs.values().any(|sub| sub.code == code) {
            let _ = self.get_kline_slice(code, Period::Min1, 1, 0, false);
        }
    }

    pub fn sub_order_queue(&mut self, code: &str) {
        self.ordque_subs.insert(SmolStr::new(code));
    }

    pub fn sub_order_detail(&mut self, code: &str) {
        self.orddtl_subs.insert(SmolStr::new(code));
    }

    pub fn sub_transaction(&mut self, code: &str) {
        self.trans_subs.insert(SmolStr::new(code));
    }

    pub fn is_tick_enabled(&self) -> bool {
        self.tick_enabled
    }

    /// The subscription driving bar-mode replay, if any.
    pub fn main_sub(&self) -> Option<&BarSub> {
        self.main_key.as_ref()
    }

    fn calendar(&self) -> HolidayCalendar {
        self.meta
            .calendar(self.calendar_name.as_str())
            .cloned()
            .unwrap_or_else(|| HolidayCalendar::new(self.calendar_name.clone(), []))
    }

    // --- run --------------------------------------------------------------

    /// Run the whole replay, driving `sink` until the data range is
    /// exhausted or [`StopHandle::stop`] is observed between steps.
    pub fn run(&mut self, sink: &mut dyn DataSink) -> Result<(), TapesimError> {
        self.started_at = Some(Instant::now());
        info!(mode = ?self.mode, begin = self.begin_time, end = self.end_time, "replay starting");

        sink.handle_init(self);

        let result = match self.mode {
            ReplayMode::Bar => self.run_by_bars(sink),
            ReplayMode::Tick => self.run_by_ticks(sink),
            ReplayMode::Task => self.run_by_tasks(sink),
        };

        let finish = if self.cur_tdate != 0 {
            self.end_session(sink, self.cur_tdate)
        } else {
            Ok(())
        };
        sink.handle_replay_done(self);
        info!(steps = self.steps, "replay finished");
        result.and(finish)
    }

    fn run_by_bars(&mut self, sink: &mut dyn DataSink) -> Result<(), TapesimError> {
        let main = self
            .main_key
            .clone()
            .ok_or_else(|| TapesimError::Config("no bars subscribed before run".into()))?;

        let Some(entry) = self.cache.bars_entry(&main.code, main.period, main.times) else {
            return Err(TapesimError::Config(format!("main bars missing for {}", main.code)));
        };
        let bars = Arc::clone(&entry.bars);
        let start = if entry.cursor == CURSOR_UNSET { 0 } else { entry.cursor as usize };
        let end_stamp = self.end_stamp_for(main.period);
        let total = bars.len().saturating_sub(start).max(1);

        for (done, bar) in bars.iter().enumerate().skip(start) {
            if self.stop.is_stopped() {
                warn!("replay stopped by request");
                break;
            }
            let stamp = bar.stamp();
            if stamp > end_stamp {
                break;
            }

            let tdate = bar.date;
            if tdate != self.cur_tdate {
                if self.cur_tdate != 0 {
                    self.end_session(sink, self.cur_tdate)?;
                }
                self.begin_session(sink, tdate);
            }

            self.step_to(sink, stamp)?;
            self.notify_progress((done - start + 1) as f64 / total as f64);
        }

        Ok(())
    }

    fn run_by_ticks(&mut self, sink: &mut dyn DataSink) -> Result<(), TapesimError> {
        let calendar = self.calendar();
        let begin_date = (self.begin_time / 10_000) as u32;
        let end_date = (self.end_time / 10_000) as u32;

        let mut date = calendar.next_trading_day(begin_date, true);
        let total_days = (end_date.saturating_sub(begin_date) + 1) as f64;

        while date <= end_date {
            if self.stop.is_stopped() {
                warn!("replay stopped by request");
                break;
            }
            self.replay_tick_day(sink, date)?;
            self.notify_progress((date - begin_date + 1) as f64 / total_days);
            date = calendar.next_trading_day(date, false);
        }
        Ok(())
    }

    fn replay_tick_day(&mut self, sink: &mut dyn DataSink, tdate: u32) -> Result<(), TapesimError> {
        let codes: Vec<SmolStr> = self.tick_subs.iter().cloned().collect();

        let mut have_ticks = false;
        if self.tick_enabled {
            for code in &codes {
                match self.cache.ensure_ticks(self.reader.as_ref(), code, tdate, false) {
                    Ok(entry) => have_ticks |= entry.remaining() > 0,
                    Err(err) => error!(code = code.as_str(), %err, "tick load failed"),
                }
            }
            for code in self.ordque_subs.clone() {
                if let Err(err) = self.cache.ensure_order_queues(self.reader.as_ref(), &code, tdate)
                {
                    error!(code = code.as_str(), %err, "order queue load failed");
                }
            }
            for code in self.orddtl_subs.clone() {
                if let Err(err) =
                    self.cache.ensure_order_details(self.reader.as_ref(), &code, tdate)
                {
                    error!(code = code.as_str(), %err, "order detail load failed");
                }
            }
            for code in self.trans_subs.clone() {
                if let Err(err) = self.cache.ensure_transactions(self.reader.as_ref(), &code, tdate)
                {
                    error!(code = code.as_str(), %err, "transaction load failed");
                }
            }
        }

        if !have_ticks {
            // No tick data: fall back to bar-driven synthetic ticks.
            return self.replay_sim_day(sink, tdate);
        }

        self.begin_session(sink, tdate);
        self.real_ticks_active = true;

        let mut forming_label: Option<u32> = None;
        loop {
            if self.stop.is_stopped() {
                break;
            }

            let Some((_, kind, code)) = self.peek_next_hf_event(&codes) else {
                break;
            };

            match kind {
                HfStream::Tick => {
                    let Some(tick) = self
                        .cache
                        .ticks_entry_mut(&code)
                        .and_then(|entry| entry.advance().cloned())
                    else {
                        continue;
                    };
                    // Bars labelled before this tick's forming bar close
                    // first.
                    let label = next_minute(tick.action_time / 100_000);
                    match forming_label {
                        Some(current) if current != label => {
                            let close_stamp = encode_bar_time(tick.action_date, current);
                            self.step_to(sink, close_stamp)?;
                            forming_label = Some(label);
                        }
                        None => forming_label = Some(label),
                        _ => {}
                    }
                    self.dispatch_tick(sink, &tick, 0);
                }
                HfStream::OrderQueue => {
                    let item = self
                        .cache
                        .order_queues_entry_mut(&code)
                        .and_then(|entry| entry.advance().cloned());
                    if let Some(item) = item {
                        sink.handle_order_queue(self, &code, &item);
                    }
                }
                HfStream::OrderDetail => {
                    let item = self
                        .cache
                        .order_details_entry_mut(&code)
                        .and_then(|entry| entry.advance().cloned());
                    if let Some(item) = item {
                        sink.handle_order_detail(self, &code, &item);
                    }
                }
                HfStream::Transaction => {
                    let item = self
                        .cache
                        .transactions_entry_mut(&code)
                        .and_then(|entry| entry.advance().cloned());
                    if let Some(item) = item {
                        sink.handle_transaction(self, &code, &item);
                    }
                }
            }
            self.steps += 1;
        }

        // Close whatever is still forming, then the day.
        if let Some(label) = forming_label {
            let close_stamp = encode_bar_time(self.cur_date, label);
            self.step_to(sink, close_stamp)?;
        }
        self.real_ticks_active = false;
        self.end_session(sink, tdate)?;
        Ok(())
    }

    /// Bar-driven day used by tick mode when no tick data exists and by
    /// task mode to move prices between fires.
    fn replay_sim_day(&mut self, sink: &mut dyn DataSink, tdate: u32) -> Result<(), TapesimError> {
        let stamps = self.day_bar_stamps(tdate);
        if stamps.is_empty() {
            debug!(tdate, "no data for day");
            return Ok(());
        }

        self.begin_session(sink, tdate);
        for stamp in stamps {
            if self.stop.is_stopped() {
                break;
            }
            self.step_to(sink, stamp)?;
        }
        self.end_session(sink, tdate)?;
        Ok(())
    }

    fn run_by_tasks(&mut self, sink: &mut dyn DataSink) -> Result<(), TapesimError> {
        let task = self
            .task
            .clone()
            .ok_or_else(|| TapesimError::Config("task mode without a registered task".into()))?;
        let calendar = self.calendar();
        let begin_date = (self.begin_time / 10_000) as u32;
        let end_date = (self.end_time / 10_000) as u32;
        let fires = task.fire_dates(&calendar, begin_date, end_date);
        let total_days = (end_date.saturating_sub(begin_date) + 1) as f64;

        let mut date = calendar.next_trading_day(begin_date, true);
        while date <= end_date {
            if self.stop.is_stopped() {
                warn!("replay stopped by request");
                break;
            }

            let stamps = self.day_bar_stamps(date);
            let fire_today = fires.contains(&date);
            let fire_stamp = encode_bar_time(date, task.time);

            self.begin_session(sink, date);
            let mut fired = !fire_today;
            for stamp in stamps {
                if self.stop.is_stopped() {
                    break;
                }
                if !fired && stamp > fire_stamp {
                    self.fire_task(sink, date, task.time);
                    fired = true;
                }
                self.step_to(sink, stamp)?;
            }
            if !fired && !self.stop.is_stopped() {
                self.fire_task(sink, date, task.time);
            }
            self.end_session(sink, date)?;

            self.notify_progress((date - begin_date + 1) as f64 / total_days);
            date = calendar.next_trading_day(date, false);
        }
        Ok(())
    }

    fn fire_task(&mut self, sink: &mut dyn DataSink, date: u32, time: u32) {
        self.cur_time = time;
        self.cur_secs = 0;
        debug!(date, time, "task fired");
        sink.handle_schedule(self, date, time);
    }

    // --- stepping ---------------------------------------------------------

    /// Per-sub advancement target for a driving stamp: daily caches close
    /// only when the clock passes their date, minute caches close on their
    /// encoded stamps.
    fn sub_target(sub: &BarSub, stamp: u64) -> u64 {
        let is_date_stamp = stamp < 100_000_000;
        match (sub.period.is_day(), is_date_stamp) {
            (true, true) | (false, false) => stamp,
            // Minute clock: a daily bar of date D is complete only once
            // the clock has moved past D entirely.
            (true, false) => (bar_date(stamp) as u64).saturating_sub(1),
            // Date clock: minute bars of that date are all complete.
            (false, true) => encode_bar_time(stamp as u32, 2359),
        }
    }

    /// Advance every bar cache to `stamp`; synthesise ticks from the
    /// finest closing series per code, then dispatch bar closes ordered by
    /// ascending period span.
    fn step_to(&mut self, sink: &mut dyn DataSink, stamp: u64) -> Result<(), TapesimError> {
        if stamp >= 100_000_000 {
            self.cur_date = bar_date(stamp);
            self.cur_time = bar_minute(stamp);
            self.cur_secs = 0;
        }

        let subs: Vec<BarSub> = self.bar_subs.values().cloned().collect();
        let mut closed: Vec<(BarSub, Vec<Bar>)> = Vec::new();
        for sub in subs {
            let Some(entry) = self.cache.bars_entry_mut(&sub.code, sub.period, sub.times) else {
                continue;
            };
            let range = entry.advance_to(Self::sub_target(&sub, stamp));
            if range.is_empty() {
                continue;
            }
            let bars: Vec<Bar> = entry.bars[range].to_vec();
            entry.mark();
            closed.push((sub, bars));
        }

        if closed.is_empty() {
            return Ok(());
        }

        // Finest series first; stable sort keeps subscription order for
        // equal spans.
        closed.sort_by_key(|(sub, _)| sub.span());

        // Synthetic ticks precede every bar close at this timestamp. Only
        // the finest closing series per code feeds the synthesiser.
        if !self.real_ticks_active {
            let mut seen: IndexSet<SmolStr> = IndexSet::new();
            let mut batches: Vec<(SmolStr, u32, Vec<Bar>)> = Vec::new();
            for (sub, bars) in &closed {
                if !seen.insert(sub.code.clone()) {
                    continue;
                }
                batches.push((sub.code.clone(), sub.times, bars.clone()));
            }
            for (code, _, bars) in batches {
                for bar in bars {
                    self.emit_synth_ticks(sink, &code, &bar);
                }
            }
        }

        for (sub, bars) in &closed {
            for bar in bars {
                if !sub.period.is_day() {
                    self.cur_date = bar_date(bar.time);
                    self.cur_time = bar_minute(bar.time);
                }
                self.price_map.insert(sub.code.clone(), bar.close);
                sink.handle_bar_close(self, &sub.code, sub.period, sub.times, bar);
            }
        }

        // Section-end notification off the driving stamp's minute.
        if stamp >= 100_000_000 {
            let minute = bar_minute(stamp);
            let section_closed = closed.iter().any(|(sub, _)| {
                self.meta
                    .session_of(&sub.code)
                    .is_some_and(|s| s.is_section_close(minute))
            });
            if section_closed {
                sink.handle_section_end(self, self.cur_tdate, minute);
            }
        }

        self.steps += 1;
        Ok(())
    }

    fn emit_synth_ticks(&mut self, sink: &mut dyn DataSink, code: &str, bar: &Bar) {
        if self.nosim_if_notrade && bar.volume <= 0.0 {
            return;
        }

        let (date, minute) = if bar.time != 0 {
            (bar_date(bar.time), bar_minute(bar.time))
        } else {
            let close = self
                .meta
                .session_of(code)
                .map(|s| s.close_time())
                .unwrap_or(1500);
            (bar.date, close)
        };

        // Fixed {open, high, low, close} order; volume split evenly with
        // the remainder on the close tick.
        let quarter = (bar.volume / 4.0).floor();
        let prices = [bar.open, bar.high, bar.low, bar.close];
        for (px_type, price) in prices.into_iter().enumerate() {
            let volume = if px_type == 3 { bar.volume - quarter * 3.0 } else { quarter };
            let mut tick = Tick {
                code: SmolStr::new(code),
                price,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                volume,
                turnover: bar.turnover / 4.0,
                total_volume: bar.volume,
                open_interest: bar.open_interest,
                trading_date: self.cur_tdate,
                action_date: date,
                action_time: minute * 100_000 + px_type as u32 * 1_000,
                ..Tick::default()
            };
            tick.bid_prices[0] = price;
            tick.ask_prices[0] = price;
            self.dispatch_tick(sink, &tick, px_type as u32);
        }
    }

    fn dispatch_tick(&mut self, sink: &mut dyn DataSink, tick: &Tick, px_type: u32) {
        self.cur_date = tick.action_date;
        self.cur_time = tick.action_time / 100_000;
        self.cur_secs = tick.action_time % 100_000;

        self.price_map.insert(tick.code.clone(), tick.price);

        let day = self.day_prices.entry(tick.code.clone()).or_default();
        if day.date != tick.trading_date {
            *day = DayPrice {
                date: tick.trading_date,
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
            };
        } else {
            day.high = day.high.max(tick.price);
            day.low = day.low.min(tick.price);
            day.close = tick.price;
        }

        self.last_ticks.insert(tick.code.clone(), tick.clone());
        let code = tick.code.clone();
        sink.handle_tick(self, code.as_str(), tick, px_type);
    }

    fn begin_session(&mut self, sink: &mut dyn DataSink, tdate: u32) {
        if self.cur_tdate == tdate {
            return;
        }
        self.cur_tdate = tdate;
        self.opened_tdate = tdate;
        info!(tdate, "session begin");
        sink.handle_session_begin(self, tdate);
    }

    fn end_session(&mut self, sink: &mut dyn DataSink, tdate: u32) -> Result<(), TapesimError> {
        // Daily caches complete at the session close. Their synthetic
        // close ticks fire first, so day-bar-only runs still trigger
        // pending signals before the day ends.
        let subs: Vec<BarSub> = self
            .bar_subs
            .values()
            .filter(|sub| sub.period.is_day())
            .cloned()
            .collect();
        let mut closed: Vec<(BarSub, Vec<Bar>)> = Vec::new();
        for sub in subs {
            let Some(entry) = self.cache.bars_entry_mut(&sub.code, sub.period, sub.times) else {
                continue;
            };
            let range = entry.advance_to(tdate as u64);
            if range.is_empty() {
                continue;
            }
            let bars: Vec<Bar> = entry.bars[range].to_vec();
            entry.mark();
            closed.push((sub, bars));
        }
        closed.sort_by_key(|(sub, _)| sub.times);

        if !self.real_ticks_active {
            let mut seen: IndexSet<SmolStr> = IndexSet::new();
            let mut batches: Vec<(SmolStr, Vec<Bar>)> = Vec::new();
            for (sub, bars) in &closed {
                if !seen.insert(sub.code.clone()) {
                    continue;
                }
                batches.push((sub.code.clone(), bars.clone()));
            }
            for (code, bars) in batches {
                for bar in bars {
                    self.emit_synth_ticks(sink, &code, &bar);
                }
            }
        }

        for (sub, bars) in &closed {
            for bar in bars {
                self.price_map.insert(sub.code.clone(), bar.close);
                sink.handle_bar_close(self, &sub.code, sub.period, sub.times, bar);
            }
        }

        info!(tdate, "session end");
        sink.handle_session_end(self, tdate);
        self.closed_tdate = tdate;
        self.cur_tdate = 0;
        self.cache.roll_session();
        Ok(())
    }

    /// Union of this day's bar stamps across every minute-period
    /// subscription, in ascending order.
    fn day_bar_stamps(&mut self, tdate: u32) -> BTreeSet<u64> {
        let mut stamps = BTreeSet::new();
        let subs: Vec<BarSub> = self.bar_subs.values().cloned().collect();
        for sub in subs {
            let Some(session) = self.meta.session_of(&sub.code).cloned() else {
                continue;
            };
            let now = encode_bar_time(tdate, 2359);
            if let Err(err) = self.cache.ensure_bars(
                self.reader.as_ref(),
                &session,
                &sub.code,
                sub.period,
                sub.times,
                now,
            ) {
                error!(code = sub.code.as_str(), %err, "bar extension failed");
                continue;
            }
            let Some(entry) = self.cache.bars_entry(&sub.code, sub.period, sub.times) else {
                continue;
            };
            if sub.period.is_day() {
                continue;
            }
            for bar in entry.bars.iter() {
                if bar.date == tdate {
                    stamps.insert(bar.stamp());
                }
            }
        }
        stamps
    }

    fn peek_next_hf_event(&self, tick_codes: &[SmolStr]) -> Option<(u64, HfStream, SmolStr)> {
        let mut best: Option<(u64, HfStream, SmolStr)> = None;

        let mut consider = |stamp: u64, kind: HfStream, code: &SmolStr| {
            if best.as_ref().map(|(s, _, _)| stamp < *s).unwrap_or(true) {
                best = Some((stamp, kind, code.clone()));
            }
        };

        for code in tick_codes {
            if let Some(item) = self.cache.ticks_entry(code).and_then(|e| e.peek()) {
                consider(item.stamp(), HfStream::Tick, code);
            }
        }
        for code in &self.ordque_subs {
            if let Some(entry) = self.cache.order_queues_entry(code)
                && let Some(item) = entry.peek()
            {
                consider(item.stamp(), HfStream::OrderQueue, code);
            }
        }
        for code in &self.orddtl_subs {
            if let Some(entry) = self.cache.order_details_entry(code)
                && let Some(item) = entry.peek()
            {
                consider(item.stamp(), HfStream::OrderDetail, code);
            }
        }
        for code in &self.trans_subs {
            if let Some(entry) = self.cache.transactions_entry(code)
                && let Some(item) = entry.peek()
            {
                consider(item.stamp(), HfStream::Transaction, code);
            }
        }
        best
    }

    fn end_stamp_for(&self, period: Period) -> u64 {
        if period.is_day() {
            self.end_time / 10_000
        } else {
            encode_bar_time((self.end_time / 10_000) as u32, (self.end_time % 10_000) as u32)
        }
    }

    fn notify_progress(&mut self, fraction: f64) {
        self.steps += 1;
        if self.steps % self.progress_every as u64 != 0 {
            return;
        }
        let Some(callback) = self.progress_cb.as_mut() else {
            return;
        };
        let progress = Progress {
            t_cur: self.cur_date as u64 * 10_000 + self.cur_time as u64,
            t_end: self.end_time,
            progress: fraction.clamp(0.0, 1.0),
            elapsed_ms: self.started_at.map(|t| t.elapsed().as_millis()).unwrap_or(0),
        };
        callback(&progress);
    }
}

/// Which high-frequency stream the next merged event comes from. Variant
/// order is the tie-break order at one timestamp.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
enum HfStream {
    Tick,
    OrderQueue,
    OrderDetail,
    Transaction,
}
