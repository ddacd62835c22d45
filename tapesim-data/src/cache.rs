use fnv::FnvHashMap;
use smol_str::SmolStr;
use std::sync::Arc;
use tapesim_instrument::{contract::{AdjustMode, CodeRef}, session::SessionSpec};
use tracing::debug;

use crate::{
    error::DataError,
    model::{Bar, OrderDetailItem, OrderQueueItem, Period, Tick, TransactionItem},
    reader::{ADJUST_OPEN_INTEREST, ADJUST_TURNOVER, ADJUST_VOLUME, HistoryReader},
    resample::resample_bars,
    slice::{BarSlice, Slice},
};

/// Sentinel for a cursor that has not replayed anything yet. Once
/// initialised a cursor is strictly positive and advances monotonically.
pub const CURSOR_UNSET: u32 = u32::MAX;

/// Cached bar series for one `(code, period, times)` key.
#[derive(Debug, Clone)]
pub struct BarCacheEntry {
    pub code: SmolStr,
    pub period: Period,
    pub times: u32,
    pub cursor: u32,
    pub bars: Arc<Vec<Bar>>,
    /// Last adjustment factor applied to the series.
    pub factor: f64,
    untouched_days: u32,
}

impl BarCacheEntry {
    pub fn count(&self) -> usize {
        self.bars.len()
    }

    pub fn mark(&mut self) {
        self.untouched_days = 0;
    }

    /// Bars already closed at the current cursor, at most `count` of them.
    pub fn closed_slice(&self, count: usize) -> BarSlice {
        if self.cursor == CURSOR_UNSET {
            return BarSlice::empty();
        }
        let end = (self.cursor as usize).min(self.bars.len());
        Slice::from_range(Arc::clone(&self.bars), end.saturating_sub(count)..end)
    }

    /// Advance the cursor to cover every bar stamped at or before `stamp`,
    /// returning the range of newly closed bar indices.
    pub fn advance_to(&mut self, stamp: u64) -> std::ops::Range<usize> {
        let from = if self.cursor == CURSOR_UNSET { 0 } else { self.cursor as usize };
        let to = self.bars.partition_point(|bar| bar.stamp() <= stamp);
        if to > from {
            self.cursor = to as u32;
        }
        from..to.max(from)
    }

    pub fn last_bar_time(&self) -> u64 {
        self.bars.last().map(Bar::stamp).unwrap_or(0)
    }
}

/// Cached one-day high-frequency series (ticks or L2 events) for a code.
#[derive(Debug, Clone)]
pub struct HfCacheEntry<T> {
    pub code: SmolStr,
    pub date: u32,
    pub cursor: usize,
    pub items: Arc<Vec<T>>,
}

impl<T> HfCacheEntry<T> {
    pub fn remaining(&self) -> usize {
        self.items.len().saturating_sub(self.cursor)
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.get(self.cursor)
    }

    pub fn advance(&mut self) -> Option<&T> {
        let item = self.items.get(self.cursor)?;
        self.cursor += 1;
        Some(item)
    }
}

fn adjust_bars(bars: &mut [Bar], reader: &dyn HistoryReader, code: &str, flags: u32) -> f64 {
    let mut last_factor = 1.0;
    for bar in bars.iter_mut() {
        let factor = reader.adj_factor_by_date(code, bar.date);
        if factor == 1.0 {
            continue;
        }
        bar.open *= factor;
        bar.high *= factor;
        bar.low *= factor;
        bar.close *= factor;
        if flags & ADJUST_VOLUME != 0 {
            bar.volume /= factor;
        }
        if flags & ADJUST_TURNOVER != 0 {
            bar.turnover *= factor;
        }
        if flags & ADJUST_OPEN_INTEREST != 0 {
            bar.open_interest /= factor;
            bar.add_interest /= factor;
        }
        last_factor = factor;
    }
    last_factor
}

/// Per-instrument lazy caches over a [`HistoryReader`].
///
/// Bar caches are keyed `(code, period, times)` and resample on first load;
/// later accesses extend incrementally past the last cached bar time.
/// High-frequency caches hold one trading day per code. Entries untouched
/// for `cache_clear_days` sessions are freed.
#[derive(Debug, Default)]
pub struct ReplayCache {
    align_by_section: bool,
    cache_clear_days: u32,
    bars: FnvHashMap<SmolStr, BarCacheEntry>,
    ticks: FnvHashMap<SmolStr, HfCacheEntry<Tick>>,
    order_queues: FnvHashMap<SmolStr, HfCacheEntry<OrderQueueItem>>,
    order_details: FnvHashMap<SmolStr, HfCacheEntry<OrderDetailItem>>,
    transactions: FnvHashMap<SmolStr, HfCacheEntry<TransactionItem>>,
}

pub fn bar_key(code: &str, period: Period, times: u32) -> SmolStr {
    SmolStr::new(format!("{code}#{period}#{times}"))
}

impl ReplayCache {
    pub fn new(align_by_section: bool, cache_clear_days: u32) -> Self {
        Self {
            align_by_section,
            cache_clear_days,
            ..Self::default()
        }
    }

    /// Load or extend the bar cache for `(code, period, times)`.
    ///
    /// `now_stamp` is the virtual wall-clock in bar-time encoding; the last
    /// cached bar is withheld on first load unless the clock is strictly
    /// past its theoretical close, so an unfinished bar is never replayed
    /// as closed.
    pub fn ensure_bars(
        &mut self,
        reader: &dyn HistoryReader,
        session: &SessionSpec,
        code: &str,
        period: Period,
        times: u32,
        now_stamp: u64,
    ) -> Result<&mut BarCacheEntry, DataError> {
        let key = bar_key(code, period, times);

        if !self.bars.contains_key(&key) {
            let entry = self.load_bars(reader, session, code, period, times, now_stamp)?;
            self.bars.insert(key.clone(), entry);
        } else {
            self.extend_bars(reader, session, &key, code, period, times)?;
        }

        let entry = self.bars.get_mut(&key).expect("entry just ensured");
        entry.mark();
        Ok(entry)
    }

    fn load_bars(
        &self,
        reader: &dyn HistoryReader,
        session: &SessionSpec,
        code: &str,
        period: Period,
        times: u32,
        now_stamp: u64,
    ) -> Result<BarCacheEntry, DataError> {
        let code_ref = CodeRef::parse(code);
        let read_code = code_ref
            .as_ref()
            .map(|c| c.plain_code())
            .unwrap_or_else(|| SmolStr::new(code));

        let raw = reader.read_bars_by_range(read_code.as_str(), period, 0, 0)?;
        let mut base = raw.to_vec();

        let mut factor = 1.0;
        if matches!(code_ref.as_ref().map(|c| c.adjust), Some(AdjustMode::Backward)) {
            factor = adjust_bars(&mut base, reader, read_code.as_str(), reader.adjusting_flags());
        }

        let mut bars = resample_bars(&base, period, times, session, self.align_by_section);

        // Withhold an unfinished trailing bar.
        if let Some(last) = bars.last()
            && now_stamp <= last.stamp()
        {
            bars.pop();
        }

        debug!(code, %period, times, count = bars.len(), "bar cache loaded");

        Ok(BarCacheEntry {
            code: SmolStr::new(code),
            period,
            times,
            cursor: CURSOR_UNSET,
            bars: Arc::new(bars),
            factor,
            untouched_days: 0,
        })
    }

    fn extend_bars(
        &mut self,
        reader: &dyn HistoryReader,
        session: &SessionSpec,
        key: &SmolStr,
        code: &str,
        period: Period,
        times: u32,
    ) -> Result<(), DataError> {
        let Some(entry) = self.bars.get_mut(key) else {
            return Ok(());
        };
        let last_bartime = entry.last_bar_time();

        let code_ref = CodeRef::parse(code);
        let read_code = code_ref
            .as_ref()
            .map(|c| c.plain_code())
            .unwrap_or_else(|| SmolStr::new(code));

        let fresh = reader.read_bars_by_range(read_code.as_str(), period, last_bartime + 1, 0)?;
        if fresh.is_empty() {
            return Ok(());
        }

        let mut base = fresh.to_vec();
        if matches!(code_ref.as_ref().map(|c| c.adjust), Some(AdjustMode::Backward)) {
            entry.factor =
                adjust_bars(&mut base, reader, read_code.as_str(), reader.adjusting_flags());
        }

        let appended = resample_bars(&base, period, times, session, self.align_by_section);
        let count = appended.len();
        Arc::make_mut(&mut entry.bars).extend(appended);
        debug!(code, %period, times, count, "bar cache extended");
        Ok(())
    }

    pub fn bars_entry(&self, code: &str, period: Period, times: u32) -> Option<&BarCacheEntry> {
        self.bars.get(&bar_key(code, period, times))
    }

    pub fn bars_entry_mut(
        &mut self,
        code: &str,
        period: Period,
        times: u32,
    ) -> Option<&mut BarCacheEntry> {
        self.bars.get_mut(&bar_key(code, period, times))
    }

    pub fn bar_entries_mut(&mut self) -> impl Iterator<Item = &mut BarCacheEntry> {
        self.bars.values_mut()
    }

    /// Load the tick cache for `(code, date)`, replacing any other day held
    /// for the code. Ticks with zero traded volume are dropped when
    /// `skip_no_trade` is set.
    pub fn ensure_ticks(
        &mut self,
        reader: &dyn HistoryReader,
        code: &str,
        date: u32,
        skip_no_trade: bool,
    ) -> Result<&mut HfCacheEntry<Tick>, DataError> {
        let needs_load = self
            .ticks
            .get(code)
            .map(|entry| entry.date != date)
            .unwrap_or(true);

        if needs_load {
            let slice = reader.read_ticks_by_date(code, date)?;
            let items: Vec<Tick> = if skip_no_trade {
                slice.iter().filter(|t| t.volume > 0.0).cloned().collect()
            } else {
                slice.to_vec()
            };
            debug!(code, date, count = items.len(), "tick cache loaded");
            self.ticks.insert(
                SmolStr::new(code),
                HfCacheEntry {
                    code: SmolStr::new(code),
                    date,
                    cursor: 0,
                    items: Arc::new(items),
                },
            );
        }

        Ok(self.ticks.get_mut(code).expect("entry just ensured"))
    }

    pub fn ticks_entry(&self, code: &str) -> Option<&HfCacheEntry<Tick>> {
        self.ticks.get(code)
    }

    pub fn ticks_entry_mut(&mut self, code: &str) -> Option<&mut HfCacheEntry<Tick>> {
        self.ticks.get_mut(code)
    }

    pub fn tick_entries_mut(&mut self) -> impl Iterator<Item = &mut HfCacheEntry<Tick>> {
        self.ticks.values_mut()
    }

    pub fn ensure_order_queues(
        &mut self,
        reader: &dyn HistoryReader,
        code: &str,
        date: u32,
    ) -> Result<&mut HfCacheEntry<OrderQueueItem>, DataError> {
        let needs_load = self
            .order_queues
            .get(code)
            .map(|entry| entry.date != date)
            .unwrap_or(true);
        if needs_load {
            let slice = reader.read_order_queue_by_date(code, date)?;
            self.order_queues.insert(
                SmolStr::new(code),
                HfCacheEntry {
                    code: SmolStr::new(code),
                    date,
                    cursor: 0,
                    items: Arc::new(slice.to_vec()),
                },
            );
        }
        Ok(self.order_queues.get_mut(code).expect("entry just ensured"))
    }

    pub fn order_queue_entries_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut HfCacheEntry<OrderQueueItem>> {
        self.order_queues.values_mut()
    }

    pub fn order_queues_entry(&self, code: &str) -> Option<&HfCacheEntry<OrderQueueItem>> {
        self.order_queues.get(code)
    }

    pub fn order_queues_entry_mut(
        &mut self,
        code: &str,
    ) -> Option<&mut HfCacheEntry<OrderQueueItem>> {
        self.order_queues.get_mut(code)
    }

    pub fn ensure_order_details(
        &mut self,
        reader: &dyn HistoryReader,
        code: &str,
        date: u32,
    ) -> Result<&mut HfCacheEntry<OrderDetailItem>, DataError> {
        let needs_load = self
            .order_details
            .get(code)
            .map(|entry| entry.date != date)
            .unwrap_or(true);
        if needs_load {
            let slice = reader.read_order_detail_by_date(code, date)?;
            self.order_details.insert(
                SmolStr::new(code),
                HfCacheEntry {
                    code: SmolStr::new(code),
                    date,
                    cursor: 0,
                    items: Arc::new(slice.to_vec()),
                },
            );
        }
        Ok(self.order_details.get_mut(code).expect("entry just ensured"))
    }

    pub fn order_detail_entries_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut HfCacheEntry<OrderDetailItem>> {
        self.order_details.values_mut()
    }

    pub fn order_details_entry(&self, code: &str) -> Option<&HfCacheEntry<OrderDetailItem>> {
        self.order_details.get(code)
    }

    pub fn order_details_entry_mut(
        &mut self,
        code: &str,
    ) -> Option<&mut HfCacheEntry<OrderDetailItem>> {
        self.order_details.get_mut(code)
    }

    pub fn ensure_transactions(
        &mut self,
        reader: &dyn HistoryReader,
        code: &str,
        date: u32,
    ) -> Result<&mut HfCacheEntry<TransactionItem>, DataError> {
        let needs_load = self
            .transactions
            .get(code)
            .map(|entry| entry.date != date)
            .unwrap_or(true);
        if needs_load {
            let slice = reader.read_transactions_by_date(code, date)?;
            self.transactions.insert(
                SmolStr::new(code),
                HfCacheEntry {
                    code: SmolStr::new(code),
                    date,
                    cursor: 0,
                    items: Arc::new(slice.to_vec()),
                },
            );
        }
        Ok(self.transactions.get_mut(code).expect("entry just ensured"))
    }

    pub fn transaction_entries_mut(
        &mut self,
    ) -> impl Iterator<Item = &mut HfCacheEntry<TransactionItem>> {
        self.transactions.values_mut()
    }

    pub fn transactions_entry(&self, code: &str) -> Option<&HfCacheEntry<TransactionItem>> {
        self.transactions.get(code)
    }

    pub fn transactions_entry_mut(
        &mut self,
        code: &str,
    ) -> Option<&mut HfCacheEntry<TransactionItem>> {
        self.transactions.get_mut(code)
    }

    /// Session rollover housekeeping: age every bar cache and free those
    /// untouched for `cache_clear_days` sessions. Call after marking the
    /// day's active entries.
    pub fn roll_session(&mut self) {
        if self.cache_clear_days == 0 {
            return;
        }
        let limit = self.cache_clear_days;
        self.bars.retain(|key, entry| {
            entry.untouched_days += 1;
            let keep = entry.untouched_days <= limit;
            if !keep {
                debug!(%key, "bar cache evicted");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::time::encode_bar_time;
    use crate::reader::MemoryReader;
    use tapesim_instrument::session::TimeWindow;

    fn session() -> SessionSpec {
        SessionSpec {
            id: SmolStr::new("SD0930"),
            name: SmolStr::new("stock day"),
            offset: 0,
            auction: None,
            sections: vec![TimeWindow::new(930, 1130), TimeWindow::new(1300, 1500)],
        }
    }

    fn reader_with_minutes(code: &str, date: u32, labels: &[u32]) -> MemoryReader {
        let mut reader = MemoryReader::new();
        let bars = labels
            .iter()
            .enumerate()
            .map(|(i, &hhmm)| Bar {
                date,
                time: encode_bar_time(date, hhmm),
                open: 10.0 + i as f64,
                high: 11.0 + i as f64,
                low: 9.0 + i as f64,
                close: 10.5 + i as f64,
                volume: 1.0,
                ..Bar::default()
            })
            .collect();
        reader.add_bars(code, Period::Min1, bars);
        reader
    }

    #[test]
    fn test_unfinished_last_bar_withheld() {
        let reader = reader_with_minutes("SHFE.ag.2412", 20240105, &[931, 932, 933]);
        let mut cache = ReplayCache::new(true, 0);

        // Clock sits exactly on the last bar close: the bar is not done.
        let now = encode_bar_time(20240105, 933);
        let entry = cache
            .ensure_bars(&reader, &session(), "SHFE.ag.2412", Period::Min1, 1, now)
            .unwrap();
        assert_eq!(entry.count(), 2);
        assert_eq!(entry.cursor, CURSOR_UNSET);

        // Strictly past the close it stays.
        let mut cache = ReplayCache::new(true, 0);
        let now = encode_bar_time(20240105, 934);
        let entry = cache
            .ensure_bars(&reader, &session(), "SHFE.ag.2412", Period::Min1, 1, now)
            .unwrap();
        assert_eq!(entry.count(), 3);
    }

    #[test]
    fn test_cursor_advance() {
        let reader = reader_with_minutes("SHFE.ag.2412", 20240105, &[931, 932, 933, 934]);
        let mut cache = ReplayCache::new(true, 0);
        let now = encode_bar_time(20240105, 1500);
        let entry = cache
            .ensure_bars(&reader, &session(), "SHFE.ag.2412", Period::Min1, 1, now)
            .unwrap();

        let range = entry.advance_to(encode_bar_time(20240105, 932));
        assert_eq!(range, 0..2);
        let range = entry.advance_to(encode_bar_time(20240105, 932));
        assert!(range.is_empty());
        let range = entry.advance_to(encode_bar_time(20240105, 934));
        assert_eq!(range, 2..4);
        assert_eq!(entry.closed_slice(2).len(), 2);
    }

    #[test]
    fn test_incremental_extension() {
        let code = "SHFE.ag.2412";
        let date = 20240105;
        let mut reader = reader_with_minutes(code, date, &[931, 932]);
        let mut cache = ReplayCache::new(true, 0);

        let now = encode_bar_time(date, 933);
        let entry = cache
            .ensure_bars(&reader, &session(), code, Period::Min1, 1, now)
            .unwrap();
        assert_eq!(entry.count(), 2);

        // More data lands; re-ensuring extends past last_bartime only.
        reader = reader_with_minutes(code, date, &[931, 932, 933, 934]);
        let entry = cache
            .ensure_bars(&reader, &session(), code, Period::Min1, 1, now)
            .unwrap();
        assert_eq!(entry.count(), 4);
    }

    #[test]
    fn test_backward_adjustment() {
        let code = "SSE.STK.600000+H";
        let date = 20240105;
        let mut reader = reader_with_minutes("SSE.STK.600000", date, &[931, 932]);
        reader.add_adj_factors("SSE.STK.600000", vec![(20230101, 2.0)]);
        let reader = reader.with_adjusting_flags(ADJUST_VOLUME);

        let mut cache = ReplayCache::new(true, 0);
        let now = encode_bar_time(date, 1500);
        let entry = cache
            .ensure_bars(&reader, &session(), code, Period::Min1, 1, now)
            .unwrap();

        assert_eq!(entry.factor, 2.0);
        let first = entry.bars.first().unwrap();
        assert_eq!(first.close, 21.0);
        assert_eq!(first.volume, 0.5);
    }

    #[test]
    fn test_eviction_after_untouched_days() {
        let reader = reader_with_minutes("SHFE.ag.2412", 20240105, &[931, 932]);
        let mut cache = ReplayCache::new(true, 2);
        let now = encode_bar_time(20240105, 1500);
        cache
            .ensure_bars(&reader, &session(), "SHFE.ag.2412", Period::Min1, 1, now)
            .unwrap();

        cache.roll_session();
        cache.roll_session();
        assert!(cache.bars_entry("SHFE.ag.2412", Period::Min1, 1).is_some());
        cache.roll_session();
        assert!(cache.bars_entry("SHFE.ag.2412", Period::Min1, 1).is_none());
    }
}
