use fnv::FnvHashMap;
use smol_str::SmolStr;
use std::sync::Arc;

use crate::{
    error::DataError,
    model::{Bar, OrderDetailItem, OrderQueueItem, Period, Tick, TransactionItem},
    slice::{BarSlice, OrderDetailSlice, OrderQueueSlice, Slice, TickSlice, TransactionSlice},
};

/// Adjust traded volume by the split factor.
pub const ADJUST_VOLUME: u32 = 1;
/// Adjust turnover by the split factor.
pub const ADJUST_TURNOVER: u32 = 2;
/// Adjust open interest by the split factor.
pub const ADJUST_OPEN_INTEREST: u32 = 4;

/// Pluggable historical-data source.
///
/// Guarantees required of implementations: returned records are in strictly
/// ascending timestamp order with stable tie order; a range query with
/// `t_to = 0` means "latest available"; missing data returns an empty
/// slice, never an error. [`DataError::ReaderUnavailable`] is reserved for
/// I/O corruption.
pub trait HistoryReader {
    fn read_bars_by_range(
        &self,
        code: &str,
        period: Period,
        t_from: u64,
        t_to: u64,
    ) -> Result<BarSlice, DataError>;

    fn read_bars_by_count(
        &self,
        code: &str,
        period: Period,
        count: usize,
        t_end: u64,
    ) -> Result<BarSlice, DataError>;

    fn read_bars_by_date(&self, code: &str, period: Period, date: u32)
    -> Result<BarSlice, DataError>;

    fn read_ticks_by_date(&self, code: &str, date: u32) -> Result<TickSlice, DataError>;

    fn read_ticks_by_count(
        &self,
        code: &str,
        count: usize,
        t_end: u64,
    ) -> Result<TickSlice, DataError>;

    fn read_order_queue_by_date(
        &self,
        code: &str,
        date: u32,
    ) -> Result<OrderQueueSlice, DataError>;

    fn read_order_detail_by_date(
        &self,
        code: &str,
        date: u32,
    ) -> Result<OrderDetailSlice, DataError>;

    fn read_transactions_by_date(
        &self,
        code: &str,
        date: u32,
    ) -> Result<TransactionSlice, DataError>;

    /// Split/dividend factor in force on `date`; 1.0 when none applies.
    fn adj_factor_by_date(&self, _code: &str, _date: u32) -> f64 {
        1.0
    }

    /// Bitmask of [`ADJUST_VOLUME`] | [`ADJUST_TURNOVER`] |
    /// [`ADJUST_OPEN_INTEREST`] controlling which non-price fields the
    /// cache adjusts alongside prices.
    fn adjusting_flags(&self) -> u32 {
        0
    }
}

/// In-memory [`HistoryReader`], the reference implementation used by tests
/// and embedded runs. Buffers are shared out as slices without copying.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    bars: FnvHashMap<(SmolStr, Period), Arc<Vec<Bar>>>,
    ticks: FnvHashMap<SmolStr, Arc<Vec<Tick>>>,
    order_queues: FnvHashMap<SmolStr, Arc<Vec<OrderQueueItem>>>,
    order_details: FnvHashMap<SmolStr, Arc<Vec<OrderDetailItem>>>,
    transactions: FnvHashMap<SmolStr, Arc<Vec<TransactionItem>>>,
    adj_factors: FnvHashMap<SmolStr, Vec<(u32, f64)>>,
    adjusting_flags: u32,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adjusting_flags(mut self, flags: u32) -> Self {
        self.adjusting_flags = flags;
        self
    }

    pub fn add_bars(&mut self, code: impl Into<SmolStr>, period: Period, mut bars: Vec<Bar>) {
        bars.sort_by_key(Bar::stamp);
        self.bars.insert((code.into(), period), Arc::new(bars));
    }

    pub fn add_ticks(&mut self, code: impl Into<SmolStr>, mut ticks: Vec<Tick>) {
        ticks.sort_by_key(Tick::stamp);
        self.ticks.insert(code.into(), Arc::new(ticks));
    }

    pub fn add_order_queues(&mut self, code: impl Into<SmolStr>, mut items: Vec<OrderQueueItem>) {
        items.sort_by_key(OrderQueueItem::stamp);
        self.order_queues.insert(code.into(), Arc::new(items));
    }

    pub fn add_order_details(&mut self, code: impl Into<SmolStr>, mut items: Vec<OrderDetailItem>) {
        items.sort_by_key(OrderDetailItem::stamp);
        self.order_details.insert(code.into(), Arc::new(items));
    }

    pub fn add_transactions(&mut self, code: impl Into<SmolStr>, mut items: Vec<TransactionItem>) {
        items.sort_by_key(TransactionItem::stamp);
        self.transactions.insert(code.into(), Arc::new(items));
    }

    /// Register split factors as `(effective_date, factor)` pairs.
    pub fn add_adj_factors(&mut self, code: impl Into<SmolStr>, mut factors: Vec<(u32, f64)>) {
        factors.sort_by_key(|(date, _)| *date);
        self.adj_factors.insert(code.into(), factors);
    }

    fn slice_by_stamp<T: Clone>(
        data: Option<&Arc<Vec<T>>>,
        stamp: impl Fn(&T) -> u64,
        t_from: u64,
        t_to: u64,
    ) -> Slice<T> {
        let Some(data) = data else {
            return Slice::empty();
        };
        let start = data.partition_point(|item| stamp(item) < t_from);
        let end = if t_to == 0 {
            data.len()
        } else {
            data.partition_point(|item| stamp(item) <= t_to)
        };
        Slice::from_range(Arc::clone(data), start..end)
    }

    fn slice_by_count<T: Clone>(
        data: Option<&Arc<Vec<T>>>,
        stamp: impl Fn(&T) -> u64,
        count: usize,
        t_end: u64,
    ) -> Slice<T> {
        let Some(data) = data else {
            return Slice::empty();
        };
        let end = if t_end == 0 {
            data.len()
        } else {
            data.partition_point(|item| stamp(item) <= t_end)
        };
        Slice::from_range(Arc::clone(data), end.saturating_sub(count)..end)
    }

    fn slice_by_date<T: Clone>(
        data: Option<&Arc<Vec<T>>>,
        date_of: impl Fn(&T) -> u32,
        date: u32,
    ) -> Slice<T> {
        let Some(data) = data else {
            return Slice::empty();
        };
        let start = data.partition_point(|item| date_of(item) < date);
        let end = data.partition_point(|item| date_of(item) <= date);
        Slice::from_range(Arc::clone(data), start..end)
    }
}

impl HistoryReader for MemoryReader {
    fn read_bars_by_range(
        &self,
        code: &str,
        period: Period,
        t_from: u64,
        t_to: u64,
    ) -> Result<BarSlice, DataError> {
        Ok(Self::slice_by_stamp(
            self.bars.get(&(SmolStr::new(code), period)),
            Bar::stamp,
            t_from,
            t_to,
        ))
    }

    fn read_bars_by_count(
        &self,
        code: &str,
        period: Period,
        count: usize,
        t_end: u64,
    ) -> Result<BarSlice, DataError> {
        Ok(Self::slice_by_count(
            self.bars.get(&(SmolStr::new(code), period)),
            Bar::stamp,
            count,
            t_end,
        ))
    }

    fn read_bars_by_date(
        &self,
        code: &str,
        period: Period,
        date: u32,
    ) -> Result<BarSlice, DataError> {
        Ok(Self::slice_by_date(
            self.bars.get(&(SmolStr::new(code), period)),
            |bar| bar.date,
            date,
        ))
    }

    fn read_ticks_by_date(&self, code: &str, date: u32) -> Result<TickSlice, DataError> {
        Ok(Self::slice_by_date(
            self.ticks.get(code),
            |tick| tick.trading_date,
            date,
        ))
    }

    fn read_ticks_by_count(
        &self,
        code: &str,
        count: usize,
        t_end: u64,
    ) -> Result<TickSlice, DataError> {
        Ok(Self::slice_by_count(self.ticks.get(code), Tick::stamp, count, t_end))
    }

    fn read_order_queue_by_date(
        &self,
        code: &str,
        date: u32,
    ) -> Result<OrderQueueSlice, DataError> {
        Ok(Self::slice_by_date(
            self.order_queues.get(code),
            |item| item.trading_date,
            date,
        ))
    }

    fn read_order_detail_by_date(
        &self,
        code: &str,
        date: u32,
    ) -> Result<OrderDetailSlice, DataError> {
        Ok(Self::slice_by_date(
            self.order_details.get(code),
            |item| item.trading_date,
            date,
        ))
    }

    fn read_transactions_by_date(
        &self,
        code: &str,
        date: u32,
    ) -> Result<TransactionSlice, DataError> {
        Ok(Self::slice_by_date(
            self.transactions.get(code),
            |item| item.trading_date,
            date,
        ))
    }

    fn adj_factor_by_date(&self, code: &str, date: u32) -> f64 {
        let Some(factors) = self.adj_factors.get(code) else {
            return 1.0;
        };
        let idx = factors.partition_point(|(d, _)| *d <= date);
        if idx == 0 { 1.0 } else { factors[idx - 1].1 }
    }

    fn adjusting_flags(&self) -> u32 {
        self.adjusting_flags
    }
}
