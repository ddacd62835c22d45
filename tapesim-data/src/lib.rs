//! Historical market data for the tapesim replay engine: record types,
//! zero-copy slice views, the pluggable reader interface, and the
//! per-instrument replay caches with resampling and adjustment.

pub mod cache;
pub mod error;
pub mod model;
pub mod reader;
pub mod resample;
pub mod slice;

pub use cache::{BarCacheEntry, CURSOR_UNSET, HfCacheEntry, ReplayCache};
pub use error::DataError;
pub use model::{Bar, OrderDetailItem, OrderQueueItem, Period, Tick, TransactionItem};
pub use reader::{HistoryReader, MemoryReader};
pub use slice::{BarSlice, OrderDetailSlice, OrderQueueSlice, Slice, TickSlice, TransactionSlice};
