//! Record types produced by data readers and replayed by the engine.

pub mod bar;
pub mod l2;
pub mod tick;
pub mod time;

pub use bar::{Bar, Period};
pub use l2::{OrderDetailItem, OrderQueueItem, TransactionItem};
pub use tick::Tick;
