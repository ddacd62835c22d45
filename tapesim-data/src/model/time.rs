//! Integer time encodings shared across records and the virtual clock.
//!
//! Intraday bars carry `(date - 19900000) * 10000 + HHMM`; daily bars carry
//! the plain `YYYYMMDD`. Tick action times are `HHMMSSmmm`.

const BAR_DATE_BASE: u64 = 19_900_000;

/// Encode a minute-aligned intraday bar timestamp.
pub fn encode_bar_time(date: u32, hhmm: u32) -> u64 {
    (date as u64 - BAR_DATE_BASE) * 10_000 + hhmm as u64
}

/// Calendar date (YYYYMMDD) of an intraday bar timestamp.
pub fn bar_date(bar_time: u64) -> u32 {
    (bar_time / 10_000 + BAR_DATE_BASE) as u32
}

/// Minute label (HHMM) of an intraday bar timestamp.
pub fn bar_minute(bar_time: u64) -> u32 {
    (bar_time % 10_000) as u32
}

/// Full-precision tick timestamp: `YYYYMMDD * 1e9 + HHMMSSmmm`.
pub fn tick_stamp(action_date: u32, action_time: u32) -> u64 {
    action_date as u64 * 1_000_000_000 + action_time as u64
}

/// Minute label (HHMM) of a `HHMMSSmmm` action time.
pub fn action_minute(action_time: u32) -> u32 {
    action_time / 100_000
}

/// Seconds-with-millis remainder (`SSmmm`) of a `HHMMSSmmm` action time.
pub fn action_secs(action_time: u32) -> u32 {
    action_time % 100_000
}
