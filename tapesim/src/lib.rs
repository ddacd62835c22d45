//! Deterministic historical-data replay and strategy simulation.
//!
//! tapesim merges heterogeneous historical market data (bars, ticks,
//! order-book events) on a virtual clock, drives CTA/SEL/HFT strategy
//! contexts through deterministic callbacks, simulates order matching
//! with a queue-position model, and keeps FIFO position/P&L accounting
//! with instrument-aware fees, slippage and main-contract rollover.
//!
//! Given identical inputs, two replays emit byte-identical trade and
//! close logs.

pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod output;
pub mod pool;
pub mod portfolio;
pub mod replayer;
pub mod runner;
pub mod strategy;

pub use config::{BacktestConfig, MockerKind};
pub use context::{CtaMocker, HftMocker, SelMocker};
pub use error::TapesimError;
pub use output::{OutputLogs, StateSnapshot};
pub use portfolio::{AccountState, DetailInfo, FundInfo, PosInfo, Slippage};
pub use replayer::{DataSink, Progress, ReplayMode, Replayer, ReplayerOptions, StopHandle};
pub use strategy::{CtaStrategy, HftStrategy, SelStrategy, StrategyFactory, StrategyRegistry};
