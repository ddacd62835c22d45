use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::TapesimError;

/// Which strategy context the run drives.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MockerKind {
    Cta,
    Sel,
    Hft,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvConfig {
    pub mocker: MockerKind,
    #[serde(default)]
    pub slippage: i32,
    #[serde(default)]
    pub slippage_ratio: bool,
    /// Output directory of a prior run whose `datas.json` seeds this one.
    #[serde(default)]
    pub incremental_backtest_base: Option<String>,
    /// Background workers for risk recalculation; 0 (the default) keeps
    /// the run single-threaded and bit-reproducible.
    #[serde(default)]
    pub pool_size: usize,
    /// Assumed cancellation fraction ahead of our orders (HFT matching).
    #[serde(default)]
    pub cancel_rate: f64,
    /// Main-contract auto-clear on rollover dates.
    #[serde(default)]
    pub auto_clear: bool,
    #[serde(default)]
    pub clear_includes: Vec<String>,
    #[serde(default)]
    pub clear_excludes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BaseFiles {
    pub session: String,
    pub commodity: String,
    pub contract: String,
    pub holiday: String,
    #[serde(default)]
    pub hot: Option<String>,
}

fn default_cache_clear_days() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayerConfig {
    #[serde(default)]
    pub mode: String,
    /// `YYYYMMDDHHMM`
    pub begin_time: u64,
    pub end_time: u64,
    #[serde(default)]
    pub align_by_section: bool,
    #[serde(default)]
    pub tick_enabled: bool,
    #[serde(default)]
    pub nosim_if_notrade: bool,
    #[serde(default)]
    pub adjust_flag: u32,
    #[serde(default = "default_cache_clear_days")]
    pub cache_clear_days: u32,
    pub basefiles: BaseFiles,
    #[serde(default)]
    pub fees: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    /// Day selector, meaning depends on `period` (0 for daily, 0-6 for
    /// weekly, 1-31 for monthly, MMDD for yearly).
    #[serde(default)]
    pub date: u32,
    /// `HHMM` fire time.
    pub time: u32,
    pub period: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategySection {
    /// Factory module name resolved through the strategy registry.
    pub module: String,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub task: Option<TaskConfig>,
}

/// Top-level backtest configuration, loaded from JSON.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BacktestConfig {
    pub env: EnvConfig,
    pub replayer: ReplayerConfig,
    #[serde(default)]
    pub cta: Option<StrategySection>,
    #[serde(default)]
    pub sel: Option<StrategySection>,
    #[serde(default)]
    pub hft: Option<StrategySection>,
}

impl BacktestConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TapesimError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| TapesimError::Config(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|err| TapesimError::Config(format!("{}: {err}", path.display())))
    }

    /// Section matching `env.mocker`; a missing section is a config error.
    pub fn strategy_section(&self) -> Result<&StrategySection, TapesimError> {
        let section = match self.env.mocker {
            MockerKind::Cta => self.cta.as_ref(),
            MockerKind::Sel => self.sel.as_ref(),
            MockerKind::Hft => self.hft.as_ref(),
        };
        section.ok_or_else(|| {
            TapesimError::Config(format!("missing section for mocker {:?}", self.env.mocker))
        })
    }
}
