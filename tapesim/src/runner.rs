//! Assembles a backtest from configuration: metadata, replayer, the
//! strategy context matching `env.mocker`, and output flushing.

use std::path::Path;
use std::sync::Arc;

use smol_str::SmolStr;
use tapesim_data::reader::HistoryReader;
use tapesim_instrument::MetadataManager;
use tracing::info;

use crate::{
    config::{BacktestConfig, MockerKind, ReplayerConfig},
    context::{ClearPolicy, CtaMocker, HftMocker, SelMocker},
    error::TapesimError,
    output,
    portfolio::Slippage,
    replayer::{ReplayMode, Replayer, ReplayerOptions, TaskInfo},
    strategy::StrategyRegistry,
};

/// Load the metadata base files named by the replayer section.
pub fn load_metadata(config: &ReplayerConfig) -> Result<MetadataManager, TapesimError> {
    let mut meta = MetadataManager::default();
    meta.load_sessions(&config.basefiles.session)?;
    meta.load_commodities(&config.basefiles.commodity)?;
    meta.load_contracts(&config.basefiles.contract)?;
    meta.load_holidays(&config.basefiles.holiday)?;
    if !config.fees.is_empty() {
        meta.load_fees(&config.fees)?;
    }
    if let Some(hot) = &config.basefiles.hot {
        meta.load_hot_rules(hot)?;
    }
    Ok(meta)
}

fn replayer_options(config: &ReplayerConfig) -> ReplayerOptions {
    ReplayerOptions {
        begin_time: config.begin_time,
        end_time: config.end_time,
        align_by_section: config.align_by_section,
        tick_enabled: config.tick_enabled,
        nosim_if_notrade: config.nosim_if_notrade,
        cache_clear_days: config.cache_clear_days,
        ..ReplayerOptions::default()
    }
}

fn clear_policy(config: &BacktestConfig) -> ClearPolicy {
    ClearPolicy {
        active: config.env.auto_clear,
        includes: config.env.clear_includes.iter().map(SmolStr::new).collect(),
        excludes: config.env.clear_excludes.iter().map(SmolStr::new).collect(),
    }
}

/// Run one backtest to completion and flush its outputs under
/// `out_dir/<strategy id>/`.
pub fn run_backtest(
    config: &BacktestConfig,
    registry: &StrategyRegistry,
    reader: Box<dyn HistoryReader>,
    out_dir: &Path,
) -> Result<(), TapesimError> {
    let meta = Arc::new(load_metadata(&config.replayer)?);
    let mut rep = Replayer::new(reader, meta, replayer_options(&config.replayer));

    let section = config.strategy_section()?;
    let factory = registry.factory(&section.module).ok_or_else(|| {
        TapesimError::Config(format!("unknown strategy module: {}", section.module))
    })?;
    let strategy_cfg = &section.strategy;
    let slippage = Slippage {
        ticks: config.env.slippage,
        is_ratio: config.env.slippage_ratio,
    };

    let seed = config
        .env
        .incremental_backtest_base
        .as_deref()
        .map(output::load_snapshot)
        .transpose()?;

    info!(
        mocker = ?config.env.mocker,
        module = section.module,
        strategy = strategy_cfg.name,
        id = strategy_cfg.id,
        "backtest assembled"
    );

    match config.env.mocker {
        MockerKind::Cta => {
            let strategy = factory
                .create_cta(&strategy_cfg.name, &strategy_cfg.id, &strategy_cfg.params)
                .ok_or_else(|| {
                    TapesimError::Config(format!("no CTA strategy named {}", strategy_cfg.name))
                })?;
            let mut mocker = CtaMocker::new(&strategy_cfg.id, strategy, slippage);
            mocker.core_mut().clear_policy = clear_policy(config);
            mocker.core_mut().set_pool_size(config.env.pool_size);
            if let Some(seed) = &seed {
                mocker.core_mut().seed_from(seed);
            }
            mocker.bind(&rep);
            rep.set_mode(ReplayMode::Bar);
            rep.run(&mut mocker)?;
            mocker.finish(out_dir)
        }
        MockerKind::Sel => {
            let strategy = factory
                .create_sel(&strategy_cfg.name, &strategy_cfg.id, &strategy_cfg.params)
                .ok_or_else(|| {
                    TapesimError::Config(format!("no SEL strategy named {}", strategy_cfg.name))
                })?;
            let mut mocker = SelMocker::new(&strategy_cfg.id, strategy, slippage);
            mocker.core_mut().clear_policy = clear_policy(config);
            mocker.core_mut().set_pool_size(config.env.pool_size);
            if let Some(seed) = &seed {
                mocker.core_mut().seed_from(seed);
            }
            mocker.bind(&rep);
            match &section.task {
                Some(task) => rep.register_task(TaskInfo::from_config(task)),
                None => rep.set_mode(ReplayMode::Bar),
            }
            rep.run(&mut mocker)?;
            mocker.finish(out_dir)
        }
        MockerKind::Hft => {
            let strategy = factory
                .create_hft(&strategy_cfg.name, &strategy_cfg.id, &strategy_cfg.params)
                .ok_or_else(|| {
                    TapesimError::Config(format!("no HFT strategy named {}", strategy_cfg.name))
                })?;
            let mut mocker = HftMocker::new(&strategy_cfg.id, strategy, config.env.cancel_rate);
            mocker.core_mut().set_pool_size(config.env.pool_size);
            if let Some(seed) = &seed {
                mocker.core_mut().seed_from(seed);
            }
            mocker.bind(&rep);
            rep.set_mode(ReplayMode::Tick);
            rep.run(&mut mocker)?;
            mocker.finish(out_dir)
        }
    }
}
