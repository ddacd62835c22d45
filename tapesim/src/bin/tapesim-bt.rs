//! Backtest runner: loads a JSON config, pulls bar CSVs into the
//! in-memory reader, and drives the configured strategy context.
//!
//! Strategy factories are registered by embedders linking against
//! `tapesim`; with none registered the runner exits non-zero on the
//! unknown-module config error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tapesim::{BacktestConfig, StrategyRegistry, TapesimError, runner};
use tapesim_data::{Bar, MemoryReader, Period};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "tapesim-bt", about = "Historical replay backtester")]
struct Args {
    /// Backtest configuration file.
    #[arg(short = 'c', long = "config", default_value = "./configbt.json")]
    config: PathBuf,

    /// Logging configuration; `json` switches to JSON log output.
    #[arg(short = 'l', long = "logcfg", default_value = "")]
    logcfg: String,

    /// Directory holding `<code>_<period>.csv` bar files.
    #[arg(short = 'd', long = "data", default_value = "./data")]
    data: PathBuf,

    /// Output directory for the run's CSVs and state snapshot.
    #[arg(short = 'o', long = "outdir", default_value = "./outputs_bt")]
    outdir: PathBuf,
}

fn load_reader(dir: &PathBuf) -> Result<MemoryReader, TapesimError> {
    let mut reader = MemoryReader::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(reader);
    };

    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();

    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if path.extension().and_then(|s| s.to_str()) != Some("csv") {
            continue;
        }
        let Some((code, kind)) = stem.rsplit_once('_') else {
            continue;
        };

        let Some(period) = Period::parse(kind) else {
            continue;
        };

        let mut csv = csv::Reader::from_path(&path)
            .map_err(|err| TapesimError::Config(format!("{}: {err}", path.display())))?;
        let bars: Result<Vec<Bar>, _> = csv.deserialize().collect();
        let bars =
            bars.map_err(|err| TapesimError::Config(format!("{}: {err}", path.display())))?;
        info!(code, %period, count = bars.len(), "bar data loaded");
        reader.add_bars(code, period, bars);
    }

    Ok(reader)
}

fn run(args: &Args) -> Result<(), TapesimError> {
    let config = BacktestConfig::load(&args.config)?;
    let reader = load_reader(&args.data)?;
    let registry = StrategyRegistry::new();
    runner::run_backtest(&config, &registry, Box::new(reader), &args.outdir)
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.logcfg.contains("json") {
        tapesim::logging::init_json_logging();
    } else {
        tapesim::logging::init_logging();
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "backtest failed");
            ExitCode::FAILURE
        }
    }
}
