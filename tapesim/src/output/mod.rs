//! Normative run outputs: the five CSV files, the `datas.json` state
//! snapshot used for incremental resume, and the per-strategy user-data
//! file.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::Path;
use tracing::info;

use crate::{
    error::TapesimError,
    portfolio::{AccountState, FundInfo, PosInfo},
};

pub mod records;

pub use records::OutputLogs;

/// Risk-monitor state carried in `datas.json`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct RiskSnapshot {
    pub date: u32,
    pub dynamic_balance: f64,
    pub peak_balance: f64,
    pub drawdown: f64,
}

impl RiskSnapshot {
    /// Recompute from the fund state. Pure; safe to run off-thread.
    pub fn recalc(fund: &FundInfo, date: u32) -> Self {
        let dynamic_balance = fund.dynamic_balance();
        let peak_balance = if fund.max_md == f64::MIN {
            dynamic_balance
        } else {
            fund.max_md.max(dynamic_balance)
        };
        Self {
            date,
            dynamic_balance,
            peak_balance,
            drawdown: peak_balance - dynamic_balance,
        }
    }
}

/// One instrument's position in the snapshot.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PositionSnapshot {
    pub code: SmolStr,
    #[serde(flatten)]
    pub position: PosInfo,
}

/// Full `datas.json` payload.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct StateSnapshot {
    pub fund: FundInfo,
    pub positions: Vec<PositionSnapshot>,
    pub riskmon: RiskSnapshot,
}

impl StateSnapshot {
    pub fn capture(account: &AccountState, riskmon: RiskSnapshot) -> Self {
        Self {
            fund: account.fund.clone(),
            positions: account
                .positions
                .iter()
                .map(|(code, position)| PositionSnapshot {
                    code: code.clone(),
                    position: position.clone(),
                })
                .collect(),
            riskmon,
        }
    }

    /// Seed an account from a prior run's end state.
    pub fn restore(&self) -> AccountState {
        let mut account = AccountState {
            fund: self.fund.clone(),
            ..AccountState::default()
        };
        for snapshot in &self.positions {
            account
                .positions
                .insert(snapshot.code.clone(), snapshot.position.clone());
        }
        account
    }
}

fn output_err(err: impl std::fmt::Display) -> TapesimError {
    TapesimError::Output(err.to_string())
}

const TRADES_HEADER: &[&str] = &["code", "time", "direct", "action", "price", "qty", "fee"];
const CLOSES_HEADER: &[&str] = &[
    "code", "direct", "opentime", "openprice", "closetime", "closeprice", "qty", "profit",
    "maxprofit", "maxloss", "totalprofit", "entertag", "exittag", "openbarno", "closebarno",
];
const FUNDS_HEADER: &[&str] = &[
    "date", "predynbalance", "prebalance", "balance", "closeprofit", "positionprofit", "fee",
    "maxdynbalance", "maxtime", "mindynbalance", "mintime", "mdmaxbalance", "mdmaxdate",
    "mdminbalance", "mdmindate",
];
const SIGNALS_HEADER: &[&str] = &["code", "target", "sigprice", "gentime", "usertag"];
const POSITIONS_HEADER: &[&str] = &["date", "code", "volume", "closeprofit", "dynprofit"];

fn write_csv<T: Serialize>(path: &Path, header: &[&str], rows: &[T]) -> Result<(), TapesimError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(output_err)?;
    writer.write_record(header).map_err(output_err)?;
    for row in rows {
        writer.serialize(row).map_err(output_err)?;
    }
    writer.flush().map_err(output_err)
}

/// Flush the five CSV outputs into `dir`, creating it if needed. Column
/// order and header names are normative and written even for empty runs.
pub fn write_outputs(dir: impl AsRef<Path>, logs: &OutputLogs) -> Result<(), TapesimError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(output_err)?;

    write_csv(&dir.join("trades.csv"), TRADES_HEADER, &logs.trades)?;
    write_csv(&dir.join("closes.csv"), CLOSES_HEADER, &logs.closes)?;
    write_csv(&dir.join("funds.csv"), FUNDS_HEADER, &logs.funds)?;
    write_csv(&dir.join("signals.csv"), SIGNALS_HEADER, &logs.signals)?;
    write_csv(&dir.join("positions.csv"), POSITIONS_HEADER, &logs.positions)?;

    info!(
        dir = %dir.display(),
        trades = logs.trades.len(),
        closes = logs.closes.len(),
        "outputs flushed"
    );
    Ok(())
}

/// Write the `datas.json` snapshot into `dir`.
pub fn write_snapshot(dir: impl AsRef<Path>, snapshot: &StateSnapshot) -> Result<(), TapesimError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(output_err)?;
    let content = serde_json::to_string_pretty(snapshot).map_err(output_err)?;
    std::fs::write(dir.join("datas.json"), content).map_err(output_err)
}

/// Load a prior run's `datas.json` for an incremental backtest.
pub fn load_snapshot(dir: impl AsRef<Path>) -> Result<StateSnapshot, TapesimError> {
    let path = dir.as_ref().join("datas.json");
    let content = std::fs::read_to_string(&path).map_err(output_err)?;
    serde_json::from_str(&content).map_err(output_err)
}

/// Persist strategy user data as `ud_<name>.json` when modified.
pub fn write_user_data(
    dir: impl AsRef<Path>,
    name: &str,
    data: &IndexMap<String, String>,
) -> Result<(), TapesimError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(output_err)?;
    let content = serde_json::to_string_pretty(data).map_err(output_err)?;
    std::fs::write(dir.join(format!("ud_{name}.json")), content).map_err(output_err)
}

/// Load strategy user data saved by a prior run, empty when absent.
pub fn load_user_data(
    dir: impl AsRef<Path>,
    name: &str,
) -> Result<IndexMap<String, String>, TapesimError> {
    let path = dir.as_ref().join(format!("ud_{name}.json"));
    if !path.exists() {
        return Ok(IndexMap::new());
    }
    let content = std::fs::read_to_string(&path).map_err(output_err)?;
    serde_json::from_str(&content).map_err(output_err)
}
