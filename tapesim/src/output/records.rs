use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// One fill, a `trades.csv` row. Column order is normative.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TradeRecord {
    pub code: SmolStr,
    pub time: u64,
    pub direct: SmolStr,
    pub action: SmolStr,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
}

/// One FIFO-consumed lot, a `closes.csv` row.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CloseRecord {
    pub code: SmolStr,
    pub direct: SmolStr,
    pub opentime: u64,
    pub openprice: f64,
    pub closetime: u64,
    pub closeprice: f64,
    pub qty: f64,
    pub profit: f64,
    pub maxprofit: f64,
    pub maxloss: f64,
    pub totalprofit: f64,
    pub entertag: SmolStr,
    pub exittag: SmolStr,
    pub openbarno: u32,
    pub closebarno: u32,
}

/// One session summary, a `funds.csv` row.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FundRecord {
    pub date: u32,
    pub predynbalance: f64,
    pub prebalance: f64,
    pub balance: f64,
    pub closeprofit: f64,
    pub positionprofit: f64,
    pub fee: f64,
    pub maxdynbalance: f64,
    pub maxtime: u64,
    pub mindynbalance: f64,
    pub mintime: u64,
    pub mdmaxbalance: f64,
    pub mdmaxdate: u32,
    pub mdminbalance: f64,
    pub mdmindate: u32,
}

/// One emitted signal, a `signals.csv` row.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SignalRecord {
    pub code: SmolStr,
    pub target: f64,
    pub sigprice: f64,
    pub gentime: u64,
    pub usertag: SmolStr,
}

/// One end-of-session open position, a `positions.csv` row.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PositionRecord {
    pub date: u32,
    pub code: SmolStr,
    pub volume: f64,
    pub closeprofit: f64,
    pub dynprofit: f64,
}

/// Accumulated output rows for one strategy run, flushed to CSV at the
/// end. Appending here is the only side channel accounting writes to, so
/// two identical replays produce identical files.
#[derive(Debug, Clone, Default)]
pub struct OutputLogs {
    pub trades: Vec<TradeRecord>,
    pub closes: Vec<CloseRecord>,
    pub funds: Vec<FundRecord>,
    pub signals: Vec<SignalRecord>,
    pub positions: Vec<PositionRecord>,
}

impl OutputLogs {
    #[allow(clippy::too_many_arguments)]
    pub fn log_trade(
        &mut self,
        code: &str,
        is_long: bool,
        is_open: bool,
        time: u64,
        price: f64,
        qty: f64,
        fee: f64,
    ) {
        self.trades.push(TradeRecord {
            code: SmolStr::new(code),
            time,
            direct: SmolStr::new_static(if is_long { "LONG" } else { "SHORT" }),
            action: SmolStr::new_static(if is_open { "OPEN" } else { "CLOSE" }),
            price,
            qty,
            fee,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_close(
        &mut self,
        code: &str,
        is_long: bool,
        opentime: u64,
        openprice: f64,
        closetime: u64,
        closeprice: f64,
        qty: f64,
        profit: f64,
        maxprofit: f64,
        maxloss: f64,
        totalprofit: f64,
        entertag: &str,
        exittag: &str,
        openbarno: u32,
        closebarno: u32,
    ) {
        self.closes.push(CloseRecord {
            code: SmolStr::new(code),
            direct: SmolStr::new_static(if is_long { "LONG" } else { "SHORT" }),
            opentime,
            openprice,
            closetime,
            closeprice,
            qty,
            profit,
            maxprofit,
            maxloss,
            totalprofit,
            entertag: SmolStr::new(entertag),
            exittag: SmolStr::new(exittag),
            openbarno,
            closebarno,
        });
    }

    pub fn log_signal(&mut self, code: &str, target: f64, sigprice: f64, gentime: u64, tag: &str) {
        self.signals.push(SignalRecord {
            code: SmolStr::new(code),
            target,
            sigprice,
            gentime,
            usertag: SmolStr::new(tag),
        });
    }
}
