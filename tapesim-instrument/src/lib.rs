//! Static market metadata for the tapesim replay engine: trading sessions,
//! holiday calendars, commodity and contract definitions, fee schedules,
//! and main-contract rollover rules.
//!
//! Everything here is loaded once at startup and borrowed by the replayer,
//! the matching engine and the strategy contexts for the lifetime of a run.

use fnv::FnvHashMap;
use serde::de::DeserializeOwned;
use smol_str::SmolStr;
use std::path::Path;
use tracing::info;

use crate::{
    commodity::CommoditySpec,
    contract::{CodeRef, ContractSpec},
    error::MetaError,
    fee::{FeeKind, FeeTemplate},
    holiday::HolidayCalendar,
    hot::{HotRules, HotSwitch},
    session::SessionSpec,
};

pub mod commodity;
pub mod contract;
pub mod error;
pub mod fee;
pub mod holiday;
pub mod hot;
pub mod session;

/// Owner of all static metadata. Components borrow specs from here; the
/// manager outlives the replay run.
#[derive(Debug, Clone, Default)]
pub struct MetadataManager {
    sessions: FnvHashMap<SmolStr, SessionSpec>,
    calendars: FnvHashMap<SmolStr, HolidayCalendar>,
    commodities: FnvHashMap<SmolStr, CommoditySpec>,
    contracts: FnvHashMap<SmolStr, ContractSpec>,
    fees: FnvHashMap<SmolStr, FeeTemplate>,
    hot_rules: HotRules,
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, MetaError> {
    let content = std::fs::read_to_string(path).map_err(|err| MetaError::Io {
        path: path.display().to_string(),
        detail: err.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|err| MetaError::Parse {
        path: path.display().to_string(),
        detail: err.to_string(),
    })
}

impl MetadataManager {
    pub fn load_sessions(&mut self, path: impl AsRef<Path>) -> Result<(), MetaError> {
        let sessions: Vec<SessionSpec> = load_json(path.as_ref())?;
        info!(count = sessions.len(), "loaded session templates");
        self.sessions.extend(sessions.into_iter().map(|s| (s.id.clone(), s)));
        Ok(())
    }

    pub fn load_commodities(&mut self, path: impl AsRef<Path>) -> Result<(), MetaError> {
        let commodities: Vec<CommoditySpec> = load_json(path.as_ref())?;
        info!(count = commodities.len(), "loaded commodities");
        self.commodities.extend(commodities.into_iter().map(|c| (c.key(), c)));
        Ok(())
    }

    pub fn load_contracts(&mut self, path: impl AsRef<Path>) -> Result<(), MetaError> {
        let contracts: Vec<ContractSpec> = load_json(path.as_ref())?;
        info!(count = contracts.len(), "loaded contracts");
        self.contracts.extend(contracts.into_iter().map(|c| (c.std_code(), c)));
        Ok(())
    }

    pub fn load_holidays(&mut self, path: impl AsRef<Path>) -> Result<(), MetaError> {
        let calendars: FnvHashMap<SmolStr, Vec<u32>> = load_json(path.as_ref())?;
        info!(count = calendars.len(), "loaded holiday calendars");
        self.calendars.extend(
            calendars
                .into_iter()
                .map(|(name, dates)| (name.clone(), HolidayCalendar::new(name, dates))),
        );
        Ok(())
    }

    pub fn load_fees(&mut self, path: impl AsRef<Path>) -> Result<(), MetaError> {
        let fees: FnvHashMap<SmolStr, FeeTemplate> = load_json(path.as_ref())?;
        info!(count = fees.len(), "loaded fee schedules");
        self.fees.extend(fees);
        Ok(())
    }

    pub fn load_hot_rules(&mut self, path: impl AsRef<Path>) -> Result<(), MetaError> {
        let rules: FnvHashMap<SmolStr, Vec<HotSwitch>> = load_json(path.as_ref())?;
        info!(count = rules.len(), "loaded rollover rules");
        self.hot_rules = HotRules::new(rules);
        Ok(())
    }

    // Programmatic registration, used by tests and embedded setups.

    pub fn add_session(&mut self, session: SessionSpec) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn add_calendar(&mut self, calendar: HolidayCalendar) {
        self.calendars.insert(calendar.name.clone(), calendar);
    }

    pub fn add_commodity(&mut self, commodity: CommoditySpec) {
        self.commodities.insert(commodity.key(), commodity);
    }

    pub fn add_contract(&mut self, contract: ContractSpec) {
        self.contracts.insert(contract.std_code(), contract);
    }

    pub fn add_fee(&mut self, key: impl Into<SmolStr>, template: FeeTemplate) {
        self.fees.insert(key.into(), template);
    }

    pub fn set_hot_rules(&mut self, rules: HotRules) {
        self.hot_rules = rules;
    }

    // Queries.

    pub fn session(&self, id: &str) -> Option<&SessionSpec> {
        self.sessions.get(id)
    }

    pub fn calendar(&self, name: &str) -> Option<&HolidayCalendar> {
        self.calendars.get(name)
    }

    pub fn commodity(&self, key: &str) -> Option<&CommoditySpec> {
        self.commodities.get(key)
    }

    pub fn contract(&self, std_code: &str) -> Option<&ContractSpec> {
        self.contracts.get(std_code)
    }

    pub fn hot_rules(&self) -> &HotRules {
        &self.hot_rules
    }

    /// Commodity backing a standard code, resolving the `EXCHG.PRODUCT`
    /// part and ignoring any adjustment suffix.
    pub fn commodity_of(&self, std_code: &str) -> Option<&CommoditySpec> {
        let code = CodeRef::parse(std_code)?;
        self.commodities.get(code.commodity_key().as_str())
    }

    /// Session template a standard code trades under.
    pub fn session_of(&self, std_code: &str) -> Option<&SessionSpec> {
        let commodity = self.commodity_of(std_code)?;
        self.sessions.get(commodity.session_id.as_str())
    }

    /// Holiday calendar a standard code follows.
    pub fn calendar_of(&self, std_code: &str) -> Option<&HolidayCalendar> {
        let commodity = self.commodity_of(std_code)?;
        self.calendars.get(commodity.calendar.as_str())
    }

    /// Fee for a fill on `std_code`. Unknown commodities or missing fee
    /// schedules charge nothing.
    pub fn calc_fee(&self, std_code: &str, price: f64, qty: f64, kind: FeeKind) -> f64 {
        let Some(commodity) = self.commodity_of(std_code) else {
            return 0.0;
        };
        let Some(template) = self.fees.get(commodity.key().as_str()) else {
            return 0.0;
        };
        template.calc(price, qty, commodity.multiplier, kind)
    }
}
