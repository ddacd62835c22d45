use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// One main-contract switch: on `date`, the rolled series stops tracking
/// `from` and starts tracking `to`. `factor` is the price-continuity ratio
/// introduced by this switch (new close / old close on the eve).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, derive_more::Constructor)]
pub struct HotSwitch {
    pub date: u32,
    pub from: SmolStr,
    pub to: SmolStr,
    #[serde(default = "one")]
    pub factor: f64,
}

fn one() -> f64 {
    1.0
}

/// Main-contract rollover rules, keyed by `EXCHG.PRODUCT`.
///
/// Switch lists are kept sorted by date; queries binary-search on the
/// trading date.
#[derive(Debug, Clone, Default)]
pub struct HotRules {
    rules: FnvHashMap<SmolStr, Vec<HotSwitch>>,
}

impl HotRules {
    pub fn new(rules: FnvHashMap<SmolStr, Vec<HotSwitch>>) -> Self {
        let mut rules = rules;
        for switches in rules.values_mut() {
            switches.sort_by_key(|s| s.date);
        }
        Self { rules }
    }

    pub fn insert(&mut self, key: impl Into<SmolStr>, mut switches: Vec<HotSwitch>) {
        switches.sort_by_key(|s| s.date);
        self.rules.insert(key.into(), switches);
    }

    fn switches(&self, exchange: &str, product: &str) -> Option<&[HotSwitch]> {
        self.rules
            .get(format!("{exchange}.{product}").as_str())
            .map(Vec::as_slice)
    }

    /// Raw contract the rolled series tracks on trading date `tdate`.
    pub fn raw_code(&self, exchange: &str, product: &str, tdate: u32) -> Option<SmolStr> {
        let switches = self.switches(exchange, product)?;
        let idx = switches.partition_point(|s| s.date <= tdate);
        if idx == 0 {
            return None;
        }
        Some(switches[idx - 1].to.clone())
    }

    /// Raw contract the rolled series tracked before the switch in force on
    /// `tdate`. Returns `None` when no switch has happened yet.
    pub fn prev_raw_code(&self, exchange: &str, product: &str, tdate: u32) -> Option<SmolStr> {
        let switches = self.switches(exchange, product)?;
        let idx = switches.partition_point(|s| s.date <= tdate);
        if idx == 0 {
            return None;
        }
        let from = &switches[idx - 1].from;
        (!from.is_empty()).then(|| from.clone())
    }

    /// Whether the main contract changes exactly on `tdate`.
    pub fn is_switch_date(&self, exchange: &str, product: &str, tdate: u32) -> bool {
        self.switches(exchange, product)
            .is_some_and(|switches| switches.iter().any(|s| s.date == tdate))
    }

    /// Cumulative rollover factor from series start up to and including
    /// `tdate`, used to build continuous price series.
    pub fn rule_factor(&self, exchange: &str, product: &str, tdate: u32) -> f64 {
        let Some(switches) = self.switches(exchange, product) else {
            return 1.0;
        };
        switches
            .iter()
            .take_while(|s| s.date <= tdate)
            .map(|s| s.factor)
            .product()
    }
}
