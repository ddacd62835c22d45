use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A listed contract: `exchange` venue, raw `code`, owning `product`.
#[derive(
    Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, derive_more::Constructor,
)]
pub struct ContractSpec {
    pub exchange: SmolStr,
    pub code: SmolStr,
    pub product: SmolStr,
}

impl ContractSpec {
    /// Standard code `EXCHG.PRODUCT.CODE` used everywhere in the engine.
    pub fn std_code(&self) -> SmolStr {
        SmolStr::new(format!("{}.{}.{}", self.exchange, self.product, self.code))
    }
}

/// Price-adjustment mode requested through a standard-code suffix.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Deserialize, Serialize)]
pub enum AdjustMode {
    #[default]
    None,
    /// `+H`: back-adjusted, chained factor applied from series start.
    Backward,
    /// `+Q`: forward-adjusted, identity at the current date.
    Forward,
}

/// Decomposed standard code `EXCHG.PRODUCT.SYMBOL[+H|+Q]`.
///
/// `SYMBOL` of `HOT` selects the continuously-rolled main contract.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CodeRef {
    pub exchange: SmolStr,
    pub product: SmolStr,
    pub symbol: SmolStr,
    pub adjust: AdjustMode,
}

impl CodeRef {
    /// Parse a standard code. Two-part codes (`EXCHG.SYMBOL`) treat the
    /// symbol as the product, matching cash-equity conventions.
    pub fn parse(std_code: &str) -> Option<Self> {
        let (body, adjust) = match std_code {
            s if s.ends_with("+H") => (&s[..s.len() - 2], AdjustMode::Backward),
            s if s.ends_with("+Q") => (&s[..s.len() - 2], AdjustMode::Forward),
            s => (s, AdjustMode::None),
        };

        let mut parts = body.split('.');
        let exchange = SmolStr::new(parts.next()?);
        let product = SmolStr::new(parts.next()?);
        let symbol = match parts.next() {
            Some(symbol) => SmolStr::new(symbol),
            None => product.clone(),
        };
        if parts.next().is_some() || exchange.is_empty() || product.is_empty() {
            return None;
        }

        Some(Self { exchange, product, symbol, adjust })
    }

    /// Whether this code names the rolled main contract rather than a raw
    /// monthly symbol.
    pub fn is_hot(&self) -> bool {
        self.symbol == "HOT"
    }

    /// `EXCHG.PRODUCT` commodity key.
    pub fn commodity_key(&self) -> SmolStr {
        SmolStr::new(format!("{}.{}", self.exchange, self.product))
    }

    /// Standard code with the adjustment suffix stripped.
    pub fn plain_code(&self) -> SmolStr {
        SmolStr::new(format!("{}.{}.{}", self.exchange, self.product, self.symbol))
    }
}
