use serde::{Deserialize, Serialize};

/// Which leg of a round trip a fill belongs to, for fee selection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum FeeKind {
    Open,
    Close,
    CloseToday,
}

/// Commodity fee schedule.
///
/// When `by_volume` is set the rates are absolute per-lot amounts,
/// otherwise they are fractions of traded notional
/// (`rate * price * qty * multiplier`).
#[derive(
    Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize, derive_more::Constructor,
)]
pub struct FeeTemplate {
    #[serde(default)]
    pub open: f64,
    #[serde(default)]
    pub close: f64,
    #[serde(default)]
    pub close_today: f64,
    #[serde(default)]
    pub by_volume: bool,
    #[serde(default)]
    pub margin: f64,
}

impl FeeTemplate {
    fn rate(&self, kind: FeeKind) -> f64 {
        match kind {
            FeeKind::Open => self.open,
            FeeKind::Close => self.close,
            FeeKind::CloseToday => self.close_today,
        }
    }

    /// Fee for a fill, rounded to cents.
    pub fn calc(&self, price: f64, qty: f64, multiplier: f64, kind: FeeKind) -> f64 {
        let raw = if self.by_volume {
            self.rate(kind) * qty
        } else {
            self.rate(kind) * price * qty * multiplier
        };
        (raw * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_calc() {
        struct TestCase {
            template: FeeTemplate,
            price: f64,
            qty: f64,
            multiplier: f64,
            kind: FeeKind,
            expected: f64,
        }

        let by_volume = FeeTemplate::new(1.5, 1.0, 3.0, true, 0.1);
        let by_notional = FeeTemplate::new(0.0002, 0.0003, 0.0, false, 0.1);

        let tests = vec![
            // TC0: per-lot open fee
            TestCase {
                template: by_volume,
                price: 5000.0,
                qty: 2.0,
                multiplier: 10.0,
                kind: FeeKind::Open,
                expected: 3.0,
            },
            // TC1: per-lot close-today fee
            TestCase {
                template: by_volume,
                price: 5000.0,
                qty: 2.0,
                multiplier: 10.0,
                kind: FeeKind::CloseToday,
                expected: 6.0,
            },
            // TC2: notional fee rounds to cents
            TestCase {
                template: by_notional,
                price: 12.345,
                qty: 3.0,
                multiplier: 100.0,
                kind: FeeKind::Open,
                expected: 0.74,
            },
            // TC3: notional close fee
            TestCase {
                template: by_notional,
                price: 100.0,
                qty: 1.0,
                multiplier: 300.0,
                kind: FeeKind::Close,
                expected: 9.0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.template.calc(test.price, test.qty, test.multiplier, test.kind);
            assert!((actual - test.expected).abs() < 1e-9, "TC{} failed: {}", index, actual);
        }
    }
}
