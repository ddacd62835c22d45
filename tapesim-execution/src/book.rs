use std::collections::BTreeMap;
use tapesim_data::Tick;

/// Fixed-point price scale for level keys; avoids float keys in the map.
const PRICE_SCALE: f64 = 10_000.0;

pub fn scale_price(price: f64) -> i64 {
    if !price.is_finite() || price == f64::MAX {
        return 0;
    }
    if price >= 0.0 {
        (price * PRICE_SCALE + 0.5) as i64
    } else {
        (price * PRICE_SCALE - 0.5) as i64
    }
}

/// Per-instrument limit-order-book mirror rebuilt from each tick: last
/// price, the touch, and up to ten visible levels per side.
#[derive(Debug, Clone, Default)]
pub struct LimitOrderBook {
    pub cur_px: i64,
    pub ask_px: i64,
    pub bid_px: i64,
    levels: BTreeMap<i64, f64>,
}

impl LimitOrderBook {
    /// Refresh the book from a tick. Levels that fell strictly between the
    /// new best bid and ask are purged: they no longer exist in the market.
    pub fn update(&mut self, tick: &Tick) {
        self.cur_px = scale_price(tick.price);
        self.ask_px = scale_price(tick.ask_price(0));
        self.bid_px = scale_price(tick.bid_price(0));

        for level in 0..10 {
            let ask = scale_price(tick.ask_price(level));
            let bid = scale_price(tick.bid_price(level));
            if ask == 0 && bid == 0 {
                break;
            }
            if ask != 0 {
                self.levels.insert(ask, tick.ask_volume(level));
            }
            if bid != 0 {
                self.levels.insert(bid, tick.bid_volume(level));
            }
        }

        if self.bid_px != 0 && self.ask_px != 0 {
            let purge: Vec<i64> = self
                .levels
                .range(self.bid_px + 1..self.ask_px)
                .map(|(px, _)| *px)
                .collect();
            for px in purge {
                self.levels.remove(&px);
            }
        }
    }

    pub fn level_volume(&self, price: i64) -> f64 {
        self.levels.get(&price).copied().unwrap_or(0.0)
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> Tick {
        let mut tick = Tick { price, ..Tick::default() };
        for (i, (px, qty)) in bids.iter().enumerate() {
            tick.bid_prices[i] = *px;
            tick.bid_qty[i] = *qty;
        }
        for (i, (px, qty)) in asks.iter().enumerate() {
            tick.ask_prices[i] = *px;
            tick.ask_qty[i] = *qty;
        }
        tick
    }

    #[test]
    fn test_update_and_purge() {
        let mut book = LimitOrderBook::default();
        book.update(&tick(
            100.0,
            &[(100.0, 5.0), (99.5, 8.0)],
            &[(100.5, 3.0), (101.0, 6.0)],
        ));
        assert_eq!(book.cur_px, scale_price(100.0));
        assert_eq!(book.level_volume(scale_price(100.0)), 5.0);
        assert_eq!(book.level_volume(scale_price(100.5)), 3.0);

        // The touch widens past an old level: 101.0 now sits strictly
        // inside the spread and is purged; levels outside it survive.
        book.update(&tick(100.5, &[(100.5, 4.0)], &[(101.5, 2.0)]));
        assert_eq!(book.level_volume(scale_price(101.0)), 0.0);
        assert_eq!(book.level_volume(scale_price(100.5)), 4.0);
        assert_eq!(book.level_volume(scale_price(100.0)), 5.0);
    }
}
