use fnv::FnvHashMap;
use indexmap::IndexMap;
use smol_str::SmolStr;
use tapesim_data::Tick;
use tracing::{debug, info};

use crate::{
    book::LimitOrderBook,
    error::MatchError,
    order::{MatchEvent, OrderInfo, OrderState, TimeInForce},
};

fn feq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// Virtual matching engine: per-instrument book mirrors plus the set of
/// live client orders, matched against replayed ticks.
///
/// Invoked only from the scheduler thread; single-threaded by design.
/// `handle_tick` returns the emitted [`MatchEvent`]s in deterministic
/// order (orders iterate in submission order).
#[derive(Debug, Default)]
pub struct MatchEngine {
    /// Assumed fraction of queued lots ahead of us that will cancel.
    cancel_rate: f64,
    books: FnvHashMap<SmolStr, LimitOrderBook>,
    last_ticks: FnvHashMap<SmolStr, Tick>,
    orders: IndexMap<u32, OrderInfo>,
    next_local_id: u32,
}

impl MatchEngine {
    pub fn new(cancel_rate: f64) -> Self {
        Self {
            cancel_rate,
            next_local_id: 1,
            ..Self::default()
        }
    }

    pub fn order(&self, local_id: u32) -> Option<&OrderInfo> {
        self.orders.get(&local_id)
    }

    pub fn orders(&self) -> impl Iterator<Item = &OrderInfo> {
        self.orders.values()
    }

    pub fn last_tick(&self, code: &str) -> Option<&Tick> {
        self.last_ticks.get(code)
    }

    /// Drop every tracked order, eg/ when resetting between runs.
    pub fn clear(&mut self) {
        self.orders.clear();
    }

    /// Submit a buy order. Fails synchronously when no tick has been seen
    /// for `code` yet.
    pub fn buy(
        &mut self,
        code: &str,
        limit: f64,
        qty: f64,
        tif: TimeInForce,
        user_tag: &str,
        time: u64,
    ) -> Result<u32, MatchError> {
        self.place(code, true, limit, qty, tif, user_tag, time)
    }

    /// Submit a sell order; mirrors [`buy`](Self::buy).
    pub fn sell(
        &mut self,
        code: &str,
        limit: f64,
        qty: f64,
        tif: TimeInForce,
        user_tag: &str,
        time: u64,
    ) -> Result<u32, MatchError> {
        self.place(code, false, limit, qty, tif, user_tag, time)
    }

    fn place(
        &mut self,
        code: &str,
        buy: bool,
        limit: f64,
        qty: f64,
        tif: TimeInForce,
        user_tag: &str,
        time: u64,
    ) -> Result<u32, MatchError> {
        let Some(last) = self.last_ticks.get(code) else {
            return Err(MatchError::UnknownCode(code.to_string()));
        };

        let mut order = OrderInfo {
            local_id: self.next_local_id,
            code: SmolStr::new(code),
            buy,
            qty,
            left: qty,
            traded: 0.0,
            limit,
            price: last.price,
            state: OrderState::Pending,
            time,
            queue: 0.0,
            positive: false,
            tif,
            user_tag: SmolStr::new(user_tag),
        };
        self.next_local_id += 1;

        // Queue position: crossing the touch is aggressive; joining the
        // touch queues behind the visible size less the assumed cancels;
        // matching the last price queues behind the depth-weighted mid.
        let (same_touch, same_qty, opp_touch) = if buy {
            (last.bid_price(0), last.bid_volume(0), last.ask_price(0))
        } else {
            (last.ask_price(0), last.ask_volume(0), last.bid_price(0))
        };

        if buy && limit >= opp_touch - 1e-9 || !buy && limit <= opp_touch + 1e-9 {
            order.positive = true;
        } else if feq(limit, same_touch) {
            order.queue = same_qty;
        }
        if !order.positive && feq(limit, last.price) {
            let depth = last.ask_volume(0) * last.ask_price(0)
                + last.bid_volume(0) * last.bid_price(0);
            let touch_sum = last.ask_price(0) + last.bid_price(0);
            if touch_sum > 0.0 {
                order.queue = (depth / touch_sum).round();
            }
        }
        order.queue = (order.queue * (1.0 - self.cancel_rate)).round().max(0.0);

        debug!(
            local_id = order.local_id,
            code,
            buy,
            limit,
            qty,
            queue = order.queue,
            positive = order.positive,
            "order placed"
        );

        let local_id = order.local_id;
        self.orders.insert(local_id, order);
        Ok(local_id)
    }

    /// Request cancellation of one order. Returns the remaining quantity,
    /// signed by side, or `None` for unknown/terminal orders. The
    /// cancelled `Order` event is emitted on the next tick.
    pub fn cancel(&mut self, local_id: u32) -> Option<f64> {
        let order = self.orders.get_mut(&local_id)?;
        if order.state == OrderState::Cancelled {
            return None;
        }
        order.state = OrderState::CancelRequested;
        Some(order.left * if order.buy { 1.0 } else { -1.0 })
    }

    /// Request cancellation of active orders on `code` and side until
    /// `qty` is covered (`0` cancels all). Returns the local ids touched.
    pub fn cancel_side(&mut self, code: &str, is_buy: bool, qty: f64) -> Vec<u32> {
        let mut cancelled = Vec::new();
        let mut remaining = qty;
        for order in self.orders.values_mut() {
            if order.state != OrderState::Active || order.buy != is_buy || order.code != code {
                continue;
            }
            order.state = OrderState::CancelRequested;
            cancelled.push(order.local_id);
            if qty != 0.0 {
                if remaining <= order.left {
                    break;
                }
                remaining -= order.left;
            }
        }
        cancelled
    }

    /// Process one tick: refresh the book, acknowledge pending orders,
    /// report requested cancels, then attempt fills.
    pub fn handle_tick(&mut self, tick: &Tick) -> Result<Vec<MatchEvent>, MatchError> {
        let stamp = tick.stamp();
        for order in self.orders.values() {
            if order.code == tick.code && stamp < order.time {
                return Err(MatchError::TickPredatesOrder {
                    local_id: order.local_id,
                    order_time: order.time,
                    tick_time: stamp,
                });
            }
        }

        self.books
            .entry(tick.code.clone())
            .or_default()
            .update(tick);
        self.last_ticks.insert(tick.code.clone(), tick.clone());

        let mut events = Vec::new();
        let mut to_erase = Vec::new();

        self.fire_orders(&tick.code, &mut events);
        self.match_orders(tick, &mut events, &mut to_erase);

        for local_id in to_erase {
            self.orders.shift_remove(&local_id);
        }

        Ok(events)
    }

    /// Acknowledge pending orders on `code`: entrust success plus the
    /// initial order echo, then activate.
    fn fire_orders(&mut self, code: &str, events: &mut Vec<MatchEvent>) {
        for order in self.orders.values_mut() {
            if order.state != OrderState::Pending || order.code != code {
                continue;
            }
            events.push(MatchEvent::Entrust {
                local_id: order.local_id,
                code: order.code.clone(),
                success: true,
                message: SmolStr::default(),
                time: order.time,
            });
            events.push(MatchEvent::Order {
                local_id: order.local_id,
                code: order.code.clone(),
                buy: order.buy,
                left: order.left,
                price: order.limit,
                cancelled: false,
                time: order.time,
            });
            order.state = OrderState::Active;
        }
    }

    fn match_orders(
        &mut self,
        tick: &Tick,
        events: &mut Vec<MatchEvent>,
        to_erase: &mut Vec<u32>,
    ) {
        let stamp = tick.stamp();

        for order in self.orders.values_mut() {
            if order.code != tick.code {
                continue;
            }

            if order.state == OrderState::CancelRequested {
                events.push(MatchEvent::Order {
                    local_id: order.local_id,
                    code: order.code.clone(),
                    buy: order.buy,
                    left: 0.0,
                    price: order.limit,
                    cancelled: true,
                    time: order.time,
                });
                info!(
                    local_id = order.local_id,
                    left = order.left * if order.buy { 1.0 } else { -1.0 },
                    "order cancelled"
                );
                order.state = OrderState::Cancelled;
                order.left = 0.0;
                to_erase.push(order.local_id);
                continue;
            }

            if order.state != OrderState::Active {
                continue;
            }

            // Reference quote: aggressive orders consume the opposite
            // touch, resting orders consume the trade stream.
            let (ref_price, ref_volume) = match (order.positive, order.buy) {
                (true, true) => (tick.ask_price(0), tick.ask_volume(0)),
                (true, false) => (tick.bid_price(0), tick.bid_volume(0)),
                (false, _) => (tick.price, tick.volume),
            };

            let immediate = order.tif != TimeInForce::Gfd;

            // Fill-or-kill: the full size must be coverable by the
            // reference volume at submission, else nothing fills.
            if order.tif == TimeInForce::Fok && ref_volume + 1e-9 < order.qty {
                Self::kill(order, events, to_erase);
                continue;
            }

            let crosses = if order.buy {
                ref_price <= order.limit + 1e-9 && ref_price > 0.0
            } else {
                ref_price >= order.limit - 1e-9
            };

            if !crosses || ref_volume <= 0.0 {
                // Immediate orders die on a dry or non-crossing tick; the
                // reference-volume condition is authoritative here.
                if immediate {
                    Self::kill(order, events, to_erase);
                }
                continue;
            }

            let mut volume = ref_volume;
            if !order.positive && feq(ref_price, order.limit) {
                // Price sits on our limit: honour the queue ahead of us.
                if volume <= order.queue {
                    order.queue -= volume;
                    if immediate {
                        Self::kill(order, events, to_erase);
                    }
                    continue;
                } else if order.queue != 0.0 {
                    volume -= order.queue;
                    order.queue = 0.0;
                }
            } else if !order.positive {
                // Price went through the limit: the level was swept.
                volume = order.left;
            }

            let qty = volume.min(order.left);
            if qty <= 0.0 {
                if immediate {
                    Self::kill(order, events, to_erase);
                }
                continue;
            }

            order.traded += qty;
            order.left -= qty;

            events.push(MatchEvent::Trade {
                local_id: order.local_id,
                code: order.code.clone(),
                buy: order.buy,
                qty,
                fired_price: order.price,
                price: ref_price,
                time: stamp,
            });
            events.push(MatchEvent::Order {
                local_id: order.local_id,
                code: order.code.clone(),
                buy: order.buy,
                left: order.left,
                price: ref_price,
                cancelled: false,
                time: stamp,
            });

            if order.left <= 1e-9 {
                to_erase.push(order.local_id);
            } else if immediate {
                // Fill-and-kill: the remainder cancels at once.
                Self::kill(order, events, to_erase);
            }
        }
    }

    fn kill(order: &mut OrderInfo, events: &mut Vec<MatchEvent>, to_erase: &mut Vec<u32>) {
        events.push(MatchEvent::Order {
            local_id: order.local_id,
            code: order.code.clone(),
            buy: order.buy,
            left: 0.0,
            price: order.limit,
            cancelled: true,
            time: order.time,
        });
        order.state = OrderState::Cancelled;
        order.left = 0.0;
        to_erase.push(order.local_id);
    }

    pub fn book(&self, code: &str) -> Option<&LimitOrderBook> {
        self.books.get(code)
    }
}
