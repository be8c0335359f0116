use std::collections::{HashMap, HashSet};

use core_types::{
    is_placeholder_order_id, is_strategy_client_id, order_notional, AccountLabel, ManagedOrder,
    OrderState, OrderView, Side,
};
use rust_decimal::Decimal;

/// How long a sentinel-id order may stay unobserved before it is written off.
const PROVISIONAL_TIMEOUT_MS: i64 = 60_000;

/// What a reconciliation pass asks of its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    /// Newly confirmed traded size, to be recorded as a fill lot at the
    /// order's limit price.
    FillDelta {
        account: AccountLabel,
        side: Side,
        guard_price: Decimal,
        notional: Decimal,
        ts_ms: i64,
    },
    /// A live order outside the strategy client-id namespace. Never touched.
    Foreign {
        account: AccountLabel,
        order_id: String,
    },
    /// A tracked order missing from the snapshot; probe it once via
    /// `get_order` and report back through [`OrderTable::apply_probe`].
    Probe {
        client_id: u64,
        account: AccountLabel,
        order_id: String,
    },
    Closed {
        client_id: u64,
        state: OrderState,
    },
}

/// Managed orders for one instrument, keyed by client id.
#[derive(Debug, Default)]
pub struct OrderTable {
    orders: HashMap<u64, ManagedOrder>,
}

impl OrderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_placed(&mut self, order: ManagedOrder) {
        self.orders.insert(order.client_id, order);
    }

    pub fn get(&self, client_id: u64) -> Option<&ManagedOrder> {
        self.orders.get(&client_id)
    }

    pub fn orders(&self) -> impl Iterator<Item = &ManagedOrder> {
        self.orders.values()
    }

    /// Reconcile one account's live-order snapshot. Adopts unknown strategy
    /// orders (pre-existing fills are considered already accounted for by the
    /// position they produced), aligns sentinel ids, computes fill deltas and
    /// reports vanished orders for probing.
    pub fn sync_account(
        &mut self,
        account: AccountLabel,
        instrument: &str,
        live: &[OrderView],
        now_ms: i64,
        partial_timeout_ms: i64,
    ) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();
        for view in live {
            let client_id = match view.client_id {
                Some(id) if is_strategy_client_id(id) => id,
                _ => {
                    events.push(TrackerEvent::Foreign {
                        account,
                        order_id: view.order_id.clone(),
                    });
                    continue;
                }
            };
            seen.insert(client_id);
            let order = self.orders.entry(client_id).or_insert_with(|| {
                tracing::info!(
                    %account,
                    instrument,
                    client_id,
                    order_id = %view.order_id,
                    "adopted live strategy order"
                );
                ManagedOrder {
                    client_id,
                    exchange_order_id: view.order_id.clone(),
                    account,
                    instrument: instrument.to_string(),
                    side: view.side,
                    limit_price: view.limit_price,
                    original_size: view.size,
                    traded_size: view.traded_size,
                    applied_traded_size: view.traded_size,
                    notional_usdt: order_notional(view.size, view.limit_price),
                    state: OrderState::Open,
                    created_ts_ms: if view.create_ts_ms > 0 {
                        view.create_ts_ms
                    } else {
                        now_ms
                    },
                    last_seen_ts_ms: now_ms,
                    partial_since_ms: None,
                    strategy_owned: true,
                    guard_price: None,
                }
            });
            if is_placeholder_order_id(&order.exchange_order_id)
                && !is_placeholder_order_id(&view.order_id)
            {
                order.exchange_order_id = view.order_id.clone();
            }
            order.last_seen_ts_ms = now_ms;
            order.side = view.side;
            order.limit_price = view.limit_price;
            order.original_size = view.size;
            order.notional_usdt = order_notional(view.size, view.limit_price);
            apply_view(order, view, now_ms, partial_timeout_ms, &mut events);
        }
        for order in self.orders.values_mut() {
            if order.account != account || order.state.is_terminal() {
                continue;
            }
            if seen.contains(&order.client_id) {
                continue;
            }
            if is_placeholder_order_id(&order.exchange_order_id) {
                if now_ms - order.created_ts_ms > PROVISIONAL_TIMEOUT_MS {
                    order.state = OrderState::Cancelled;
                    events.push(TrackerEvent::Closed {
                        client_id: order.client_id,
                        state: OrderState::Cancelled,
                    });
                }
                continue;
            }
            // Absent from the snapshot: probe once. Covers both vanished
            // resting orders and placements that filled before their first
            // snapshot observation.
            events.push(TrackerEvent::Probe {
                client_id: order.client_id,
                account,
                order_id: order.exchange_order_id.clone(),
            });
        }
        events
    }

    /// Resolve a probe. `Some` applies the exchange's view; `None` means the
    /// order is definitively gone and is closed as cancelled, or filled when
    /// its traded size already reached the original size.
    pub fn apply_probe(
        &mut self,
        client_id: u64,
        view: Option<&OrderView>,
        now_ms: i64,
        partial_timeout_ms: i64,
    ) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        let Some(order) = self.orders.get_mut(&client_id) else {
            return events;
        };
        match view {
            Some(view) => {
                apply_view(order, view, now_ms, partial_timeout_ms, &mut events);
            }
            None => {
                let state = if order.traded_size >= order.original_size
                    && order.original_size > Decimal::ZERO
                {
                    OrderState::Filled
                } else {
                    OrderState::Cancelled
                };
                // Flush whatever traded before the order vanished.
                let delta = order.traded_size - order.applied_traded_size;
                if delta > Decimal::ZERO {
                    events.push(TrackerEvent::FillDelta {
                        account: order.account,
                        side: order.side,
                        guard_price: order.limit_price,
                        notional: order_notional(delta, order.limit_price),
                        ts_ms: now_ms,
                    });
                    order.applied_traded_size = order.traded_size;
                }
                order.state = state;
                events.push(TrackerEvent::Closed { client_id, state });
            }
        }
        events
    }

    pub fn mark_closed(&mut self, client_id: u64, state: OrderState) {
        if let Some(order) = self.orders.get_mut(&client_id) {
            order.state = state;
        }
    }

    pub fn active_orders(&self, now_ms: i64) -> impl Iterator<Item = &ManagedOrder> {
        self.orders.values().filter(move |o| o.is_active(now_ms))
    }

    pub fn active_count(&self, account: AccountLabel, now_ms: i64) -> usize {
        self.active_orders(now_ms)
            .filter(|o| o.account == account)
            .count()
    }

    /// Open strategy notional resting on `(account, side)`; offsets the
    /// imbalance gap while the hedge is in flight.
    pub fn open_hedge_notional(&self, account: AccountLabel, side: Side, now_ms: i64) -> Decimal {
        self.active_orders(now_ms)
            .filter(|o| o.account == account && o.side == side)
            .map(|o| o.notional_usdt)
            .sum()
    }

    /// Client ids to cancel, oldest first, so the account drops to `cap`
    /// active orders while the newest intention survives.
    pub fn over_cap_cancels(&self, account: AccountLabel, cap: usize, now_ms: i64) -> Vec<u64> {
        let mut active: Vec<&ManagedOrder> = self
            .active_orders(now_ms)
            .filter(|o| o.account == account)
            .collect();
        if active.len() <= cap {
            return Vec::new();
        }
        active.sort_by_key(|o| o.created_ts_ms);
        let overflow = active.len() - cap;
        active[..overflow].iter().map(|o| o.client_id).collect()
    }

    /// Drop terminal orders whose fills were fully handed to the ledger.
    pub fn prune_finalized(&mut self) {
        self.orders
            .retain(|_, o| !(o.state.is_terminal() && o.applied_traded_size >= o.traded_size));
    }
}

fn apply_view(
    order: &mut ManagedOrder,
    view: &OrderView,
    now_ms: i64,
    partial_timeout_ms: i64,
    events: &mut Vec<TrackerEvent>,
) {
    let traded = view.traded_size;
    let mut withheld = false;
    if traded > order.applied_traded_size {
        let is_partial_open = view.state == OrderState::Open
            && view.book_size > Decimal::ZERO
            && traded < order.original_size;
        if is_partial_open {
            let since = *order.partial_since_ms.get_or_insert(now_ms);
            withheld = now_ms - since < partial_timeout_ms;
        }
        if !withheld {
            let delta = traded - order.applied_traded_size;
            events.push(TrackerEvent::FillDelta {
                account: order.account,
                side: order.side,
                guard_price: order.limit_price,
                notional: order_notional(delta, order.limit_price),
                ts_ms: now_ms,
            });
            order.applied_traded_size = traded;
        }
    }
    order.traded_size = traded;
    if !order.state.is_terminal() {
        order.state = match view.state {
            OrderState::Open | OrderState::Pending
                if traded > Decimal::ZERO && traded < order.original_size =>
            {
                OrderState::Partial
            }
            OrderState::Pending => OrderState::Open,
            other => other,
        };
        if order.state.is_terminal() {
            events.push(TrackerEvent::Closed {
                client_id: order.client_id,
                state: order.state,
            });
        }
    }
}
