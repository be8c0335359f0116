use core_types::{
    ceil_to_tick, floor_to_tick, AccountLabel, BookTop, PositionMode, PositionSnapshot, Side,
    SymbolConfig,
};
use fill_ledger::FillLedger;
use order_tracker::OrderTable;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Engine-wide decision knobs, shared by every instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Below this notional difference the per-account cap tightens to one.
    pub single_order_diff_threshold_usdt: Decimal,
    /// Positions closer than this are treated as equal.
    pub equal_dust_usdt: Decimal,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            single_order_diff_threshold_usdt: Decimal::new(20, 0),
            equal_dust_usdt: Decimal::new(1, 6),
        }
    }
}

pub const NORMAL_ACCOUNT_CAP: usize = 2;
pub const LOW_DIFF_ACCOUNT_CAP: usize = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceIntent {
    pub account: AccountLabel,
    pub side: Side,
    pub guard_price: Option<Decimal>,
    pub notional: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelIntent {
    pub client_id: u64,
    pub reason: &'static str,
}

/// Conditions the runner forwards to the alert centre; the policy itself
/// never talks to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PolicyNote {
    MaxTotalReached { total: Decimal },
    MinTotalReached { total: Decimal },
    DecreaseDirectionMismatch { size_a: Decimal, size_b: Decimal },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Decision {
    pub cancels: Vec<CancelIntent>,
    pub places: Vec<PlaceIntent>,
    pub notes: Vec<PolicyNote>,
}

pub struct DecisionInputs<'a> {
    pub config: &'a SymbolConfig,
    pub pos_a: PositionSnapshot,
    pub pos_b: PositionSnapshot,
    pub ledger: &'a FillLedger,
    pub orders: &'a OrderTable,
    pub now_ms: i64,
}

/// Maker price satisfying both the book and the guard: sells quote at or
/// above `max(ask1, guard)` rounded up to tick, buys at or below
/// `min(bid1, guard)` rounded down. Rounding direction can never violate
/// the protection inequality.
pub fn maker_price(side: Side, book: &BookTop, guard: Option<Decimal>, tick: Decimal) -> Decimal {
    match side {
        Side::Sell => ceil_to_tick(guard.map_or(book.ask1, |g| book.ask1.max(g)), tick),
        Side::Buy => floor_to_tick(guard.map_or(book.bid1, |g| book.bid1.min(g)), tick),
    }
}

/// One pass of the per-instrument state machine. Pure: reads positions,
/// lots and the order table, emits cancel and placement intents.
pub fn decide(inputs: &DecisionInputs<'_>, settings: &PolicySettings) -> Decision {
    let cfg = inputs.config;
    let mut decision = Decision::default();
    let abs_a = inputs.pos_a.abs_notional;
    let abs_b = inputs.pos_b.abs_notional;
    let diff = (abs_a - abs_b).abs();

    let cap = if diff < settings.single_order_diff_threshold_usdt {
        LOW_DIFF_ACCOUNT_CAP
    } else {
        NORMAL_ACCOUNT_CAP
    };
    for account in AccountLabel::both() {
        for client_id in inputs.orders.over_cap_cancels(account, cap, inputs.now_ms) {
            decision.cancels.push(CancelIntent {
                client_id,
                reason: "account_order_cap",
            });
        }
    }
    let total = abs_a + abs_b;
    let increase_limit_reached =
        cfg.position_mode == PositionMode::Increase && total >= cfg.max_total_position_usdt;
    let decrease_limit_reached =
        cfg.position_mode == PositionMode::Decrease && total <= cfg.min_total_position_usdt;
    if increase_limit_reached {
        decision.notes.push(PolicyNote::MaxTotalReached { total });
    }
    if decrease_limit_reached {
        decision.notes.push(PolicyNote::MinTotalReached { total });
    }

    if diff <= settings.equal_dust_usdt {
        // Re-seeding both books expands or shrinks the pair symmetrically;
        // blocked entirely once the total bound is hit.
        if increase_limit_reached || decrease_limit_reached {
            return decision;
        }
        let Some((side_a, side_b)) =
            equal_sides(cfg, &inputs.pos_a, &inputs.pos_b, &mut decision.notes)
        else {
            return decision;
        };
        let headroom = match cfg.position_mode {
            PositionMode::Increase => (cfg.max_total_position_usdt - total) / Decimal::TWO,
            PositionMode::Decrease => (total - cfg.min_total_position_usdt) / Decimal::TWO,
        };
        let notional = cfg.order_notional_usdt.min(headroom);
        if notional <= Decimal::ZERO {
            return decision;
        }
        if active_after_cancels(inputs, &decision.cancels, AccountLabel::A) < cap {
            decision.places.push(PlaceIntent {
                account: AccountLabel::A,
                side: side_a,
                guard_price: None,
                notional,
            });
        }
        if active_after_cancels(inputs, &decision.cancels, AccountLabel::B) < cap {
            decision.places.push(PlaceIntent {
                account: AccountLabel::B,
                side: side_b,
                guard_price: None,
                notional,
            });
        }
        return decision;
    }

    // Only the account with the smaller absolute position may add exposure.
    let (small, small_pos, large_pos) = if abs_a < abs_b {
        (AccountLabel::A, inputs.pos_a, inputs.pos_b)
    } else {
        (AccountLabel::B, inputs.pos_b, inputs.pos_a)
    };
    let Some((side, guard_price)) =
        hedge_side_guard(inputs.ledger, small, &inputs.pos_a, &inputs.pos_b)
    else {
        return decision;
    };
    let active_small = active_after_cancels(inputs, &decision.cancels, small);
    let hedge_open = inputs.orders.open_hedge_notional(small, side, inputs.now_ms);
    let gap = large_pos.abs_notional - (small_pos.abs_notional + hedge_open / Decimal::TWO);
    if gap <= Decimal::ZERO {
        return decision;
    }
    // Inside the imbalance budget a hedge already in flight is enough.
    if diff <= cfg.imbalance_limit_usdt && hedge_open > Decimal::ZERO && active_small >= cap {
        return decision;
    }
    // Above the low-diff threshold the standard notional takes priority so a
    // second order can be established; otherwise shrink for the last lap.
    let mut notional =
        if diff >= settings.single_order_diff_threshold_usdt && active_small < cap {
            cfg.order_notional_usdt
        } else {
            cfg.order_notional_usdt.min(gap * Decimal::TWO)
        };
    if notional <= Decimal::ZERO {
        return decision;
    }
    let other_abs = total - small_pos.abs_notional;
    let (mode, bound) = match cfg.position_mode {
        PositionMode::Increase => (PositionMode::Increase, cfg.max_total_position_usdt),
        PositionMode::Decrease => (PositionMode::Decrease, cfg.min_total_position_usdt),
    };
    notional = clip_to_total_bound(
        side,
        notional,
        small_pos.signed_notional,
        other_abs,
        mode,
        bound,
    );
    if notional <= Decimal::ZERO {
        return decision;
    }
    if active_small >= cap {
        return decision;
    }
    decision.places.push(PlaceIntent {
        account: small,
        side,
        guard_price,
        notional,
    });
    decision
}

/// Active strategy orders for `account` once the planned cancels land.
fn active_after_cancels(
    inputs: &DecisionInputs<'_>,
    cancels: &[CancelIntent],
    account: AccountLabel,
) -> usize {
    let planned = cancels
        .iter()
        .filter(|c| {
            inputs
                .orders
                .get(c.client_id)
                .map_or(false, |o| o.account == account)
        })
        .count();
    inputs
        .orders
        .active_count(account, inputs.now_ms)
        .saturating_sub(planned)
}

/// Sides for the symmetric re-seed when positions are equal. `None` means
/// nothing to do this tick.
fn equal_sides(
    cfg: &SymbolConfig,
    pos_a: &PositionSnapshot,
    pos_b: &PositionSnapshot,
    notes: &mut Vec<PolicyNote>,
) -> Option<(Side, Side)> {
    match cfg.position_mode {
        PositionMode::Increase => {
            let side_a = cfg.a_side_when_equal;
            Some((side_a, side_a.opposite()))
        }
        PositionMode::Decrease => {
            if pos_a.abs_notional.is_zero() && pos_b.abs_notional.is_zero() {
                return None;
            }
            if pos_a.size > Decimal::ZERO && pos_b.size < Decimal::ZERO {
                return Some((Side::Sell, Side::Buy));
            }
            if pos_a.size < Decimal::ZERO && pos_b.size > Decimal::ZERO {
                return Some((Side::Buy, Side::Sell));
            }
            if !pos_a.size.is_zero()
                && !pos_b.size.is_zero()
                && pos_a.size * pos_b.size > Decimal::ZERO
            {
                notes.push(PolicyNote::DecreaseDirectionMismatch {
                    size_a: pos_a.size,
                    size_b: pos_b.size,
                });
            }
            let side_a = cfg.a_side_when_equal.opposite();
            Some((side_a, side_a.opposite()))
        }
    }
}

/// Direction and guard for the small side: the oldest unmatched lot of the
/// other account dictates both; failing that, mirror the larger position at
/// its entry price.
fn hedge_side_guard(
    ledger: &FillLedger,
    small: AccountLabel,
    pos_a: &PositionSnapshot,
    pos_b: &PositionSnapshot,
) -> Option<(Side, Option<Decimal>)> {
    if let Some(lot) = ledger.oldest_opposing(small) {
        return Some((lot.side.opposite(), Some(lot.guard_price)));
    }
    let larger = if pos_a.abs_notional >= pos_b.abs_notional {
        pos_a
    } else {
        pos_b
    };
    let guard = (larger.entry_price > Decimal::ZERO).then_some(larger.entry_price);
    if larger.size > Decimal::ZERO {
        Some((Side::Sell, guard))
    } else if larger.size < Decimal::ZERO {
        Some((Side::Buy, guard))
    } else {
        None
    }
}

/// Largest order notional, stepped down from the candidate, whose full fill
/// keeps the projected combined absolute position inside the bound.
fn clip_to_total_bound(
    side: Side,
    order_notional: Decimal,
    signed_notional: Decimal,
    other_abs: Decimal,
    mode: PositionMode,
    bound: Decimal,
) -> Decimal {
    if order_notional <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let steps = Decimal::new(50, 0);
    let mut step = order_notional / steps;
    if step <= Decimal::ZERO {
        step = order_notional;
    }
    let mut candidate = order_notional;
    for _ in 0..=50 {
        let delta = match side {
            Side::Buy => candidate,
            Side::Sell => -candidate,
        };
        let projected = other_abs + (signed_notional + delta).abs();
        let inside = match mode {
            PositionMode::Increase => projected <= bound,
            PositionMode::Decrease => projected >= bound,
        };
        if inside {
            return candidate;
        }
        candidate -= step;
        if candidate <= Decimal::ZERO {
            return Decimal::ZERO;
        }
    }
    Decimal::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{order_notional, ManagedOrder, OrderState};
    use rust_decimal_macros::dec;

    fn config(mode: PositionMode) -> SymbolConfig {
        SymbolConfig {
            instrument: "BTC_USDT_Perp".to_string(),
            enabled: true,
            order_notional_usdt: dec!(1000),
            imbalance_limit_usdt: dec!(1000),
            max_total_position_usdt: dec!(20000),
            min_total_position_usdt: Decimal::ZERO,
            a_side_when_equal: Side::Buy,
            position_mode: mode,
        }
    }

    fn long(notional: Decimal, entry: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            size: notional / entry,
            entry_price: entry,
            mark_price: entry,
            signed_notional: notional,
            abs_notional: notional,
        }
    }

    fn short(notional: Decimal, entry: Decimal) -> PositionSnapshot {
        PositionSnapshot {
            size: -(notional / entry),
            entry_price: entry,
            mark_price: entry,
            signed_notional: -notional,
            abs_notional: notional,
        }
    }

    fn resting(
        account: AccountLabel,
        side: Side,
        price: Decimal,
        size: Decimal,
        created: i64,
    ) -> ManagedOrder {
        ManagedOrder {
            client_id: core_types::strategy_client_id(account, side),
            exchange_order_id: format!("0x{created:x}"),
            account,
            instrument: "BTC_USDT_Perp".to_string(),
            side,
            limit_price: price,
            original_size: size,
            traded_size: Decimal::ZERO,
            applied_traded_size: Decimal::ZERO,
            notional_usdt: order_notional(size, price),
            state: OrderState::Open,
            created_ts_ms: created,
            last_seen_ts_ms: created,
            partial_since_ms: None,
            strategy_owned: true,
            guard_price: None,
        }
    }

    fn decide_with(
        cfg: &SymbolConfig,
        pos_a: PositionSnapshot,
        pos_b: PositionSnapshot,
        ledger: &FillLedger,
        orders: &OrderTable,
    ) -> Decision {
        decide(
            &DecisionInputs {
                config: cfg,
                pos_a,
                pos_b,
                ledger,
                orders,
                now_ms: 10_000,
            },
            &PolicySettings::default(),
        )
    }

    #[test]
    fn empty_start_seeds_both_sides() {
        let cfg = config(PositionMode::Increase);
        let decision = decide_with(
            &cfg,
            PositionSnapshot::default(),
            PositionSnapshot::default(),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        assert_eq!(decision.places.len(), 2);
        assert_eq!(decision.places[0].account, AccountLabel::A);
        assert_eq!(decision.places[0].side, Side::Buy);
        assert_eq!(decision.places[0].notional, dec!(1000));
        assert!(decision.places[0].guard_price.is_none());
        assert_eq!(decision.places[1].account, AccountLabel::B);
        assert_eq!(decision.places[1].side, Side::Sell);
    }

    #[test]
    fn decrease_mode_with_flat_books_stays_idle() {
        let cfg = config(PositionMode::Decrease);
        let decision = decide_with(
            &cfg,
            PositionSnapshot::default(),
            PositionSnapshot::default(),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        assert!(decision.places.is_empty());
    }

    #[test]
    fn decrease_mode_unwinds_opposed_inventory() {
        let cfg = config(PositionMode::Decrease);
        let decision = decide_with(
            &cfg,
            long(dec!(2000), dec!(1000)),
            short(dec!(2000), dec!(1000)),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        assert_eq!(decision.places.len(), 2);
        assert_eq!(decision.places[0].side, Side::Sell);
        assert_eq!(decision.places[1].side, Side::Buy);
    }

    #[test]
    fn decrease_mode_flags_same_sign_inventory() {
        let cfg = config(PositionMode::Decrease);
        let decision = decide_with(
            &cfg,
            long(dec!(2000), dec!(1000)),
            long(dec!(2000), dec!(1000)),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        assert!(decision
            .notes
            .iter()
            .any(|n| matches!(n, PolicyNote::DecreaseDirectionMismatch { .. })));
        // Fallback leans against the configured baseline.
        assert_eq!(decision.places[0].side, Side::Sell);
    }

    #[test]
    fn small_side_follows_oldest_opposing_lot() {
        let cfg = config(PositionMode::Increase);
        let mut ledger = FillLedger::new();
        ledger.record_fill(AccountLabel::A, Side::Buy, dec!(1002), dec!(1000), 1, false);
        let decision = decide_with(
            &cfg,
            long(dec!(1000), dec!(1002)),
            PositionSnapshot::default(),
            &ledger,
            &OrderTable::new(),
        );
        assert_eq!(decision.places.len(), 1);
        let place = &decision.places[0];
        assert_eq!(place.account, AccountLabel::B);
        assert_eq!(place.side, Side::Sell);
        assert_eq!(place.guard_price, Some(dec!(1002)));
    }

    #[test]
    fn fallback_mirrors_large_side_entry_price() {
        let cfg = config(PositionMode::Increase);
        let decision = decide_with(
            &cfg,
            long(dec!(1500), dec!(1000)),
            PositionSnapshot::default(),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        assert_eq!(decision.places.len(), 1);
        let place = &decision.places[0];
        assert_eq!(place.account, AccountLabel::B);
        assert_eq!(place.side, Side::Sell);
        assert_eq!(place.guard_price, Some(dec!(1000)));
        assert_eq!(place.notional, dec!(1000));
    }

    #[test]
    fn in_flight_hedge_halves_into_the_gap() {
        let cfg = config(PositionMode::Increase);
        let mut orders = OrderTable::new();
        // 1000 notional already resting on B's sell side.
        orders.insert_placed(resting(AccountLabel::B, Side::Sell, dec!(1000), dec!(1), 5_000));
        let decision = decide_with(
            &cfg,
            long(dec!(1400), dec!(1000)),
            PositionSnapshot::default(),
            &FillLedger::new(),
            &orders,
        );
        // gap = 1400 - 1000/2 = 900 > 0, but diff > threshold with one
        // active order of cap two: full notional still goes out.
        assert_eq!(decision.places.len(), 1);
        assert_eq!(decision.places[0].notional, dec!(1000));
    }

    #[test]
    fn covered_gap_places_nothing() {
        let cfg = config(PositionMode::Increase);
        let mut orders = OrderTable::new();
        orders.insert_placed(resting(AccountLabel::B, Side::Sell, dec!(1000), dec!(2), 5_000));
        orders.insert_placed(resting(AccountLabel::B, Side::Sell, dec!(1000), dec!(1), 6_000));
        let decision = decide_with(
            &cfg,
            long(dec!(1400), dec!(1000)),
            PositionSnapshot::default(),
            &FillLedger::new(),
            &orders,
        );
        // gap = 1400 - 3000/2 <= 0
        assert!(decision.places.is_empty());
    }

    #[test]
    fn low_diff_tightens_cap_and_cancels_oldest() {
        let cfg = config(PositionMode::Increase);
        let mut orders = OrderTable::new();
        let old = resting(AccountLabel::B, Side::Sell, dec!(1000), dec!(0.005), 1_000);
        let old_id = old.client_id;
        let newer = resting(AccountLabel::B, Side::Sell, dec!(1000), dec!(0.005), 2_000);
        orders.insert_placed(old);
        orders.insert_placed(newer);
        let decision = decide_with(
            &cfg,
            long(dec!(500), dec!(1000)),
            long(dec!(485), dec!(1000)),
            &FillLedger::new(),
            &orders,
        );
        assert_eq!(decision.cancels.len(), 1);
        assert_eq!(decision.cancels[0].client_id, old_id);
        assert_eq!(decision.cancels[0].reason, "account_order_cap");
        // After the cancel B sits at the tightened cap; nothing placed.
        assert!(decision.places.is_empty());
    }

    #[test]
    fn diff_exactly_at_threshold_keeps_cap_of_two() {
        let cfg = config(PositionMode::Increase);
        let mut orders = OrderTable::new();
        orders.insert_placed(resting(AccountLabel::B, Side::Sell, dec!(1000), dec!(0.005), 1_000));
        orders.insert_placed(resting(AccountLabel::B, Side::Sell, dec!(1000), dec!(0.005), 2_000));
        let decision = decide_with(
            &cfg,
            long(dec!(505), dec!(1000)),
            long(dec!(485), dec!(1000)),
            &FillLedger::new(),
            &orders,
        );
        assert!(decision.cancels.is_empty());
    }

    #[test]
    fn last_lap_shrinks_to_twice_the_gap() {
        let cfg = config(PositionMode::Increase);
        let decision = decide_with(
            &cfg,
            long(dec!(495), dec!(1000)),
            long(dec!(485), dec!(1000)),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        // diff = 10 < threshold, gap = 10: shrink to 2 * gap = 20.
        assert_eq!(decision.places.len(), 1);
        assert_eq!(decision.places[0].account, AccountLabel::B);
        assert_eq!(decision.places[0].notional, dec!(20));
    }

    #[test]
    fn imbalance_budget_suppresses_when_hedge_in_flight() {
        let mut cfg = config(PositionMode::Increase);
        cfg.imbalance_limit_usdt = dec!(1000);
        let mut orders = OrderTable::new();
        orders.insert_placed(resting(AccountLabel::B, Side::Sell, dec!(1000), dec!(0.0004), 5_000));
        let decision = decide_with(
            &cfg,
            long(dec!(500), dec!(1000)),
            long(dec!(485), dec!(1000)),
            &FillLedger::new(),
            &orders,
        );
        // diff 15 <= limit, hedge open, small side at its (tightened) cap.
        assert!(decision.places.is_empty());
    }

    #[test]
    fn increase_bound_clips_projected_total() {
        let mut cfg = config(PositionMode::Increase);
        cfg.max_total_position_usdt = dec!(2500);
        let decision = decide_with(
            &cfg,
            long(dec!(2000), dec!(1000)),
            PositionSnapshot::default(),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        // B mirrors A with a sell; a full fill must keep 2000 + x <= 2500.
        assert_eq!(decision.places.len(), 1);
        assert_eq!(decision.places[0].account, AccountLabel::B);
        assert_eq!(decision.places[0].side, Side::Sell);
        assert_eq!(decision.places[0].notional, dec!(500));
    }

    #[test]
    fn increase_at_limit_blocks_equal_seeding_and_notes() {
        let mut cfg = config(PositionMode::Increase);
        cfg.max_total_position_usdt = dec!(4000);
        let decision = decide_with(
            &cfg,
            long(dec!(2000), dec!(1000)),
            short(dec!(2000), dec!(1000)),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        assert!(decision.places.is_empty());
        assert!(decision
            .notes
            .iter()
            .any(|n| matches!(n, PolicyNote::MaxTotalReached { .. })));
    }

    #[test]
    fn decrease_bound_respects_min_total() {
        let mut cfg = config(PositionMode::Decrease);
        cfg.min_total_position_usdt = dec!(3900);
        let decision = decide_with(
            &cfg,
            short(dec!(2500), dec!(1000)),
            short(dec!(1500), dec!(1000)),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        // Small side B buys back at most 100 before the total dips below 3900.
        assert_eq!(decision.places.len(), 1);
        assert_eq!(decision.places[0].account, AccountLabel::B);
        assert_eq!(decision.places[0].side, Side::Buy);
        assert_eq!(decision.places[0].notional, dec!(100));
    }

    #[test]
    fn equal_seed_clips_to_shared_headroom() {
        let mut cfg = config(PositionMode::Increase);
        cfg.max_total_position_usdt = dec!(1000);
        let decision = decide_with(
            &cfg,
            PositionSnapshot::default(),
            PositionSnapshot::default(),
            &FillLedger::new(),
            &OrderTable::new(),
        );
        assert_eq!(decision.places.len(), 2);
        for place in &decision.places {
            assert_eq!(place.notional, dec!(500));
        }
    }

    #[test]
    fn maker_price_rounds_conservatively() {
        let book = BookTop {
            bid1: dec!(1002.0),
            ask1: dec!(1001.1),
            ts_ms: 1,
        };
        let tick = dec!(0.1);
        // Guard dominates the ask: sell quotes at the guard.
        assert_eq!(
            maker_price(Side::Sell, &book, Some(dec!(1002.0)), tick),
            dec!(1002.0)
        );
        // No guard: straight top of book.
        assert_eq!(maker_price(Side::Sell, &book, None, tick), dec!(1001.1));
        assert_eq!(maker_price(Side::Buy, &book, None, tick), dec!(1002.0));
        // Guard below the bid caps the buy.
        assert_eq!(
            maker_price(Side::Buy, &book, Some(dec!(1000.05)), tick),
            dec!(1000.0)
        );
    }
}
