use std::collections::VecDeque;

use core_types::{AccountLabel, FillLot, Side};
use rust_decimal::Decimal;
use serde::Serialize;

/// A consummated cross-account pairing. The sell guard never undercuts the
/// buy guard, so the pair is at worst break-even per fill.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotMatch {
    pub buy_account: AccountLabel,
    pub sell_account: AccountLabel,
    pub buy_guard: Decimal,
    pub sell_guard: Decimal,
    pub notional: Decimal,
}

/// Four FIFO queues of unmatched fill lots keyed by (account, side).
///
/// Lots are appended as managed orders trade and consumed by the matcher,
/// which pairs lots across accounts on opposite sides subject to the price
/// protection inequality. Unmatched remainders keep their queue position.
#[derive(Debug, Default)]
pub struct FillLedger {
    queues: [VecDeque<FillLot>; 4],
}

fn slot(account: AccountLabel, side: Side) -> usize {
    match (account, side) {
        (AccountLabel::A, Side::Buy) => 0,
        (AccountLabel::A, Side::Sell) => 1,
        (AccountLabel::B, Side::Buy) => 2,
        (AccountLabel::B, Side::Sell) => 3,
    }
}

fn admissible(buy: &FillLot, sell: &FillLot) -> bool {
    sell.guard_price >= buy.guard_price
}

impl FillLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fill and run the matcher. Zero or negative notionals are
    /// dropped.
    pub fn record_fill(
        &mut self,
        account: AccountLabel,
        side: Side,
        guard_price: Decimal,
        notional: Decimal,
        ts_ms: i64,
        synthetic: bool,
    ) -> Vec<LotMatch> {
        if notional <= Decimal::ZERO || guard_price <= Decimal::ZERO {
            return Vec::new();
        }
        self.queues[slot(account, side)].push_back(FillLot {
            account,
            side,
            guard_price,
            remaining_notional: notional,
            created_ts_ms: ts_ms,
            synthetic,
        });
        self.match_lots()
    }

    /// Pair lots until no admissible pair remains. The oldest lot with any
    /// admissible partner is matched first; among partners the oldest wins,
    /// and on equal age the one leaving more protection margin.
    pub fn match_lots(&mut self) -> Vec<LotMatch> {
        let mut matches = Vec::new();
        while let Some(((bs, bi), (ss, si))) = self.find_pair() {
            let qty = self.queues[bs][bi]
                .remaining_notional
                .min(self.queues[ss][si].remaining_notional);
            let buy = &self.queues[bs][bi];
            let sell = &self.queues[ss][si];
            let m = LotMatch {
                buy_account: buy.account,
                sell_account: sell.account,
                buy_guard: buy.guard_price,
                sell_guard: sell.guard_price,
                notional: qty,
            };
            tracing::debug!(
                buy_account = %m.buy_account,
                sell_account = %m.sell_account,
                buy_guard = %m.buy_guard,
                sell_guard = %m.sell_guard,
                notional = %m.notional,
                "matched hedge lots"
            );
            matches.push(m);
            self.queues[bs][bi].remaining_notional -= qty;
            self.queues[ss][si].remaining_notional -= qty;
            if self.queues[bs][bi].remaining_notional <= Decimal::ZERO {
                self.queues[bs].remove(bi);
            }
            if self.queues[ss][si].remaining_notional <= Decimal::ZERO {
                self.queues[ss].remove(si);
            }
        }
        matches
    }

    /// Locate the next pair to match: ((buy slot, idx), (sell slot, idx)).
    fn find_pair(&self) -> Option<((usize, usize), (usize, usize))> {
        // Opposing queue combos: a buy in one account against a sell in the
        // other. Same-account lots never pair.
        let combos = [
            (slot(AccountLabel::A, Side::Buy), slot(AccountLabel::B, Side::Sell)),
            (slot(AccountLabel::B, Side::Buy), slot(AccountLabel::A, Side::Sell)),
        ];
        let mut best: Option<(i64, (usize, usize), (usize, usize))> = None;
        for (buy_slot, sell_slot) in combos {
            for (bi, buy) in self.queues[buy_slot].iter().enumerate() {
                let partner = self.queues[sell_slot]
                    .iter()
                    .enumerate()
                    .filter(|(_, sell)| admissible(buy, sell))
                    .min_by(|(_, x), (_, y)| {
                        x.created_ts_ms
                            .cmp(&y.created_ts_ms)
                            .then(y.guard_price.cmp(&x.guard_price))
                    });
                let Some((si, sell)) = partner else {
                    continue;
                };
                let age = buy.created_ts_ms.min(sell.created_ts_ms);
                if best.map_or(true, |(b, _, _)| age < b) {
                    best = Some((age, (buy_slot, bi), (sell_slot, si)));
                }
            }
        }
        best.map(|(_, b, s)| (b, s))
    }

    /// The oldest unmatched lot held by the *other* account; the next hedge
    /// on `account` should take its opposite side at its guard price.
    pub fn oldest_opposing(&self, account: AccountLabel) -> Option<&FillLot> {
        let other = account.other();
        [Side::Buy, Side::Sell]
            .into_iter()
            .filter_map(|side| self.queues[slot(other, side)].front())
            .min_by_key(|lot| lot.created_ts_ms)
    }

    pub fn earliest_unmatched_ts(&self) -> Option<i64> {
        self.lots().map(|lot| lot.created_ts_ms).min()
    }

    pub fn lots(&self) -> impl Iterator<Item = &FillLot> {
        self.queues.iter().flatten()
    }

    pub fn has_lots_for(&self, account: AccountLabel) -> bool {
        self.lots().any(|lot| lot.account == account)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn unmatched_notional(&self) -> Decimal {
        self.lots().map(|lot| lot.remaining_notional).sum()
    }
}
