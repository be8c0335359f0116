use std::collections::{HashMap, HashSet};

use core_types::{AccountSummary, OrderView, PositionSnapshot, SymbolConfig};
use fill_ledger::FillLedger;
use order_tracker::OrderTable;
use rust_decimal::Decimal;
use serde::Serialize;

/// All per-instrument mutable state; owned exclusively by the engine loop.
#[derive(Debug)]
pub struct SymbolState {
    pub config: SymbolConfig,
    pub ledger: FillLedger,
    pub orders: OrderTable,
    pub cooldown_until_ms: i64,
    pub foreign_orders: HashSet<String>,
}

impl SymbolState {
    pub fn new(config: SymbolConfig) -> Self {
        Self {
            config,
            ledger: FillLedger::new(),
            orders: OrderTable::new(),
            cooldown_until_ms: 0,
            foreign_orders: HashSet::new(),
        }
    }
}

/// One account's per-tick exchange view. Query failures leave the affected
/// section empty so the tick proceeds with stale state.
#[derive(Default)]
pub struct AccountSnapshot {
    pub positions: HashMap<String, PositionSnapshot>,
    pub open_orders: HashMap<String, Vec<OrderView>>,
    pub summary: Option<AccountSummary>,
}

impl AccountSnapshot {
    pub fn position(&self, instrument: &str) -> PositionSnapshot {
        self.positions.get(instrument).copied().unwrap_or_default()
    }
}

/// Read-only engine snapshot published for the status surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub ts_ms: i64,
    pub symbols: Vec<SymbolStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolStatus {
    pub instrument: String,
    pub enabled: bool,
    pub abs_a: Decimal,
    pub abs_b: Decimal,
    pub unmatched_lots: usize,
    pub unmatched_notional: Decimal,
    pub active_orders_a: usize,
    pub active_orders_b: usize,
    pub cooldown_until_ms: i64,
    pub foreign_orders: usize,
}
