use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// High-bit namespace tagging strategy-owned client order ids.
pub const STRATEGY_ID_PREFIX: u64 = 0xE000_0000_0000_0000;
pub const STRATEGY_ID_MASK: u64 = 0xF000_0000_0000_0000;
const STRATEGY_ENTROPY_MASK: u64 = (1 << 58) - 1;

/// Notionals are quantised to micro-USDT throughout.
pub const NOTIONAL_DECIMALS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountLabel {
    A,
    B,
}

impl AccountLabel {
    pub fn other(self) -> AccountLabel {
        match self {
            AccountLabel::A => AccountLabel::B,
            AccountLabel::B => AccountLabel::A,
        }
    }

    pub fn both() -> [AccountLabel; 2] {
        [AccountLabel::A, AccountLabel::B]
    }
}

impl fmt::Display for AccountLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccountLabel::A => "A",
            AccountLabel::B => "B",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionMode {
    Increase,
    Decrease,
}

/// Per-instrument hedge configuration, one entry of the symbols file.
/// Unknown fields are ignored on load; invalid values are fatal at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub instrument: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_order_notional")]
    pub order_notional_usdt: Decimal,
    #[serde(default = "default_order_notional")]
    pub imbalance_limit_usdt: Decimal,
    #[serde(default = "default_max_total")]
    pub max_total_position_usdt: Decimal,
    #[serde(default)]
    pub min_total_position_usdt: Decimal,
    #[serde(default = "default_buy")]
    pub a_side_when_equal: Side,
    #[serde(default = "default_increase")]
    pub position_mode: PositionMode,
}

fn default_true() -> bool {
    true
}

fn default_order_notional() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_max_total() -> Decimal {
    Decimal::new(20_000, 0)
}

fn default_buy() -> Side {
    Side::Buy
}

fn default_increase() -> PositionMode {
    PositionMode::Increase
}

impl SymbolConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.instrument.trim().is_empty() {
            return Err("symbol config missing instrument".to_string());
        }
        if self.order_notional_usdt <= Decimal::ZERO {
            return Err(format!(
                "{} invalid order_notional_usdt: {}",
                self.instrument, self.order_notional_usdt
            ));
        }
        if self.max_total_position_usdt < Decimal::ZERO {
            return Err(format!(
                "{} invalid max_total_position_usdt: {}",
                self.instrument, self.max_total_position_usdt
            ));
        }
        if self.min_total_position_usdt < Decimal::ZERO {
            return Err(format!(
                "{} invalid min_total_position_usdt: {}",
                self.instrument, self.min_total_position_usdt
            ));
        }
        if self.min_total_position_usdt > self.max_total_position_usdt {
            return Err(format!(
                "{} min_total_position_usdt > max_total_position_usdt: {} > {}",
                self.instrument, self.min_total_position_usdt, self.max_total_position_usdt
            ));
        }
        Ok(())
    }
}

/// One atomic fill awaiting its cross-account hedge. The guard price is the
/// protected execution bound: a hedge sell must run at or above the guard of
/// the buy lot it closes, a hedge buy at or below the guard of the sell lot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FillLot {
    pub account: AccountLabel,
    pub side: Side,
    pub guard_price: Decimal,
    pub remaining_notional: Decimal,
    pub created_ts_ms: i64,
    pub synthetic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Open,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

const ADOPTED_STALE_MS: i64 = 3_600_000;
const NEVER_SEEN_STALE_MS: i64 = 600_000;

/// A strategy-managed resting order. `applied_traded_size` tracks how much of
/// `traded_size` has already been converted into fill lots.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedOrder {
    pub client_id: u64,
    pub exchange_order_id: String,
    pub account: AccountLabel,
    pub instrument: String,
    pub side: Side,
    pub limit_price: Decimal,
    pub original_size: Decimal,
    pub traded_size: Decimal,
    pub applied_traded_size: Decimal,
    pub notional_usdt: Decimal,
    pub state: OrderState,
    pub created_ts_ms: i64,
    pub last_seen_ts_ms: i64,
    pub partial_since_ms: Option<i64>,
    pub strategy_owned: bool,
    pub guard_price: Option<Decimal>,
}

impl ManagedOrder {
    pub fn remaining_size(&self) -> Decimal {
        (self.original_size - self.traded_size).max(Decimal::ZERO)
    }

    /// Whether the order still counts towards activity caps. Orders unseen in
    /// snapshots for too long stop counting so a wedged exchange view cannot
    /// freeze placement forever.
    pub fn is_active(&self, now_ms: i64) -> bool {
        if !self.strategy_owned || self.state.is_terminal() {
            return false;
        }
        if self.last_seen_ts_ms > 0 {
            now_ms - self.last_seen_ts_ms <= ADOPTED_STALE_MS
        } else {
            now_ms - self.created_ts_ms <= NEVER_SEEN_STALE_MS
        }
    }
}

/// A post-only limit placement, good-till-time. Every request carries a
/// locally assigned numeric client id.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: Side,
    pub limit_price: Decimal,
    pub size: Decimal,
    pub client_id: u64,
}

/// The exchange's view of one order, as returned by session queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: String,
    pub client_id: Option<u64>,
    pub instrument: String,
    pub side: Side,
    pub limit_price: Decimal,
    pub size: Decimal,
    pub traded_size: Decimal,
    pub book_size: Decimal,
    pub state: OrderState,
    pub create_ts_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionView {
    pub instrument: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
}

/// Position digested for decision making, notional-denominated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub signed_notional: Decimal,
    pub abs_notional: Decimal,
}

impl From<&PositionView> for PositionSnapshot {
    fn from(view: &PositionView) -> Self {
        let mark = if view.mark_price > Decimal::ZERO {
            view.mark_price
        } else {
            view.entry_price
        };
        let signed = view.size * mark;
        PositionSnapshot {
            size: view.size,
            entry_price: view.entry_price,
            mark_price: mark,
            signed_notional: signed,
            abs_notional: signed.abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountSummary {
    pub equity: Decimal,
    pub maintenance_margin: Decimal,
    pub available_balance: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookTop {
    pub bid1: Decimal,
    pub ask1: Decimal,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentInfo {
    pub instrument: String,
    pub tick_size: Decimal,
    pub min_size: Decimal,
    pub base_decimals: u32,
}

/// Raw error surfaced by the external exchange client.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("exchange api error status={status:?} code={code:?} msg={message}")]
    Api {
        status: Option<u16>,
        code: Option<i64>,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn is_auth(&self) -> bool {
        match self {
            SessionError::Api {
                status,
                code,
                message,
            } => {
                *status == Some(401)
                    || *code == Some(1000)
                    || message.to_ascii_lowercase().contains("authenticate")
                    || message.to_ascii_lowercase().contains("unauthorized")
            }
            SessionError::Transport(_) => false,
        }
    }

    pub fn message(&self) -> String {
        match self {
            SessionError::Api { message, .. } => message.clone(),
            SessionError::Transport(msg) => msg.clone(),
        }
    }
}

/// Classified gateway errors; one recovery policy per kind.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("post-only order would cross the book")]
    PostOnlyRejected,
    #[error("order size below instrument minimum")]
    InsufficientSize,
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("permanent exchange error: {0}")]
    Permanent(String),
}

/// The out-of-scope raw exchange client: signing, transport and session
/// refresh live behind this seam. Implementations must be internally
/// synchronised; `renew` rebuilds authentication in place.
#[async_trait]
pub trait ExchangeSession: Send + Sync {
    async fn renew(&self) -> std::result::Result<(), SessionError>;
    async fn create_order(
        &self,
        req: &OrderRequest,
    ) -> std::result::Result<OrderView, SessionError>;
    async fn cancel_order(&self, order_id: &str) -> std::result::Result<(), SessionError>;
    async fn get_order(&self, order_id: &str) -> std::result::Result<OrderView, SessionError>;
    async fn open_orders(&self) -> std::result::Result<Vec<OrderView>, SessionError>;
    async fn positions(&self) -> std::result::Result<Vec<PositionView>, SessionError>;
    async fn account_summary(&self) -> std::result::Result<AccountSummary, SessionError>;
    async fn orderbook_top(
        &self,
        instrument: &str,
        depth: u32,
    ) -> std::result::Result<BookTop, SessionError>;
    async fn instrument(
        &self,
        instrument: &str,
    ) -> std::result::Result<InstrumentInfo, SessionError>;
    async fn active_instruments(&self) -> std::result::Result<Vec<String>, SessionError>;
}

/// Outbound alert transport. Failures are the caller's to log; the engine
/// never retries a push within the same tick.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn push(&self, message: &str) -> Result<()>;
}

pub fn strategy_client_id(account: AccountLabel, side: Side) -> u64 {
    let acc_bit: u64 = match account {
        AccountLabel::A => 0,
        AccountLabel::B => 1,
    };
    let side_bit: u64 = match side {
        Side::Buy => 0,
        Side::Sell => 1,
    };
    let entropy = rand::random::<u64>() & STRATEGY_ENTROPY_MASK;
    STRATEGY_ID_PREFIX | (acc_bit << 59) | (side_bit << 58) | entropy
}

pub fn is_strategy_client_id(client_id: u64) -> bool {
    client_id & STRATEGY_ID_MASK == STRATEGY_ID_PREFIX
}

/// Sentinel ids some venues return before the real order id is assigned.
pub fn is_placeholder_order_id(order_id: &str) -> bool {
    let oid = order_id.trim().to_ascii_lowercase();
    matches!(oid.as_str(), "" | "0" | "0x0" | "0x00") || oid.starts_with("0x00")
}

/// Canonical instrument spelling: a trailing `_PERP` (any case) becomes `_Perp`.
pub fn canonical_instrument(raw: &str) -> String {
    let name = raw.trim();
    if name.len() > 5 && name.to_ascii_uppercase().ends_with("_PERP") {
        format!("{}_Perp", &name[..name.len() - 5])
    } else {
        name.to_string()
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Round a buy price down to the instrument tick.
pub fn floor_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    ((price / tick).floor() * tick).round_dp(tick.scale())
}

/// Round a sell price up to the instrument tick.
pub fn ceil_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    ((price / tick).ceil() * tick).round_dp(tick.scale())
}

/// Convert a quote notional into base size, floored to the instrument's size
/// step and base decimals. Callers reject results below `min_size`.
pub fn size_from_notional(notional: Decimal, price: Decimal, info: &InstrumentInfo) -> Decimal {
    if price <= Decimal::ZERO || notional <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let quantum = Decimal::new(1, info.base_decimals);
    let step = if info.min_size > quantum {
        info.min_size
    } else {
        quantum
    };
    let raw = notional / price;
    let size = (raw / step).floor() * step;
    size.round_dp_with_strategy(info.base_decimals, RoundingStrategy::ToZero)
}

pub fn order_notional(size: Decimal, price: Decimal) -> Decimal {
    (size * price).round_dp_with_strategy(NOTIONAL_DECIMALS, RoundingStrategy::ToZero)
}
