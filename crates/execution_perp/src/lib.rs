use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use core_types::{
    canonical_instrument, is_placeholder_order_id, order_notional, strategy_client_id,
    AccountLabel, AccountSummary, BookTop, ExchangeSession, GatewayError, InstrumentInfo,
    ManagedOrder, OrderRequest, OrderState, OrderView, PositionSnapshot, SessionError, Side,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;

mod paper;
mod rest;

pub use paper::PaperExchange;
pub use rest::{RestSession, RestSessionConfig};

const ALREADY_GONE_MARKERS: [&str; 5] = [
    "not found",
    "does not exist",
    "already closed",
    "already canceled",
    "already cancelled",
];

const POST_ONLY_MARKERS: [&str; 4] = ["post", "maker", "would match", "taker"];

/// Typed facade over one account's exchange session. Classifies raw errors,
/// renews the session once on authentication failures, bounds every call and
/// stamps placements with strategy client ids.
pub struct AccountGateway {
    label: AccountLabel,
    session: Arc<dyn ExchangeSession>,
    orderbook_depth: u32,
    call_timeout: Duration,
    instruments: RwLock<HashMap<String, InstrumentInfo>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl AccountGateway {
    pub fn new(
        label: AccountLabel,
        session: Arc<dyn ExchangeSession>,
        orderbook_depth: u32,
        call_timeout: Duration,
    ) -> Self {
        Self {
            label,
            session,
            orderbook_depth,
            call_timeout,
            instruments: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    pub fn label(&self) -> AccountLabel {
        self.label
    }

    async fn call<T, F, Fut>(&self, op: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        match tokio::time::timeout(self.call_timeout, op()).await {
            Err(_) => Err(GatewayError::Transient("exchange call timed out".to_string())),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_auth() => {
                tracing::warn!(account = %self.label, err = %err, "session auth failure, renewing");
                if let Err(renew_err) = self.session.renew().await {
                    return Err(GatewayError::Auth(renew_err.message()));
                }
                match tokio::time::timeout(self.call_timeout, op()).await {
                    Err(_) => Err(GatewayError::Transient("exchange call timed out".to_string())),
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) if err.is_auth() => Err(GatewayError::Auth(err.message())),
                    Ok(Err(err)) => Err(classify(err)),
                }
            }
            Ok(Err(err)) => Err(classify(err)),
        }
    }

    /// Place a post-only good-till-time limit order and return the managed
    /// record tracking it. The guard price that motivated the order travels
    /// with the record for reconciliation.
    pub async fn place_post_only(
        &self,
        instrument: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        guard_price: Option<Decimal>,
        now_ms: i64,
    ) -> Result<ManagedOrder, GatewayError> {
        let request = OrderRequest {
            instrument: instrument.to_string(),
            side,
            limit_price: price,
            size,
            client_id: strategy_client_id(self.label, side),
        };
        let view = self.call(|| self.session.create_order(&request)).await?;
        let state = if is_placeholder_order_id(&view.order_id) {
            OrderState::Pending
        } else {
            OrderState::Open
        };
        Ok(ManagedOrder {
            client_id: request.client_id,
            exchange_order_id: view.order_id,
            account: self.label,
            instrument: instrument.to_string(),
            side,
            limit_price: price,
            original_size: size,
            traded_size: Decimal::ZERO,
            applied_traded_size: Decimal::ZERO,
            notional_usdt: order_notional(size, price),
            state,
            created_ts_ms: now_ms,
            last_seen_ts_ms: 0,
            partial_since_ms: None,
            strategy_owned: true,
            guard_price,
        })
    }

    /// Cancel by exchange order id. Placeholder ids have nothing to cancel;
    /// responses meaning the order is already gone count as success.
    pub async fn cancel(&self, order_id: &str) -> Result<(), GatewayError> {
        if is_placeholder_order_id(order_id) {
            return Ok(());
        }
        match self.call(|| self.session.cancel_order(order_id)).await {
            Ok(()) => Ok(()),
            Err(GatewayError::Permanent(msg)) if is_already_gone(&msg) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Fetch one order; a definitive not-found comes back as `None`.
    pub async fn get_order(&self, order_id: &str) -> Result<Option<OrderView>, GatewayError> {
        match self.call(|| self.session.get_order(order_id)).await {
            Ok(view) => Ok(Some(view)),
            Err(GatewayError::Permanent(msg)) if is_already_gone(&msg) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn open_orders_by_instrument(
        &self,
    ) -> Result<HashMap<String, Vec<OrderView>>, GatewayError> {
        let orders = self.call(|| self.session.open_orders()).await?;
        let mut grouped: HashMap<String, Vec<OrderView>> = HashMap::new();
        for order in orders {
            grouped.entry(order.instrument.clone()).or_default().push(order);
        }
        Ok(grouped)
    }

    pub async fn positions(&self) -> Result<HashMap<String, PositionSnapshot>, GatewayError> {
        let views = self.call(|| self.session.positions()).await?;
        Ok(views
            .iter()
            .map(|v| (v.instrument.clone(), PositionSnapshot::from(v)))
            .collect())
    }

    pub async fn account_summary(&self) -> Result<AccountSummary, GatewayError> {
        self.call(|| self.session.account_summary()).await
    }

    /// Top of book; an empty or crossed-out book surfaces as transient so the
    /// tick proceeds with stale state.
    pub async fn book_top(&self, instrument: &str) -> Result<BookTop, GatewayError> {
        let book = self
            .call(|| self.session.orderbook_top(instrument, self.orderbook_depth))
            .await?;
        if book.bid1 <= Decimal::ZERO || book.ask1 <= Decimal::ZERO {
            return Err(GatewayError::Transient(format!(
                "empty orderbook for {instrument}"
            )));
        }
        Ok(book)
    }

    /// Instrument metadata, cached for the gateway lifetime.
    pub async fn instrument_info(&self, instrument: &str) -> Result<InstrumentInfo, GatewayError> {
        if let Some(info) = self.instruments.read().get(instrument) {
            return Ok(info.clone());
        }
        let info = self.call(|| self.session.instrument(instrument)).await?;
        self.instruments
            .write()
            .insert(instrument.to_string(), info.clone());
        Ok(info)
    }

    /// Preload active instrument names for symbol canonicalisation. Returns
    /// the number of distinct instruments loaded.
    pub async fn preload_instruments(&self) -> Result<usize, GatewayError> {
        let names = self.call(|| self.session.active_instruments()).await?;
        let mut aliases = self.aliases.write();
        for name in &names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            aliases.insert(name.to_string(), name.to_string());
            aliases.insert(name.to_ascii_uppercase(), name.to_string());
            aliases.insert(name.to_ascii_lowercase(), name.to_string());
        }
        Ok(names.len())
    }

    /// Resolve a configured instrument spelling against the alias map. With
    /// no preloaded aliases the canonical spelling is trusted as-is.
    pub fn resolve_instrument(&self, raw: &str) -> Option<String> {
        let canonical = canonical_instrument(raw);
        if canonical.is_empty() {
            return None;
        }
        let aliases = self.aliases.read();
        if aliases.is_empty() {
            return Some(canonical);
        }
        aliases
            .get(&canonical)
            .or_else(|| aliases.get(&canonical.to_ascii_uppercase()))
            .or_else(|| aliases.get(&canonical.to_ascii_lowercase()))
            .cloned()
    }

    /// Near-miss suggestions for an unknown instrument, base token first.
    pub fn suggest_instruments(&self, raw: &str, limit: usize) -> Vec<String> {
        let aliases = self.aliases.read();
        if aliases.is_empty() {
            return Vec::new();
        }
        let mut canonical: Vec<String> = aliases.values().cloned().collect();
        canonical.sort();
        canonical.dedup();
        let token = raw
            .trim()
            .split('_')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        if token.is_empty() {
            canonical.truncate(limit);
            return canonical;
        }
        let prefix = format!("{token}_");
        let mut suggestions: Vec<String> = canonical
            .iter()
            .filter(|name| name.to_ascii_uppercase().starts_with(&prefix))
            .cloned()
            .collect();
        for name in &canonical {
            if suggestions.len() >= limit {
                break;
            }
            if name.to_ascii_uppercase().contains(&token) && !suggestions.contains(name) {
                suggestions.push(name.clone());
            }
        }
        suggestions.truncate(limit);
        suggestions
    }
}

fn is_already_gone(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ALREADY_GONE_MARKERS.iter().any(|m| lower.contains(m))
}

fn classify(err: SessionError) -> GatewayError {
    match err {
        SessionError::Transport(msg) => GatewayError::Transient(msg),
        SessionError::Api {
            status,
            code,
            message,
        } => {
            let lower = message.to_ascii_lowercase();
            let err = SessionError::Api {
                status,
                code,
                message: message.clone(),
            };
            if err.is_auth() {
                GatewayError::Auth(message)
            } else if status == Some(429)
                || lower.contains("rate limit")
                || lower.contains("too many requests")
            {
                GatewayError::RateLimited(message)
            } else if POST_ONLY_MARKERS.iter().any(|m| lower.contains(m)) {
                GatewayError::PostOnlyRejected
            } else if lower.contains("below minimum") || lower.contains("min size") {
                GatewayError::InsufficientSize
            } else if status.map_or(true, |s| s >= 500) {
                GatewayError::Transient(message)
            } else {
                GatewayError::Permanent(message)
            }
        }
    }
}
