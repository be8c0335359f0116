use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use core_types::{
    is_strategy_client_id, now_ms, size_from_notional, AccountLabel, GatewayError, OrderState,
    OrderView,
};
use execution_perp::AccountGateway;
use futures::FutureExt;
use hedge_policy::{decide, maker_price, DecisionInputs, PlaceIntent, PolicyNote, PolicySettings};
use order_tracker::TrackerEvent;
use parking_lot::RwLock;
use risk_alerts::AlertCenter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Notify;

use crate::settings::HedgeSettings;
use crate::state::{AccountSnapshot, EngineStatus, SymbolState, SymbolStatus};

const RETRY_PAUSE: Duration = Duration::from_millis(200);

/// Shared, read-only engine wiring.
pub struct EngineCtx {
    pub gateway_a: Arc<AccountGateway>,
    pub gateway_b: Arc<AccountGateway>,
    pub alerts: Arc<AlertCenter>,
    pub settings: HedgeSettings,
    pub policy: PolicySettings,
}

impl EngineCtx {
    pub fn gateway(&self, label: AccountLabel) -> &AccountGateway {
        match label {
            AccountLabel::A => &self.gateway_a,
            AccountLabel::B => &self.gateway_b,
        }
    }
}

pub struct Snapshots {
    pub a: AccountSnapshot,
    pub b: AccountSnapshot,
}

impl Snapshots {
    pub fn get(&self, label: AccountLabel) -> &AccountSnapshot {
        match label {
            AccountLabel::A => &self.a,
            AccountLabel::B => &self.b,
        }
    }
}

/// The single cooperative control loop driving both accounts.
pub struct HedgeEngine {
    ctx: Arc<EngineCtx>,
    symbols: BTreeMap<String, SymbolState>,
    status: Arc<RwLock<EngineStatus>>,
    started_at_ms: i64,
}

impl HedgeEngine {
    pub fn new(ctx: Arc<EngineCtx>, symbols: BTreeMap<String, SymbolState>) -> Self {
        Self {
            ctx,
            symbols,
            status: Arc::new(RwLock::new(EngineStatus::default())),
            started_at_ms: now_ms(),
        }
    }

    pub fn status_handle(&self) -> Arc<RwLock<EngineStatus>> {
        self.status.clone()
    }

    pub fn symbol(&self, instrument: &str) -> Option<&SymbolState> {
        self.symbols.get(instrument)
    }

    /// Startup reconciliation: synthetic lots for pre-existing positions and
    /// adoption of live strategy orders. Safe to run more than once.
    pub async fn bootstrap(&mut self) {
        let ctx = self.ctx.clone();
        let now = now_ms();
        let snapshots = collect_snapshots(&ctx).await;
        for state in self.symbols.values_mut() {
            if !state.config.enabled {
                continue;
            }
            adopt_existing(&ctx, state, &snapshots, now).await;
        }
        tracing::info!(symbols = self.symbols.len(), "bootstrap completed");
    }

    pub async fn run(&mut self, stop: Arc<AtomicBool>, stop_notify: Arc<Notify>) {
        self.bootstrap().await;
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if self.ctx.settings.max_runtime_sec > 0
                && now_ms() - self.started_at_ms
                    >= self.ctx.settings.max_runtime_sec as i64 * 1000
            {
                tracing::info!(
                    max_runtime_sec = self.ctx.settings.max_runtime_sec,
                    "reached max runtime, stopping"
                );
                break;
            }
            let tick_started = Instant::now();
            // The loop outlives any single bad tick: failures and panics are
            // reported and the next tick proceeds on fresh state.
            let outcome = AssertUnwindSafe(self.tick()).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.report_loop_error(&format!("{err:#}")).await,
                Err(panic) => self.report_loop_error(&panic_message(panic.as_ref())).await,
            }
            metrics::histogram!("hedge.tick_duration_ms")
                .record(tick_started.elapsed().as_millis() as f64);
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.settings.loop_interval) => {}
                _ = stop_notify.notified() => {}
            }
        }
        self.cleanup_on_stop().await;
    }

    async fn report_loop_error(&self, message: &str) {
        tracing::error!(message, "hedge loop tick failed");
        self.ctx
            .alerts
            .notify(
                "hedge loop error",
                message,
                "main_loop_error",
                120,
                now_ms(),
            )
            .await;
    }

    pub async fn tick(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        let now = now_ms();
        let snapshots = collect_snapshots(&ctx).await;
        for state in self.symbols.values_mut() {
            process_symbol(&ctx, state, &snapshots, now).await;
        }
        ctx.alerts
            .maybe_send_daily_report(ctx.settings.stuck_hours, now)
            .await;
        self.publish_status(&snapshots, now);
        Ok(())
    }

    fn publish_status(&self, snapshots: &Snapshots, now: i64) {
        let symbols = self
            .symbols
            .values()
            .map(|state| {
                let instrument = state.config.instrument.clone();
                let abs_a = snapshots.a.position(&instrument).abs_notional;
                let abs_b = snapshots.b.position(&instrument).abs_notional;
                metrics::gauge!("hedge.imbalance_usdt", "instrument" => instrument.clone())
                    .set((abs_a - abs_b).abs().to_f64().unwrap_or(0.0));
                SymbolStatus {
                    instrument,
                    enabled: state.config.enabled,
                    abs_a,
                    abs_b,
                    unmatched_lots: state.ledger.lots().count(),
                    unmatched_notional: state.ledger.unmatched_notional(),
                    active_orders_a: state.orders.active_count(AccountLabel::A, now),
                    active_orders_b: state.orders.active_count(AccountLabel::B, now),
                    cooldown_until_ms: state.cooldown_until_ms,
                    foreign_orders: state.foreign_orders.len(),
                }
            })
            .collect();
        *self.status.write() = EngineStatus {
            ts_ms: now,
            symbols,
        };
    }

    /// Stop-time policy: cancel strategy orders beyond the configured
    /// keep-count per (account, instrument). Foreign orders are never
    /// touched.
    pub async fn cleanup_on_stop(&self) {
        if !self.ctx.settings.cancel_on_stop {
            tracing::info!("skipping stop cleanup, HEDGE_CANCEL_ON_STOP=0");
            return;
        }
        let keep = self.ctx.settings.stop_keep_strategy_orders;
        let mut candidates = 0usize;
        let mut cancelled = 0usize;
        for label in AccountLabel::both() {
            let gateway = self.ctx.gateway(label);
            let grouped = match gateway.open_orders_by_instrument().await {
                Ok(grouped) => grouped,
                Err(err) => {
                    tracing::warn!(account = %label, %err, "stop cleanup query failed");
                    continue;
                }
            };
            for (symbol, orders) in grouped {
                let mut strategy: Vec<&OrderView> = orders
                    .iter()
                    .filter(|o| o.client_id.map_or(false, is_strategy_client_id))
                    .collect();
                strategy.sort_by_key(|o| std::cmp::Reverse(o.create_ts_ms));
                for order in strategy.into_iter().skip(keep) {
                    candidates += 1;
                    match gateway.cancel(&order.order_id).await {
                        Ok(()) => {
                            cancelled += 1;
                            tracing::info!(
                                account = %label,
                                %symbol,
                                order_id = %order.order_id,
                                "cancelled strategy order on stop"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(
                                account = %label,
                                %symbol,
                                order_id = %order.order_id,
                                %err,
                                "stop cancel failed"
                            );
                        }
                    }
                }
            }
        }
        tracing::info!(cancelled, candidates, keep, "stop cleanup finished");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "tick panicked with a non-string payload".to_string()
    }
}

pub async fn collect_snapshots(ctx: &EngineCtx) -> Snapshots {
    let (a, b) = tokio::join!(
        collect_account(ctx, AccountLabel::A),
        collect_account(ctx, AccountLabel::B)
    );
    Snapshots { a, b }
}

async fn collect_account(ctx: &EngineCtx, label: AccountLabel) -> AccountSnapshot {
    let gateway = ctx.gateway(label);
    let now = now_ms();
    let mut snapshot = AccountSnapshot::default();
    match gateway.positions().await {
        Ok(positions) => snapshot.positions = positions,
        Err(err) => report_query_error(ctx, "positions", label, &err, now).await,
    }
    match gateway.open_orders_by_instrument().await {
        Ok(orders) => snapshot.open_orders = orders,
        Err(err) => report_query_error(ctx, "open_orders", label, &err, now).await,
    }
    match gateway.account_summary().await {
        Ok(summary) => {
            ctx.alerts
                .check_mmr(label, &summary, ctx.settings.mmr_alert_threshold, now)
                .await;
            snapshot.summary = Some(summary);
        }
        Err(err) => report_query_error(ctx, "summary", label, &err, now).await,
    }
    snapshot
}

async fn report_query_error(
    ctx: &EngineCtx,
    op: &str,
    label: AccountLabel,
    err: &GatewayError,
    now: i64,
) {
    match err {
        GatewayError::RateLimited(msg) => {
            tracing::warn!(account = %label, op, %msg, "rate limited, backing off to next tick");
        }
        GatewayError::Transient(msg) => {
            tracing::warn!(account = %label, op, %msg, "transient query failure, state kept stale");
        }
        GatewayError::Auth(msg) => {
            ctx.alerts
                .notify(
                    &format!("hedge auth failure {label}"),
                    msg,
                    &format!("auth:{label}"),
                    120,
                    now,
                )
                .await;
        }
        _ => {
            ctx.alerts
                .notify(
                    &format!("hedge {op} failed {label}"),
                    &err.to_string(),
                    &format!("{op}:{label}"),
                    120,
                    now,
                )
                .await;
        }
    }
}

/// Seed synthetic lots from pre-existing positions and adopt whatever is
/// already resting on the book.
async fn adopt_existing(ctx: &EngineCtx, state: &mut SymbolState, snapshots: &Snapshots, now: i64) {
    let instrument = state.config.instrument.clone();
    for label in AccountLabel::both() {
        let position = snapshots.get(label).position(&instrument);
        if position.abs_notional > Decimal::ZERO
            && position.entry_price > Decimal::ZERO
            && !state.ledger.has_lots_for(label)
        {
            let side = if position.size > Decimal::ZERO {
                core_types::Side::Buy
            } else {
                core_types::Side::Sell
            };
            tracing::info!(
                %instrument,
                account = %label,
                %side,
                notional = %position.abs_notional,
                guard = %position.entry_price,
                "seeded synthetic lot from existing position"
            );
            let matches = state.ledger.record_fill(
                label,
                side,
                position.entry_price,
                position.abs_notional,
                now,
                true,
            );
            metrics::counter!("hedge.lots_matched").increment(matches.len() as u64);
        }
    }
    for label in AccountLabel::both() {
        let live = snapshots
            .get(label)
            .open_orders
            .get(&instrument)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let events = state.orders.sync_account(
            label,
            &instrument,
            live,
            now,
            ctx.settings.partial_fill_timeout_ms(),
        );
        handle_tracker_events(ctx, state, &instrument, events, now).await;
    }
}

pub async fn process_symbol(
    ctx: &EngineCtx,
    state: &mut SymbolState,
    snapshots: &Snapshots,
    now: i64,
) {
    if !state.config.enabled {
        return;
    }
    let instrument = state.config.instrument.clone();
    for label in AccountLabel::both() {
        let live = snapshots
            .get(label)
            .open_orders
            .get(&instrument)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let events = state.orders.sync_account(
            label,
            &instrument,
            live,
            now,
            ctx.settings.partial_fill_timeout_ms(),
        );
        handle_tracker_events(ctx, state, &instrument, events, now).await;
    }

    let pos_a = snapshots.a.position(&instrument);
    let pos_b = snapshots.b.position(&instrument);
    ctx.alerts
        .check_stuck_lots(
            &instrument,
            state.ledger.earliest_unmatched_ts(),
            ctx.settings.stuck_hours,
            now,
        )
        .await;

    let decision = decide(
        &DecisionInputs {
            config: &state.config,
            pos_a,
            pos_b,
            ledger: &state.ledger,
            orders: &state.orders,
            now_ms: now,
        },
        &ctx.policy,
    );
    for note in &decision.notes {
        report_policy_note(ctx, &instrument, note, now).await;
    }
    for cancel in &decision.cancels {
        cancel_managed(ctx, state, cancel.client_id, cancel.reason).await;
    }
    if now >= state.cooldown_until_ms {
        for place in decision.places {
            place_with_retry(ctx, state, &instrument, &place, now).await;
        }
    }
    state.orders.prune_finalized();
}

async fn report_policy_note(ctx: &EngineCtx, instrument: &str, note: &PolicyNote, now: i64) {
    match note {
        PolicyNote::MaxTotalReached { total } => {
            ctx.alerts
                .notify(
                    &format!("max_total_position exceeded {instrument}"),
                    &format!("mode=increase total={total}"),
                    &format!("max_total:{instrument}"),
                    900,
                    now,
                )
                .await;
        }
        PolicyNote::MinTotalReached { total } => {
            ctx.alerts
                .notify(
                    &format!("min_total_position reached {instrument}"),
                    &format!("mode=decrease total={total}"),
                    &format!("min_total:{instrument}"),
                    900,
                    now,
                )
                .await;
        }
        PolicyNote::DecreaseDirectionMismatch { size_a, size_b } => {
            ctx.alerts
                .notify(
                    &format!("decrease mode direction mismatch {instrument}"),
                    &format!("A.size={size_a} B.size={size_b}, falling back to configured baseline"),
                    &format!("decrease_direction_fallback:{instrument}"),
                    1800,
                    now,
                )
                .await;
        }
    }
}

async fn handle_tracker_events(
    ctx: &EngineCtx,
    state: &mut SymbolState,
    instrument: &str,
    events: Vec<TrackerEvent>,
    now: i64,
) {
    let mut queue: VecDeque<TrackerEvent> = events.into();
    while let Some(event) = queue.pop_front() {
        match event {
            TrackerEvent::FillDelta {
                account,
                side,
                guard_price,
                notional,
                ts_ms,
            } => {
                tracing::info!(
                    %instrument,
                    %account,
                    %side,
                    %notional,
                    guard = %guard_price,
                    "recorded fill lot"
                );
                let matches =
                    state
                        .ledger
                        .record_fill(account, side, guard_price, notional, ts_ms, false);
                metrics::counter!("hedge.lots_matched").increment(matches.len() as u64);
            }
            TrackerEvent::Foreign { account, order_id } => {
                state.foreign_orders.insert(order_id.clone());
                ctx.alerts
                    .notify(
                        &format!("non-strategy order detected {instrument}"),
                        &format!(
                            "account={account} order_id={order_id} preserved and ignored by strategy"
                        ),
                        &format!("non_strategy:{instrument}"),
                        3600,
                        now,
                    )
                    .await;
            }
            TrackerEvent::Probe {
                client_id,
                account,
                order_id,
            } => match ctx.gateway(account).get_order(&order_id).await {
                Ok(view) => {
                    let follow_ups = state.orders.apply_probe(
                        client_id,
                        view.as_ref(),
                        now,
                        ctx.settings.partial_fill_timeout_ms(),
                    );
                    queue.extend(follow_ups);
                }
                Err(err) => {
                    tracing::warn!(
                        %instrument,
                        account = %account,
                        %order_id,
                        %err,
                        "order probe failed, retrying next tick"
                    );
                }
            },
            TrackerEvent::Closed {
                client_id,
                state: order_state,
            } => {
                tracing::debug!(%instrument, client_id, ?order_state, "managed order closed");
            }
        }
    }
}

async fn cancel_managed(ctx: &EngineCtx, state: &mut SymbolState, client_id: u64, reason: &str) {
    let Some(order) = state.orders.get(client_id) else {
        return;
    };
    let account = order.account;
    let order_id = order.exchange_order_id.clone();
    match ctx.gateway(account).cancel(&order_id).await {
        Ok(()) => {
            state.orders.mark_closed(client_id, OrderState::Cancelled);
            metrics::counter!("hedge.orders_cancelled").increment(1);
            tracing::info!(
                instrument = %state.config.instrument,
                account = %account,
                %order_id,
                reason,
                "cancelled strategy order"
            );
        }
        Err(err) => {
            tracing::warn!(
                instrument = %state.config.instrument,
                account = %account,
                %order_id,
                reason,
                %err,
                "cancel failed"
            );
        }
    }
}

/// Submit one placement intent with post-only retry. Each attempt refreshes
/// the book and reprices under the guard; exhaustion parks the instrument in
/// cooldown.
async fn place_with_retry(
    ctx: &EngineCtx,
    state: &mut SymbolState,
    instrument: &str,
    intent: &PlaceIntent,
    now: i64,
) {
    let gateway = ctx.gateway(intent.account);
    let info = match gateway.instrument_info(instrument).await {
        Ok(info) => info,
        Err(err) => {
            ctx.alerts
                .notify(
                    &format!("hedge instrument query failed {instrument}"),
                    &err.to_string(),
                    &format!("instrument:{}:{instrument}", intent.account),
                    600,
                    now,
                )
                .await;
            return;
        }
    };
    for attempt in 1..=ctx.settings.post_only_max_retry {
        let book = match gateway.book_top(instrument).await {
            Ok(book) => book,
            Err(err) => {
                tracing::warn!(%instrument, account = %intent.account, %err, "book fetch failed");
                tokio::time::sleep(RETRY_PAUSE).await;
                continue;
            }
        };
        let price = maker_price(intent.side, &book, intent.guard_price, info.tick_size);
        if price <= Decimal::ZERO {
            continue;
        }
        let size = size_from_notional(intent.notional, price, &info);
        if size <= Decimal::ZERO || size < info.min_size {
            tracing::debug!(
                %instrument,
                account = %intent.account,
                notional = %intent.notional,
                %price,
                "placement below min size, skipped"
            );
            return;
        }
        match gateway
            .place_post_only(instrument, intent.side, price, size, intent.guard_price, now)
            .await
        {
            Ok(managed) => {
                metrics::counter!("hedge.orders_placed").increment(1);
                tracing::info!(
                    %instrument,
                    account = %intent.account,
                    side = %intent.side,
                    notional = %managed.notional_usdt,
                    %price,
                    "placed post-only order"
                );
                state.orders.insert_placed(managed);
                return;
            }
            Err(GatewayError::PostOnlyRejected) => {
                metrics::counter!("hedge.post_only_rejects").increment(1);
                tracing::debug!(
                    %instrument,
                    account = %intent.account,
                    attempt,
                    max = ctx.settings.post_only_max_retry,
                    "post-only rejected"
                );
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(GatewayError::InsufficientSize) => {
                tracing::debug!(%instrument, account = %intent.account, "size rejected by venue");
                return;
            }
            Err(GatewayError::RateLimited(msg)) => {
                tracing::warn!(%instrument, account = %intent.account, %msg, "rate limited");
                return;
            }
            Err(GatewayError::Transient(msg)) => {
                tracing::warn!(%instrument, account = %intent.account, %msg, "transient place failure");
                return;
            }
            Err(GatewayError::Auth(msg)) => {
                ctx.alerts
                    .notify(
                        &format!("hedge auth failure {}", intent.account),
                        &msg,
                        &format!("auth:{}", intent.account),
                        120,
                        now,
                    )
                    .await;
                return;
            }
            Err(GatewayError::Permanent(msg)) => {
                ctx.alerts
                    .notify(
                        &format!("hedge order failed {instrument}"),
                        &format!("account={} side={} error={msg}", intent.account, intent.side),
                        &format!("order_failed:{instrument}:{}:{}", intent.account, intent.side),
                        120,
                        now,
                    )
                    .await;
                return;
            }
        }
    }
    state.cooldown_until_ms = now + ctx.settings.post_only_cooldown_sec * 1000;
    ctx.alerts
        .notify(
            &format!("hedge cooldown {instrument}"),
            &format!(
                "post-only failed after {} retries, cooldown {}s",
                ctx.settings.post_only_max_retry, ctx.settings.post_only_cooldown_sec
            ),
            &format!("cooldown:{instrument}"),
            120,
            now,
        )
        .await;
}
