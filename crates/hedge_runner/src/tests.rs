use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use core_types::{
    AccountLabel, ExchangeSession, InstrumentInfo, OrderRequest, PositionMode, PositionView, Side,
    SymbolConfig,
};
use execution_perp::{AccountGateway, PaperExchange};
use hedge_policy::PolicySettings;
use risk_alerts::{AlertCenter, RecordingSink};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::engine::{EngineCtx, HedgeEngine};
use crate::settings::{ExecutionMode, HedgeSettings};
use crate::state::SymbolState;

const INSTRUMENT: &str = "BTC_USDT_Perp";

fn test_settings() -> HedgeSettings {
    HedgeSettings {
        loop_interval: Duration::from_secs(2),
        orderbook_depth: 10,
        single_order_diff_threshold_usdt: dec!(20),
        max_runtime_sec: 0,
        cancel_on_stop: true,
        stop_keep_strategy_orders: 0,
        post_only_max_retry: 5,
        post_only_cooldown_sec: 300,
        partial_fill_timeout_sec: 1800,
        stuck_hours: 6,
        mmr_alert_threshold: dec!(0.70),
        symbols_file: "unused".to_string(),
        status_port: 0,
        log_dir: None,
        execution_mode: ExecutionMode::Paper,
        exchange_url: "http://127.0.0.1:9100".to_string(),
        call_timeout: Duration::from_secs(10),
    }
}

fn symbol_config() -> SymbolConfig {
    SymbolConfig {
        instrument: INSTRUMENT.to_string(),
        enabled: true,
        order_notional_usdt: dec!(1000),
        imbalance_limit_usdt: dec!(1000),
        max_total_position_usdt: dec!(20000),
        min_total_position_usdt: Decimal::ZERO,
        a_side_when_equal: Side::Buy,
        position_mode: PositionMode::Increase,
    }
}

struct Harness {
    engine: HedgeEngine,
    paper_a: Arc<PaperExchange>,
    paper_b: Arc<PaperExchange>,
    sink: Arc<RecordingSink>,
}

fn harness_with(settings: HedgeSettings, config: SymbolConfig) -> Harness {
    let instrument_info = InstrumentInfo {
        instrument: INSTRUMENT.to_string(),
        tick_size: dec!(0.1),
        min_size: dec!(0.001),
        base_decimals: 6,
    };
    let paper_a = Arc::new(PaperExchange::new());
    let paper_b = Arc::new(PaperExchange::new());
    for paper in [&paper_a, &paper_b] {
        paper.set_instrument(instrument_info.clone());
        paper.set_book(INSTRUMENT, dec!(1002.0), dec!(1002.1));
    }
    let sink = Arc::new(RecordingSink::new());
    let alerts = Arc::new(AlertCenter::new(sink.clone()));
    let policy = PolicySettings {
        single_order_diff_threshold_usdt: settings.single_order_diff_threshold_usdt,
        ..PolicySettings::default()
    };
    let ctx = Arc::new(EngineCtx {
        gateway_a: Arc::new(AccountGateway::new(
            AccountLabel::A,
            paper_a.clone(),
            settings.orderbook_depth,
            settings.call_timeout,
        )),
        gateway_b: Arc::new(AccountGateway::new(
            AccountLabel::B,
            paper_b.clone(),
            settings.orderbook_depth,
            settings.call_timeout,
        )),
        alerts,
        settings,
        policy,
    });
    let mut symbols = BTreeMap::new();
    symbols.insert(INSTRUMENT.to_string(), SymbolState::new(config));
    Harness {
        engine: HedgeEngine::new(ctx, symbols),
        paper_a,
        paper_b,
        sink,
    }
}

fn harness() -> Harness {
    harness_with(test_settings(), symbol_config())
}

async fn open_orders(paper: &PaperExchange) -> Vec<core_types::OrderView> {
    paper.open_orders().await.expect("open orders")
}

#[tokio::test]
async fn empty_start_seeds_both_books() {
    let mut h = harness();
    h.engine.tick().await.expect("tick");

    let a_orders = open_orders(&h.paper_a).await;
    assert_eq!(a_orders.len(), 1);
    assert_eq!(a_orders[0].side, Side::Buy);
    assert_eq!(a_orders[0].limit_price, dec!(1002.0));
    assert_eq!(a_orders[0].size, dec!(0.998));

    let b_orders = open_orders(&h.paper_b).await;
    assert_eq!(b_orders.len(), 1);
    assert_eq!(b_orders[0].side, Side::Sell);
    assert_eq!(b_orders[0].limit_price, dec!(1002.1));
    assert_eq!(b_orders[0].size, dec!(0.997));
}

#[tokio::test]
async fn noop_tick_is_side_effect_free() {
    let mut h = harness();
    h.engine.tick().await.expect("tick");
    let alerts_before = h.sink.messages().len();

    h.engine.tick().await.expect("tick");
    assert_eq!(open_orders(&h.paper_a).await.len(), 1);
    assert_eq!(open_orders(&h.paper_b).await.len(), 1);
    assert_eq!(h.sink.messages().len(), alerts_before);
}

#[tokio::test]
async fn filled_buy_is_hedged_at_its_guard_price() {
    let mut h = harness();
    h.engine.tick().await.expect("tick");

    // A's buy fills fully at its 1002.0 limit.
    let a_order = open_orders(&h.paper_a).await.remove(0);
    let a_client = a_order.client_id.expect("client id");
    h.paper_a.fill_by_client_id(a_client, a_order.size);
    h.paper_a.set_position(PositionView {
        instrument: INSTRUMENT.to_string(),
        size: a_order.size,
        entry_price: dec!(1002.0),
        mark_price: dec!(1002.0),
    });
    // The ask drops below the guard: the guard must win.
    h.paper_b.set_book(INSTRUMENT, dec!(1001.0), dec!(1001.1));

    h.engine.tick().await.expect("tick");

    let b_orders = open_orders(&h.paper_b).await;
    assert_eq!(b_orders.len(), 2);
    let hedge = b_orders
        .iter()
        .max_by_key(|o| o.create_ts_ms)
        .expect("hedge order");
    assert_eq!(hedge.side, Side::Sell);
    assert_eq!(hedge.limit_price, dec!(1002.0));

    // The fill became an unmatched lot guarded at the limit price.
    let state = h.engine.symbol(INSTRUMENT).expect("state");
    let lots: Vec<_> = state.ledger.lots().collect();
    assert_eq!(lots.len(), 1);
    assert_eq!(lots[0].account, AccountLabel::A);
    assert_eq!(lots[0].side, Side::Buy);
    assert_eq!(lots[0].guard_price, dec!(1002.0));
}

#[tokio::test]
async fn low_diff_cancels_the_older_of_two_orders() {
    let mut h = harness();
    h.paper_a.set_position(PositionView {
        instrument: INSTRUMENT.to_string(),
        size: dec!(0.5),
        entry_price: dec!(1000),
        mark_price: dec!(1000),
    });
    h.paper_b.set_position(PositionView {
        instrument: INSTRUMENT.to_string(),
        size: dec!(0.485),
        entry_price: dec!(1000),
        mark_price: dec!(1000),
    });
    // Two resting strategy sells on B, distinct creation times.
    let older = h
        .paper_b
        .create_order(&OrderRequest {
            instrument: INSTRUMENT.to_string(),
            side: Side::Sell,
            limit_price: dec!(1010.0),
            size: dec!(0.005),
            client_id: core_types::strategy_client_id(AccountLabel::B, Side::Sell),
        })
        .await
        .expect("older");
    h.paper_b.set_book(INSTRUMENT, dec!(1002.0), dec!(1002.1));
    let newer = h
        .paper_b
        .create_order(&OrderRequest {
            instrument: INSTRUMENT.to_string(),
            side: Side::Sell,
            limit_price: dec!(1011.0),
            size: dec!(0.005),
            client_id: core_types::strategy_client_id(AccountLabel::B, Side::Sell),
        })
        .await
        .expect("newer");

    h.engine.tick().await.expect("tick");

    let remaining = open_orders(&h.paper_b).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].client_id, newer.client_id);
    assert_ne!(remaining[0].client_id, older.client_id);
}

#[tokio::test]
async fn post_only_exhaustion_parks_the_instrument_in_cooldown() {
    let mut h = harness();
    h.paper_a.reject_post_only_next(10);

    h.engine.tick().await.expect("tick");

    assert_eq!(open_orders(&h.paper_a).await.len(), 0);
    let state = h.engine.symbol(INSTRUMENT).expect("state");
    assert!(state.cooldown_until_ms > core_types::now_ms());
    assert!(h
        .sink
        .messages()
        .iter()
        .any(|m| m.contains("cooldown")));

    // Cooldown blocks further placements on the instrument.
    h.engine.tick().await.expect("tick");
    assert_eq!(open_orders(&h.paper_a).await.len(), 0);
}

#[tokio::test]
async fn partial_fill_is_reaped_without_cancelling_the_rest() {
    let mut settings = test_settings();
    settings.partial_fill_timeout_sec = 0;
    let mut h = harness_with(settings, symbol_config());
    h.engine.tick().await.expect("tick");

    let a_order = open_orders(&h.paper_a).await.remove(0);
    h.paper_a
        .fill_by_client_id(a_order.client_id.expect("client id"), dec!(0.4));

    h.engine.tick().await.expect("tick");

    let state = h.engine.symbol(INSTRUMENT).expect("state");
    let lots: Vec<_> = state.ledger.lots().collect();
    assert_eq!(lots.len(), 1);
    assert_eq!(lots[0].remaining_notional, dec!(400.8));
    // The resting remainder is untouched.
    let still_open = open_orders(&h.paper_a).await;
    assert_eq!(still_open.len(), 1);
    assert_eq!(still_open[0].book_size, dec!(0.598));
}

#[tokio::test]
async fn startup_adopts_positions_and_flags_foreign_orders() {
    let mut h = harness();
    h.paper_a.set_position(PositionView {
        instrument: INSTRUMENT.to_string(),
        size: dec!(1.5),
        entry_price: dec!(1000),
        mark_price: dec!(1000),
    });
    // A foreign sell resting on A, outside the strategy id namespace.
    h.paper_a
        .create_order(&OrderRequest {
            instrument: INSTRUMENT.to_string(),
            side: Side::Sell,
            limit_price: dec!(1010.0),
            size: dec!(0.1),
            client_id: 12345,
        })
        .await
        .expect("foreign order");

    h.engine.bootstrap().await;

    let state = h.engine.symbol(INSTRUMENT).expect("state");
    let lots: Vec<_> = state.ledger.lots().collect();
    assert_eq!(lots.len(), 1);
    assert!(lots[0].synthetic);
    assert_eq!(lots[0].guard_price, dec!(1000));
    assert_eq!(lots[0].remaining_notional, dec!(1500));
    assert_eq!(state.foreign_orders.len(), 1);
    assert_eq!(
        h.sink
            .messages()
            .iter()
            .filter(|m| m.contains("non-strategy"))
            .count(),
        1
    );

    h.engine.tick().await.expect("tick");

    // B schedules the hedge sell with the entry price as its floor.
    let b_orders = open_orders(&h.paper_b).await;
    assert_eq!(b_orders.len(), 1);
    assert_eq!(b_orders[0].side, Side::Sell);
    assert!(b_orders[0].limit_price >= dec!(1000));
    // The foreign order is still resting, untouched.
    assert_eq!(open_orders(&h.paper_a).await.len(), 1);
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let mut h = harness();
    h.paper_a.set_position(PositionView {
        instrument: INSTRUMENT.to_string(),
        size: dec!(1.5),
        entry_price: dec!(1000),
        mark_price: dec!(1000),
    });
    h.engine.bootstrap().await;
    h.engine.bootstrap().await;

    let state = h.engine.symbol(INSTRUMENT).expect("state");
    assert_eq!(state.ledger.lots().count(), 1);
    assert_eq!(state.ledger.unmatched_notional(), dec!(1500));
}

#[tokio::test]
async fn opposed_startup_positions_match_immediately() {
    let mut h = harness();
    h.paper_a.set_position(PositionView {
        instrument: INSTRUMENT.to_string(),
        size: dec!(1.5),
        entry_price: dec!(1000),
        mark_price: dec!(1000),
    });
    h.paper_b.set_position(PositionView {
        instrument: INSTRUMENT.to_string(),
        size: dec!(-1.5),
        entry_price: dec!(1000),
        mark_price: dec!(1000),
    });

    h.engine.bootstrap().await;

    // B's short entered at the same price: the synthetic lots pair off.
    let state = h.engine.symbol(INSTRUMENT).expect("state");
    assert!(state.ledger.is_empty());
}
