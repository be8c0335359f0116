use std::collections::HashMap;

use async_trait::async_trait;
use core_types::{
    AccountSummary, BookTop, ExchangeSession, InstrumentInfo, OrderRequest, OrderState, OrderView,
    PositionView, SessionError, Side,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;

/// In-process exchange session for tests and dry runs. Books, positions and
/// summaries are injected; post-only semantics are simulated: an order that
/// would cross the injected book is rejected, everything else rests until
/// scripted fills consume it.
pub struct PaperExchange {
    inner: Mutex<PaperInner>,
}

#[derive(Default)]
struct PaperInner {
    books: HashMap<String, BookTop>,
    instruments: HashMap<String, InstrumentInfo>,
    positions: HashMap<String, PositionView>,
    summary: AccountSummary,
    orders: HashMap<String, OrderView>,
    next_order_seq: u64,
    renew_count: u32,
    fail_auth_next: u32,
    reject_post_only_next: u32,
    placeholder_acks: u32,
    book_ts_ms: i64,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PaperInner::default()),
        }
    }

    pub fn set_book(&self, instrument: &str, bid1: Decimal, ask1: Decimal) {
        let mut inner = self.inner.lock();
        inner.book_ts_ms += 1;
        let ts_ms = inner.book_ts_ms;
        inner
            .books
            .insert(instrument.to_string(), BookTop { bid1, ask1, ts_ms });
    }

    pub fn set_instrument(&self, info: InstrumentInfo) {
        self.inner
            .lock()
            .instruments
            .insert(info.instrument.clone(), info);
    }

    pub fn set_position(&self, view: PositionView) {
        self.inner.lock().positions.insert(view.instrument.clone(), view);
    }

    pub fn clear_position(&self, instrument: &str) {
        self.inner.lock().positions.remove(instrument);
    }

    pub fn set_summary(&self, summary: AccountSummary) {
        self.inner.lock().summary = summary;
    }

    /// The next `n` session calls fail with an authentication error.
    pub fn fail_auth_next(&self, n: u32) {
        self.inner.lock().fail_auth_next = n;
    }

    /// The next `n` placements are rejected as post-only regardless of price.
    pub fn reject_post_only_next(&self, n: u32) {
        self.inner.lock().reject_post_only_next = n;
    }

    /// The next `n` placements acknowledge with a sentinel order id while the
    /// order itself rests under its real id.
    pub fn ack_with_placeholder_next(&self, n: u32) {
        self.inner.lock().placeholder_acks = n;
    }

    pub fn renew_count(&self) -> u32 {
        self.inner.lock().renew_count
    }

    pub fn open_order_count(&self) -> usize {
        self.inner
            .lock()
            .orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .count()
    }

    pub fn order_ids(&self) -> Vec<String> {
        self.inner.lock().orders.keys().cloned().collect()
    }

    /// Trade `traded` of the order carrying `client_id`.
    pub fn fill_by_client_id(&self, client_id: u64, traded: Decimal) {
        let mut inner = self.inner.lock();
        for order in inner.orders.values_mut() {
            if order.client_id == Some(client_id) {
                order.traded_size = traded.min(order.size);
                order.book_size = order.size - order.traded_size;
                if order.traded_size >= order.size {
                    order.state = OrderState::Filled;
                }
                return;
            }
        }
    }

    /// Drop an order without trace, as if cancelled out-of-band.
    pub fn drop_order_by_client_id(&self, client_id: u64) {
        self.inner
            .lock()
            .orders
            .retain(|_, o| o.client_id != Some(client_id));
    }

    fn gate(inner: &mut PaperInner) -> Result<(), SessionError> {
        if inner.fail_auth_next > 0 {
            inner.fail_auth_next -= 1;
            return Err(SessionError::Api {
                status: Some(401),
                code: Some(1000),
                message: "unauthorized".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeSession for PaperExchange {
    async fn renew(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        inner.renew_count += 1;
        inner.fail_auth_next = 0;
        Ok(())
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderView, SessionError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        if inner.reject_post_only_next > 0 {
            inner.reject_post_only_next -= 1;
            return Err(SessionError::Api {
                status: Some(400),
                code: None,
                message: "post-only order would take liquidity".to_string(),
            });
        }
        if let Some(book) = inner.books.get(&req.instrument) {
            let crosses = match req.side {
                Side::Buy => req.limit_price >= book.ask1,
                Side::Sell => req.limit_price <= book.bid1,
            };
            if crosses {
                return Err(SessionError::Api {
                    status: Some(400),
                    code: None,
                    message: "post-only order would take liquidity".to_string(),
                });
            }
        }
        inner.next_order_seq += 1;
        let order_id = format!("0x{:x}", 0x1000 + inner.next_order_seq);
        let view = OrderView {
            order_id: order_id.clone(),
            client_id: Some(req.client_id),
            instrument: req.instrument.clone(),
            side: req.side,
            limit_price: req.limit_price,
            size: req.size,
            traded_size: Decimal::ZERO,
            book_size: req.size,
            state: OrderState::Open,
            create_ts_ms: inner.book_ts_ms,
        };
        inner.orders.insert(order_id, view.clone());
        if inner.placeholder_acks > 0 {
            inner.placeholder_acks -= 1;
            let mut ack = view;
            ack.order_id = "0x00".to_string();
            return Ok(ack);
        }
        Ok(view)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        match inner.orders.remove(order_id) {
            Some(_) => Ok(()),
            None => Err(SessionError::Api {
                status: Some(404),
                code: None,
                message: "order not found".to_string(),
            }),
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderView, SessionError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        inner
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| SessionError::Api {
                status: Some(404),
                code: None,
                message: "order not found".to_string(),
            })
    }

    async fn open_orders(&self) -> Result<Vec<OrderView>, SessionError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        Ok(inner
            .orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn positions(&self) -> Result<Vec<PositionView>, SessionError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        Ok(inner.positions.values().cloned().collect())
    }

    async fn account_summary(&self) -> Result<AccountSummary, SessionError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        Ok(inner.summary)
    }

    async fn orderbook_top(&self, instrument: &str, _depth: u32) -> Result<BookTop, SessionError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        inner
            .books
            .get(instrument)
            .copied()
            .ok_or_else(|| SessionError::Api {
                status: Some(404),
                code: None,
                message: format!("no orderbook for {instrument}"),
            })
    }

    async fn instrument(&self, instrument: &str) -> Result<InstrumentInfo, SessionError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        inner
            .instruments
            .get(instrument)
            .cloned()
            .ok_or_else(|| SessionError::Api {
                status: Some(404),
                code: None,
                message: format!("unknown instrument {instrument}"),
            })
    }

    async fn active_instruments(&self) -> Result<Vec<String>, SessionError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        Ok(inner.instruments.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(side: Side, price: Decimal) -> OrderRequest {
        OrderRequest {
            instrument: "BTC_USDT_Perp".to_string(),
            side,
            limit_price: price,
            size: dec!(1),
            client_id: core_types::strategy_client_id(core_types::AccountLabel::A, side),
        }
    }

    #[tokio::test]
    async fn resting_order_survives_and_fills() {
        let paper = PaperExchange::new();
        paper.set_book("BTC_USDT_Perp", dec!(1002.0), dec!(1002.1));
        let ack = paper
            .create_order(&request(Side::Buy, dec!(1002.0)))
            .await
            .expect("rests");
        assert_eq!(paper.open_order_count(), 1);
        paper.fill_by_client_id(ack.client_id.unwrap(), dec!(1));
        let view = paper.get_order(&ack.order_id).await.expect("view");
        assert_eq!(view.state, OrderState::Filled);
    }

    #[tokio::test]
    async fn sell_crossing_bid_is_rejected() {
        let paper = PaperExchange::new();
        paper.set_book("BTC_USDT_Perp", dec!(1002.0), dec!(1002.1));
        let err = paper
            .create_order(&request(Side::Sell, dec!(1002.0)))
            .await
            .expect_err("crosses");
        assert!(err.message().contains("post-only"));
    }

    #[tokio::test]
    async fn placeholder_ack_hides_real_id_until_queried() {
        let paper = PaperExchange::new();
        paper.set_book("BTC_USDT_Perp", dec!(1002.0), dec!(1002.1));
        paper.ack_with_placeholder_next(1);
        let ack = paper
            .create_order(&request(Side::Buy, dec!(1001.0)))
            .await
            .expect("rests");
        assert_eq!(ack.order_id, "0x00");
        let open = paper.open_orders().await.expect("open");
        assert_eq!(open.len(), 1);
        assert_ne!(open[0].order_id, "0x00");
        assert_eq!(open[0].client_id, ack.client_id);
    }
}
