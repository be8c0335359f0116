use std::time::Duration;

use async_trait::async_trait;
use core_types::{
    AccountSummary, BookTop, ExchangeSession, InstrumentInfo, OrderRequest, OrderView,
    PositionView, SessionError,
};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Connection settings for the exchange-client service handling signing and
/// authentication on our behalf.
#[derive(Debug, Clone)]
pub struct RestSessionConfig {
    pub base_url: String,
    pub api_key: String,
    pub signing_key: String,
    pub account_id: String,
    pub main_account_id: Option<String>,
    pub timeout: Duration,
}

/// `ExchangeSession` over the external exchange client's HTTP surface. All
/// order-shaping guarantees (post-only, good-till-time, numeric client id)
/// are encoded in the request payload.
pub struct RestSession {
    config: RestSessionConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct BookLevels {
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    #[serde(default)]
    ts_ms: i64,
}

#[derive(Debug, Deserialize)]
struct PriceLevel {
    price: Decimal,
}

impl RestSession {
    pub fn new(config: RestSessionConfig) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("X-API-Key", &self.config.api_key)
            .header("X-Account-Id", &self.config.account_id)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        res: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<T, SessionError> {
        let res = res.map_err(|e| SessionError::Transport(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body: ApiErrorBody = res.json().await.unwrap_or(ApiErrorBody {
                code: None,
                message: status.to_string(),
            });
            return Err(SessionError::Api {
                status: Some(status.as_u16()),
                code: body.code,
                message: body.message,
            });
        }
        res.json::<T>()
            .await
            .map_err(|e| SessionError::Transport(format!("decode failed: {e}")))
    }

    async fn decode_empty(
        res: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<(), SessionError> {
        let res = res.map_err(|e| SessionError::Transport(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body: ApiErrorBody = res.json().await.unwrap_or(ApiErrorBody {
                code: None,
                message: status.to_string(),
            });
            return Err(SessionError::Api {
                status: Some(status.as_u16()),
                code: body.code,
                message: body.message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeSession for RestSession {
    async fn renew(&self) -> Result<(), SessionError> {
        let payload = serde_json::json!({
            "account_id": self.config.account_id,
            "main_account_id": self.config.main_account_id,
            "signing_key": self.config.signing_key,
        });
        let res = self
            .request(reqwest::Method::POST, "/auth/renew")
            .json(&payload)
            .send()
            .await;
        Self::decode_empty(res).await
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<OrderView, SessionError> {
        let payload = serde_json::json!({
            "instrument": req.instrument,
            "side": req.side.to_string(),
            "limit_price": req.limit_price,
            "size": req.size,
            "client_id": req.client_id.to_string(),
            "post_only": true,
            "is_market": false,
            "reduce_only": false,
            "time_in_force": "good_till_time",
        });
        let res = self
            .request(reqwest::Method::POST, "/orders")
            .json(&payload)
            .send()
            .await;
        Self::decode(res).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), SessionError> {
        let res = self
            .request(reqwest::Method::DELETE, &format!("/orders/{order_id}"))
            .send()
            .await;
        Self::decode_empty(res).await
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderView, SessionError> {
        let res = self
            .request(reqwest::Method::GET, &format!("/orders/{order_id}"))
            .send()
            .await;
        Self::decode(res).await
    }

    async fn open_orders(&self) -> Result<Vec<OrderView>, SessionError> {
        let res = self
            .request(reqwest::Method::GET, "/orders?status=open")
            .send()
            .await;
        Self::decode(res).await
    }

    async fn positions(&self) -> Result<Vec<PositionView>, SessionError> {
        let res = self
            .request(reqwest::Method::GET, "/positions?kind=perpetual")
            .send()
            .await;
        Self::decode(res).await
    }

    async fn account_summary(&self) -> Result<AccountSummary, SessionError> {
        let res = self
            .request(reqwest::Method::GET, "/account/summary")
            .send()
            .await;
        Self::decode(res).await
    }

    async fn orderbook_top(&self, instrument: &str, depth: u32) -> Result<BookTop, SessionError> {
        let res = self
            .request(
                reqwest::Method::GET,
                &format!("/orderbook/{instrument}?depth={depth}"),
            )
            .send()
            .await;
        let levels: BookLevels = Self::decode(res).await?;
        let (Some(bid), Some(ask)) = (levels.bids.first(), levels.asks.first()) else {
            return Err(SessionError::Api {
                status: None,
                code: None,
                message: format!("empty orderbook for {instrument}"),
            });
        };
        Ok(BookTop {
            bid1: bid.price,
            ask1: ask.price,
            ts_ms: levels.ts_ms,
        })
    }

    async fn instrument(&self, instrument: &str) -> Result<InstrumentInfo, SessionError> {
        let res = self
            .request(reqwest::Method::GET, &format!("/instruments/{instrument}"))
            .send()
            .await;
        Self::decode(res).await
    }

    async fn active_instruments(&self) -> Result<Vec<String>, SessionError> {
        #[derive(Deserialize)]
        struct Entry {
            instrument: String,
        }
        let res = self
            .request(reqwest::Method::GET, "/instruments?active=true")
            .send()
            .await;
        let entries: Vec<Entry> = Self::decode(res).await?;
        Ok(entries.into_iter().map(|e| e.instrument).collect())
    }
}
