use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone, Utc};
use core_types::{AccountLabel, AccountSummary, AlertSink};
use parking_lot::Mutex;
use rust_decimal::Decimal;

/// The daily report day rolls over on UTC+8 calendar days.
const REPORT_UTC_OFFSET_SECS: i32 = 8 * 3600;

pub const MMR_ALERT_COOLDOWN_SEC: i64 = 1800;
pub const STUCK_ALERT_COOLDOWN_SEC: i64 = 3600;

/// Chat-gateway transport settings, environment-driven.
#[derive(Debug, Clone)]
pub struct ChatGatewayConfig {
    pub url: String,
    pub chat_id: String,
    pub api_key: String,
}

impl ChatGatewayConfig {
    pub fn from_env() -> Option<Self> {
        let chat_id = std::env::var("CHAT_ID").ok().filter(|v| !v.trim().is_empty())?;
        let api_key = std::env::var("API_KEY").ok().filter(|v| !v.trim().is_empty())?;
        let url = std::env::var("CHAT_GATEWAY_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "http://localhost:3000/send-message".to_string());
        Some(Self {
            url,
            chat_id,
            api_key,
        })
    }
}

/// One HTTP POST per alert to the chat gateway. Failures surface as errors
/// and are logged by the alert centre, never retried within the tick.
pub struct ChatGatewaySink {
    config: ChatGatewayConfig,
    http: reqwest::Client,
}

impl ChatGatewaySink {
    pub fn new(config: ChatGatewayConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(6))
            .build()?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl AlertSink for ChatGatewaySink {
    async fn push(&self, message: &str) -> Result<()> {
        let payload = serde_json::json!({
            "chatId": self.config.chat_id,
            "message": message,
        });
        let res = self
            .http
            .post(&self.config.url)
            .header("X-API-Key", &self.config.api_key)
            .json(&payload)
            .send()
            .await?;
        if !res.status().is_success() {
            bail!("chat gateway responded {}", res.status());
        }
        Ok(())
    }
}

/// Sink for unconfigured deployments: alerts end up in the log only.
pub struct NullSink;

#[async_trait]
impl AlertSink for NullSink {
    async fn push(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Captures pushed messages, for tests.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn push(&self, message: &str) -> Result<()> {
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}

/// Deduplicated alert emission plus the periodic risk checks. The only
/// cross-instrument mutable state in the engine, so everything is behind
/// its own locks.
pub struct AlertCenter {
    sink: Arc<dyn AlertSink>,
    last_sent: Mutex<HashMap<String, i64>>,
    stuck_since: Mutex<HashMap<String, i64>>,
    last_daily_report_day: Mutex<Option<String>>,
}

impl AlertCenter {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            sink,
            last_sent: Mutex::new(HashMap::new()),
            stuck_since: Mutex::new(HashMap::new()),
            last_daily_report_day: Mutex::new(None),
        }
    }

    /// Send `title\nmessage` unless `key` fired within its cooldown.
    pub async fn notify(
        &self,
        title: &str,
        message: &str,
        key: &str,
        cooldown_sec: i64,
        now_ms: i64,
    ) {
        {
            let mut last_sent = self.last_sent.lock();
            if let Some(last) = last_sent.get(key) {
                if now_ms - last < cooldown_sec * 1000 {
                    return;
                }
            }
            last_sent.insert(key.to_string(), now_ms);
        }
        tracing::warn!(key, "{title} | {message}");
        metrics::counter!("hedge.alerts_sent").increment(1);
        if let Err(err) = self.sink.push(&format!("{title}\n{message}")).await {
            tracing::debug!(?err, key, "alert push failed");
        }
    }

    /// Maintenance-margin ratio check for one account.
    pub async fn check_mmr(
        &self,
        account: AccountLabel,
        summary: &AccountSummary,
        threshold: Decimal,
        now_ms: i64,
    ) {
        if summary.equity <= Decimal::ZERO {
            return;
        }
        let ratio = summary.maintenance_margin / summary.equity;
        if ratio < threshold {
            return;
        }
        let pct = (ratio * Decimal::ONE_HUNDRED).round_dp(2);
        self.notify(
            &format!("{account} MMR alert {pct}%"),
            &format!(
                "maintenance_margin={} equity={} threshold={}",
                summary.maintenance_margin, summary.equity, threshold
            ),
            &format!("mmr:{account}"),
            MMR_ALERT_COOLDOWN_SEC,
            now_ms,
        )
        .await;
    }

    /// Track the oldest unmatched lot per instrument and alert once it has
    /// been waiting longer than `stuck_hours`.
    pub async fn check_stuck_lots(
        &self,
        instrument: &str,
        earliest_unmatched_ts_ms: Option<i64>,
        stuck_hours: i64,
        now_ms: i64,
    ) {
        let Some(earliest) = earliest_unmatched_ts_ms else {
            self.stuck_since.lock().remove(instrument);
            return;
        };
        self.stuck_since
            .lock()
            .insert(instrument.to_string(), earliest);
        let age_ms = now_ms - earliest;
        if age_ms < stuck_hours * 3_600_000 {
            return;
        }
        let hours = age_ms as f64 / 3_600_000.0;
        self.notify(
            &format!("unhedged>{stuck_hours}h {instrument}"),
            &format!("oldest unmatched lot waiting {hours:.2}h"),
            &format!("stuck:{instrument}"),
            STUCK_ALERT_COOLDOWN_SEC,
            now_ms,
        )
        .await;
    }

    /// Once per UTC+8 calendar day, list every instrument still stuck.
    pub async fn maybe_send_daily_report(&self, stuck_hours: i64, now_ms: i64) {
        let offset = FixedOffset::east_opt(REPORT_UTC_OFFSET_SECS).expect("static offset");
        let Some(now_utc) = Utc.timestamp_millis_opt(now_ms).single() else {
            return;
        };
        let day_key = now_utc.with_timezone(&offset).format("%Y-%m-%d").to_string();
        if self.last_daily_report_day.lock().as_deref() == Some(day_key.as_str()) {
            return;
        }
        let lines: Vec<String> = {
            let stuck = self.stuck_since.lock();
            let mut lines: Vec<String> = stuck
                .iter()
                .filter_map(|(instrument, earliest)| {
                    let hours = (now_ms - earliest) as f64 / 3_600_000.0;
                    (hours >= stuck_hours as f64)
                        .then(|| format!("{instrument}: unhedged {hours:.2}h"))
                })
                .collect();
            lines.sort();
            lines
        };
        if lines.is_empty() {
            return;
        }
        *self.last_daily_report_day.lock() = Some(day_key);
        let body = format!("Daily stuck hedge report:\n{}", lines.join("\n"));
        tracing::warn!("{body}");
        if let Err(err) = self.sink.push(&body).await {
            tracing::debug!(?err, "daily report push failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn center() -> (AlertCenter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (AlertCenter::new(sink.clone()), sink)
    }

    #[tokio::test]
    async fn dedup_suppresses_within_cooldown() {
        let (center, sink) = center();
        center.notify("t", "m", "k", 300, 1_000).await;
        center.notify("t", "m", "k", 300, 200_000).await;
        assert_eq!(sink.messages().len(), 1);
        center.notify("t", "m", "k", 300, 302_000).await;
        assert_eq!(sink.messages().len(), 2);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share_cooldowns() {
        let (center, sink) = center();
        center.notify("t", "m", "a", 300, 1_000).await;
        center.notify("t", "m", "b", 300, 1_000).await;
        assert_eq!(sink.messages().len(), 2);
    }

    #[tokio::test]
    async fn mmr_alert_fires_at_threshold() {
        let (center, sink) = center();
        let healthy = AccountSummary {
            equity: dec!(1000),
            maintenance_margin: dec!(100),
            available_balance: dec!(900),
        };
        center
            .check_mmr(AccountLabel::A, &healthy, dec!(0.70), 1_000)
            .await;
        assert!(sink.messages().is_empty());

        let stressed = AccountSummary {
            equity: dec!(1000),
            maintenance_margin: dec!(700),
            available_balance: dec!(300),
        };
        center
            .check_mmr(AccountLabel::A, &stressed, dec!(0.70), 2_000)
            .await;
        assert_eq!(sink.messages().len(), 1);
        assert!(sink.messages()[0].contains("MMR"));
    }

    #[tokio::test]
    async fn stuck_alert_waits_for_threshold() {
        let (center, sink) = center();
        let six_hours_ms = 6 * 3_600_000;
        center
            .check_stuck_lots("BTC_USDT_Perp", Some(0), 6, six_hours_ms - 1)
            .await;
        assert!(sink.messages().is_empty());
        center
            .check_stuck_lots("BTC_USDT_Perp", Some(0), 6, six_hours_ms)
            .await;
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn matched_ledger_clears_stuck_state() {
        let (center, sink) = center();
        center.check_stuck_lots("BTC_USDT_Perp", Some(0), 6, 1_000).await;
        center.check_stuck_lots("BTC_USDT_Perp", None, 6, 2_000).await;
        center
            .maybe_send_daily_report(6, 7 * 3_600_000)
            .await;
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn daily_report_sends_once_per_day() {
        let (center, sink) = center();
        let now = 10 * 3_600_000;
        center.check_stuck_lots("BTC_USDT_Perp", Some(0), 6, now).await;
        center.maybe_send_daily_report(6, now).await;
        center.maybe_send_daily_report(6, now + 1_000).await;
        let reports: Vec<_> = sink
            .messages()
            .into_iter()
            .filter(|m| m.contains("Daily stuck hedge report"))
            .collect();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("BTC_USDT_Perp"));
    }
}
