use std::time::Duration;

use anyhow::{bail, Context, Result};
use core_types::AccountLabel;
use rust_decimal::Decimal;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_string(name)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    match env_string(name) {
        Some(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        None => default,
    }
}

/// How account sessions are built: against the external exchange client, or
/// fully in-process for dry runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Live,
    Paper,
}

/// Engine settings, environment-driven with the documented defaults.
#[derive(Debug, Clone)]
pub struct HedgeSettings {
    pub loop_interval: Duration,
    pub orderbook_depth: u32,
    pub single_order_diff_threshold_usdt: Decimal,
    pub max_runtime_sec: u64,
    pub cancel_on_stop: bool,
    pub stop_keep_strategy_orders: usize,
    pub post_only_max_retry: u32,
    pub post_only_cooldown_sec: i64,
    pub partial_fill_timeout_sec: i64,
    pub stuck_hours: i64,
    pub mmr_alert_threshold: Decimal,
    pub symbols_file: String,
    pub status_port: u16,
    pub log_dir: Option<String>,
    pub execution_mode: ExecutionMode,
    pub exchange_url: String,
    pub call_timeout: Duration,
}

impl HedgeSettings {
    pub fn from_env() -> Result<Self> {
        let symbols_file =
            env_string("HEDGE_SYMBOLS_FILE").context("HEDGE_SYMBOLS_FILE is required")?;
        let execution_mode = match env_string("HEDGE_EXECUTION_MODE")
            .unwrap_or_else(|| "live".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "live" => ExecutionMode::Live,
            "paper" => ExecutionMode::Paper,
            other => bail!("unsupported HEDGE_EXECUTION_MODE: {other}"),
        };
        let orderbook_depth = {
            let depth: u32 = env_parse("HEDGE_ORDERBOOK_DEPTH", 10);
            if depth == 0 {
                10
            } else {
                depth
            }
        };
        Ok(Self {
            loop_interval: Duration::from_secs(env_parse("HEDGE_LOOP_INTERVAL_SEC", 2u64).max(1)),
            orderbook_depth,
            single_order_diff_threshold_usdt: env_string(
                "HEDGE_SINGLE_ORDER_DIFF_THRESHOLD_USDT",
            )
            .and_then(|v| v.parse::<Decimal>().ok())
            .unwrap_or_else(|| Decimal::new(20, 0)),
            max_runtime_sec: env_parse("HEDGE_MAX_RUNTIME_SEC", 0u64),
            cancel_on_stop: env_flag("HEDGE_CANCEL_ON_STOP", true),
            stop_keep_strategy_orders: env_parse("HEDGE_STOP_KEEP_STRATEGY_ORDERS", 0usize),
            post_only_max_retry: env_parse("HEDGE_POST_ONLY_MAX_RETRY", 5u32).max(1),
            post_only_cooldown_sec: env_parse("HEDGE_POST_ONLY_COOLDOWN_SEC", 300i64),
            partial_fill_timeout_sec: env_parse("HEDGE_PARTIAL_FILL_TIMEOUT_SEC", 1800i64),
            stuck_hours: env_parse("HEDGE_STUCK_HOURS", 6i64),
            mmr_alert_threshold: env_string("HEDGE_MMR_ALERT_THRESHOLD")
                .and_then(|v| v.parse::<Decimal>().ok())
                .unwrap_or_else(|| Decimal::new(70, 2)),
            symbols_file,
            status_port: env_parse("HEDGE_STATUS_PORT", 8080u16),
            log_dir: env_string("HEDGE_LOG_DIR"),
            execution_mode,
            exchange_url: env_string("HEDGE_EXCHANGE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9100".to_string()),
            call_timeout: Duration::from_secs(env_parse("HEDGE_CALL_TIMEOUT_SEC", 10u64).max(1)),
        })
    }

    pub fn partial_fill_timeout_ms(&self) -> i64 {
        self.partial_fill_timeout_sec * 1000
    }
}

/// Per-account credentials for the external exchange client.
#[derive(Debug, Clone)]
pub struct AccountCredentials {
    pub api_key: String,
    pub signing_key: String,
    pub account_id: String,
}

impl AccountCredentials {
    pub fn from_env(label: AccountLabel) -> Result<Self> {
        let api_key = env_string(&format!("HEDGE_API_KEY_{label}"))
            .with_context(|| format!("HEDGE_API_KEY_{label} is required"))?;
        let signing_key = env_string(&format!("HEDGE_PRIVATE_KEY_{label}"))
            .with_context(|| format!("HEDGE_PRIVATE_KEY_{label} is required"))?;
        let account_id = env_string(&format!("HEDGE_ACCOUNT_ID_{label}"))
            .with_context(|| format!("HEDGE_ACCOUNT_ID_{label} is required"))?;
        Ok(Self {
            api_key,
            signing_key,
            account_id,
        })
    }
}

/// The main-account id used by transfer and authentication flows.
pub fn main_account_id() -> Option<String> {
    env_string("HEDGE_MAIN_ACCOUNT_ID")
}
