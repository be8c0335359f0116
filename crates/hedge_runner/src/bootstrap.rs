use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use core_types::{AccountLabel, ExchangeSession};
use execution_perp::{AccountGateway, PaperExchange, RestSession, RestSessionConfig};
use hedge_policy::PolicySettings;
use observability::{init_metrics, init_tracing};
use risk_alerts::{AlertCenter, ChatGatewayConfig, ChatGatewaySink, NullSink};
use tokio::sync::Notify;

use crate::engine::{EngineCtx, HedgeEngine};
use crate::settings::{AccountCredentials, ExecutionMode, HedgeSettings};
use crate::status_api::{spawn_status_server, StatusState};
use crate::symbols::load_symbol_states;

pub async fn async_main() -> Result<()> {
    let settings = HedgeSettings::from_env()?;
    let _guards = init_tracing("hedge_runner", settings.log_dir.as_deref());
    let prometheus = init_metrics();

    let sink: Arc<dyn core_types::AlertSink> = match ChatGatewayConfig::from_env() {
        Some(config) => Arc::new(ChatGatewaySink::new(config)?),
        None => {
            tracing::warn!("chat alerts not fully configured: CHAT_ID/API_KEY missing");
            Arc::new(NullSink)
        }
    };
    let alerts = Arc::new(AlertCenter::new(sink));

    let gateway_a = build_gateway(&settings, AccountLabel::A)?;
    let gateway_b = build_gateway(&settings, AccountLabel::B)?;

    match gateway_a.preload_instruments().await {
        Ok(count) => tracing::info!(count, "preloaded active instruments"),
        Err(err) => {
            tracing::warn!(%err, "failed to preload instruments, continuing without alias map");
        }
    }

    let symbols = load_symbol_states(Path::new(&settings.symbols_file), &gateway_a)?;
    tracing::info!(
        symbols = %symbols.keys().cloned().collect::<Vec<_>>().join(","),
        loop_interval = ?settings.loop_interval,
        orderbook_depth = settings.orderbook_depth,
        single_order_diff_threshold = %settings.single_order_diff_threshold_usdt,
        post_only_max_retry = settings.post_only_max_retry,
        post_only_cooldown_sec = settings.post_only_cooldown_sec,
        partial_fill_timeout_sec = settings.partial_fill_timeout_sec,
        stuck_hours = settings.stuck_hours,
        mmr_alert_threshold = %settings.mmr_alert_threshold,
        "dual maker hedge starting"
    );

    let policy = PolicySettings {
        single_order_diff_threshold_usdt: settings.single_order_diff_threshold_usdt,
        ..PolicySettings::default()
    };
    let ctx = Arc::new(EngineCtx {
        gateway_a: Arc::new(gateway_a),
        gateway_b: Arc::new(gateway_b),
        alerts,
        settings: settings.clone(),
        policy,
    });
    let mut engine = HedgeEngine::new(ctx, symbols);

    spawn_status_server(
        settings.status_port,
        StatusState {
            status: engine.status_handle(),
            prometheus,
        },
    );

    let stop = Arc::new(AtomicBool::new(false));
    let stop_notify = Arc::new(Notify::new());
    spawn_signal_listener(stop.clone(), stop_notify.clone());

    engine.run(stop, stop_notify).await;
    tracing::info!("dual maker hedge stopped");
    Ok(())
}

fn build_gateway(settings: &HedgeSettings, label: AccountLabel) -> Result<AccountGateway> {
    let session: Arc<dyn ExchangeSession> = match settings.execution_mode {
        ExecutionMode::Paper => {
            tracing::warn!(account = %label, "paper execution mode, orders stay in-process");
            Arc::new(PaperExchange::new())
        }
        ExecutionMode::Live => {
            let creds = AccountCredentials::from_env(label)?;
            Arc::new(
                RestSession::new(RestSessionConfig {
                    base_url: settings.exchange_url.clone(),
                    api_key: creds.api_key,
                    signing_key: creds.signing_key,
                    account_id: creds.account_id,
                    main_account_id: crate::settings::main_account_id(),
                    timeout: settings.call_timeout,
                })
                .map_err(|e| anyhow::anyhow!(e.to_string()))
                .with_context(|| format!("building session for account {label}"))?,
            )
        }
    };
    Ok(AccountGateway::new(
        label,
        session,
        settings.orderbook_depth,
        settings.call_timeout,
    ))
}

fn spawn_signal_listener(stop: Arc<AtomicBool>, notify: Arc<Notify>) {
    tokio::spawn(async move {
        if let Err(err) = wait_for_stop_signal().await {
            tracing::error!(%err, "signal listener failed");
            return;
        }
        tracing::info!("stop signal received, shutting down at next loop boundary");
        stop.store(true, Ordering::SeqCst);
        notify.notify_waiters();
    });
}

#[cfg(unix)]
async fn wait_for_stop_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
