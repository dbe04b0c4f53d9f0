// =============================================================================
// smc-viewer-dataplane — main entry point
// =============================================================================
//
// Starts every long-lived task: status/ohlcv ingestion, warmup/backfill
// requests, the SMC producer cycle, the viewer-state broadcaster, and the
// HTTP + WebSocket surfaces. Shutdown ported from the teacher's single
// `ctrl_c().await?` wait — no per-task config persistence here since this
// system has no runtime-mutable config to save.
// =============================================================================

mod api;
mod broadcaster;
mod config;
mod feed_state;
mod history;
mod ingestor;
mod metrics;
mod producer;
mod redis_bus;
mod scenario_fsm;
mod store;
mod types;
mod viewer_state;
mod warmup;
mod wire;

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{info, warn};

use crate::api::http::{router as http_router, HttpState};
use crate::api::ws::{ws_handler, WsHub, WsState};
use crate::broadcaster::Broadcaster;
use crate::config::RuntimeConfig;
use crate::feed_state::FeedStateTracker;
use crate::ingestor::Ingestor;
use crate::producer::{NullEngine, SmcProducer};
use crate::scenario_fsm::{ScenarioFsm, Stage6Config};
use crate::store::BarStore;
use crate::warmup::{FxcmStatusBlock, WarmupRequester};

const TIMEFRAMES: &[&str] = &["1m", "5m"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    config::init_tracing();

    info!("smc-viewer-dataplane starting up");

    let cfg = Arc::new(RuntimeConfig::load_from_env()?);
    let metrics_handle = crate::metrics::install();

    let store = Arc::new(BarStore::new(cfg.contract_1m_bars.max(1) as usize));
    let feed_state = Arc::new(FeedStateTracker::new());
    let fsm = Arc::new(ScenarioFsm::new());
    let engine: Arc<dyn crate::producer::SmcEngine> = Arc::new(NullEngine);

    let producer = Arc::new(SmcProducer::new(
        cfg.clone(),
        store.clone(),
        feed_state.clone(),
        fsm.clone(),
        Stage6Config::default(),
        engine,
    ));
    producer.refresh_fast_symbols(&cfg.allowed_pairs);

    let broadcaster = Arc::new(Broadcaster::new(cfg.clone()));
    let ws_hub = Arc::new(WsHub::new());
    let warmup_requester = Arc::new(WarmupRequester::new(cfg.smc_s3_cooldown_sec));

    // ── status listener ──────────────────────────────────────────────────
    {
        let cfg = cfg.clone();
        let feed_state = feed_state.clone();
        tokio::spawn(async move {
            loop {
                let mut pubsub =
                    redis_bus::subscribe_with_retry(&cfg.redis_url, &cfg.channel_fxcm_status)
                        .await;
                info!(channel = %cfg.channel_fxcm_status, "status listener subscribed");
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let Ok(payload) = msg.get_payload::<String>() else {
                        continue;
                    };
                    let Ok(value) = serde_json::from_str::<serde_json::Value>(&payload) else {
                        continue;
                    };
                    let Some(status) = wire::parse_status(&value) else {
                        continue;
                    };
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    feed_state.apply_status(status, now_ms);
                }
                warn!("status listener: pubsub stream ended, reconnecting");
            }
        });
    }

    // ── ingestor (C3) ────────────────────────────────────────────────────
    {
        let hmac_secret = std::env::var("FXCM_HMAC_SECRET").ok().map(String::into_bytes);
        let hmac_required = config_env_bool("FXCM_HMAC_REQUIRED", false);
        let ingestor = Ingestor::new(
            cfg.clone(),
            store.clone(),
            feed_state.clone(),
            TIMEFRAMES,
            hmac_secret,
            hmac_required,
        );
        tokio::spawn(async move { ingestor.run().await });
    }

    // ── warmup/backfill requester (C5) ───────────────────────────────────
    if cfg.smc_s3_requester_enabled {
        let cfg = cfg.clone();
        let store = store.clone();
        let feed_state = feed_state.clone();
        let warmup_requester = warmup_requester.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(cfg.smc_s3_poll_sec));
            loop {
                interval.tick().await;
                let feed = feed_state.snapshot();
                let fxcm_status = FxcmStatusBlock {
                    market: feed.market_state.to_string(),
                    price: feed.price_state.to_string(),
                    ohlcv: feed.ohlcv_state.to_string(),
                };
                let now_ms = chrono::Utc::now().timestamp_millis();

                let mut conn = None;
                for symbol in &cfg.allowed_pairs {
                    for tf in TIMEFRAMES {
                        let tf_ms = crate::types::Timeframe::parse_ms(tf).unwrap_or(60_000);
                        let desired_limit = cfg.smc_runtime_params_limit.max(1);
                        let contract_bars = cfg.contract_bars_for_tf(tf_ms);
                        let fetch_window = desired_limit.max(contract_bars).max(1) as usize;
                        let tail = store.tail(symbol, tf, fetch_window);
                        let status = crate::history::compute_history_status(
                            symbol,
                            tf,
                            &tail,
                            now_ms,
                            desired_limit,
                            tf_ms,
                            cfg.smc_s2_stale_k,
                        );
                        let Some(cmd) = warmup_requester.evaluate(
                            symbol,
                            tf,
                            &status,
                            desired_limit,
                            contract_bars,
                            cfg.default_lookback,
                            fxcm_status.clone(),
                            now_ms,
                        ) else {
                            continue;
                        };

                        if conn.is_none() {
                            conn = Some(redis_bus::connect_with_retry(&cfg.redis_url).await);
                        }
                        if let Some(c) = conn.as_mut() {
                            let value = serde_json::to_value(&cmd).unwrap_or(serde_json::Value::Null);
                            if let Err(err) =
                                redis_bus::publish_json(c, &cfg.smc_s3_commands_channel, &value).await
                            {
                                warn!(error = %err, symbol = %symbol, tf = %tf, "warmup requester: publish failed");
                            }
                        }
                    }
                }
            }
        });
    }

    // ── SMC producer cycle (C6) ──────────────────────────────────────────
    {
        let cfg = cfg.clone();
        let producer = producer.clone();
        tokio::spawn(async move {
            let mut conn = redis_bus::connect_with_retry(&cfg.redis_url).await;
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(cfg.smc_refresh_interval_sec));
            loop {
                interval.tick().await;
                let now_ms = chrono::Utc::now().timestamp_millis();
                let envelope = producer.run_cycle_async(now_ms).await;
                producer.log_cycle(&envelope);

                let value = serde_json::to_value(&envelope).unwrap_or(serde_json::Value::Null);
                if let Err(err) = redis_bus::set_json(&mut conn, &cfg.key_smc_snapshot, &value).await {
                    warn!(error = %err, "producer: failed to persist smc snapshot");
                }
                if let Err(err) = redis_bus::publish_json(&mut conn, &cfg.channel_smc_state, &value).await
                {
                    warn!(error = %err, "producer: failed to publish smc state");
                }
            }
        });
    }

    // ── broadcaster (C9) ─────────────────────────────────────────────────
    {
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move { broadcaster.run().await });
    }

    // ── websocket fan-out hub (C11) ──────────────────────────────────────
    {
        let ws_hub = ws_hub.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            ws_hub.run(&cfg.redis_url, &cfg.channel_viewer_extended).await;
        });
    }

    // ── HTTP server (C10) ────────────────────────────────────────────────
    {
        let web_root = std::env::var("SMC_VIEWER_WEB_ROOT").unwrap_or_else(|_| "web".to_string());
        let http_state = Arc::new(HttpState {
            broadcaster: broadcaster.clone(),
            store: store.clone(),
            web_root: web_root.into(),
            metrics_handle: metrics_handle.clone(),
        });
        let bind_addr = cfg.smc_viewer_bind_addr.clone();
        tokio::spawn(async move {
            let app = http_router(http_state);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind HTTP server");
            info!(addr = %bind_addr, "HTTP server listening");
            axum::serve(listener, app).await.expect("HTTP server failed");
        });
    }

    // ── WebSocket server (C11) ───────────────────────────────────────────
    {
        let ws_state = Arc::new(WsState {
            broadcaster: broadcaster.clone(),
            hub: ws_hub.clone(),
        });
        let bind_addr = cfg.smc_viewer_ws_bind_addr.clone();
        tokio::spawn(async move {
            let app = axum::Router::new()
                .route("/smc-viewer/stream", axum::routing::get(ws_handler))
                .with_state(ws_state);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind WS server");
            info!(addr = %bind_addr, "WebSocket server listening");
            axum::serve(listener, app).await.expect("WS server failed");
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    Ok(())
}

fn config_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<bool>().ok())
        .unwrap_or(default)
}
