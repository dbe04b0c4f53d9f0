// =============================================================================
// HTTP server (C10)
// =============================================================================
//
// Router construction ported from the teacher's `api/rest.rs` — CORS layer,
// shared `Arc<State>` extractor, JSON error bodies — re-targeted at the
// unauthenticated public surface this system actually exposes (no bearer
// auth: the Open Question resolution in SPEC_FULL.md §10.3 drops
// `api/auth.rs` entirely since nothing in the HTTP/WS surface table names a
// token). Static file serving is new: the teacher never served a SPA.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use metrics::{histogram, increment_counter};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::broadcaster::Broadcaster;
use crate::metrics::names;
use crate::store::BarStore;

pub const DEFAULT_OHLCV_LIMIT: usize = 600;
pub const MAX_OHLCV_LIMIT: usize = 2000;

pub struct HttpState {
    pub broadcaster: Arc<Broadcaster>,
    pub store: Arc<BarStore>,
    pub web_root: PathBuf,
    pub metrics_handle: PrometheusHandle,
}

async fn record_metrics(
    req: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut resp = next.run(req).await;

    resp.headers_mut().insert(
        header::HeaderName::from_static("connection"),
        HeaderValue::from_static("close"),
    );
    resp.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    resp.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    resp.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );

    increment_counter!(names::HTTP_REQUESTS_TOTAL, "path" => path.clone(), "status" => resp.status().as_u16().to_string());
    histogram!(names::HTTP_LATENCY_MS, start.elapsed().as_secs_f64() * 1000.0, "path" => path);
    resp
}

pub fn router(state: Arc<HttpState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let static_service = ServeDir::new(&state.web_root).not_found_service(
        tower::service_fn(|_req| async {
            Ok::<_, std::convert::Infallible>(
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": "not_found"})),
                )
                    .into_response(),
            )
        }),
    );

    Router::new()
        .route("/smc-viewer/snapshot", get(snapshot))
        .route("/smc-viewer/ohlcv", get(ohlcv))
        .route("/smc-viewer/stream", get(stream_not_implemented))
        .route("/favicon.ico", get(favicon))
        .route("/metrics", get(metrics_scrape))
        .fallback_service(static_service)
        .layer(middleware::from_fn(record_metrics))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub symbol: Option<String>,
}

async fn snapshot(
    State(state): State<Arc<HttpState>>,
    Query(q): Query<SnapshotQuery>,
) -> Response {
    match q.symbol {
        None => Json(state.broadcaster.snapshot_map()).into_response(),
        Some(symbol) => match state.broadcaster.symbol_state(&symbol) {
            Some(vs) => Json(vs).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "symbol_not_found", "symbol": symbol.to_ascii_uppercase()})),
            )
                .into_response(),
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct OhlcvQuery {
    pub symbol: Option<String>,
    pub tf: Option<String>,
    pub limit: Option<usize>,
    pub to_ms: Option<i64>,
}

async fn ohlcv(State(state): State<Arc<HttpState>>, Query(q): Query<OhlcvQuery>) -> Response {
    let (Some(symbol), Some(tf)) = (q.symbol, q.tf) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing_symbol_or_tf"})))
            .into_response();
    };

    let limit = q
        .limit
        .unwrap_or(DEFAULT_OHLCV_LIMIT)
        .clamp(1, MAX_OHLCV_LIMIT);

    let mut bars = state.store.tail(&symbol, &tf, limit);
    let to_ms = q.to_ms.or_else(|| replay_cursor_ms(&state.broadcaster, &symbol));
    if let Some(to_ms) = to_ms {
        bars.retain(|b| b.close_time_ms <= to_ms);
    }

    if state.store.count(&symbol, &tf) == 0 {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "symbol_not_found", "symbol": symbol.to_ascii_uppercase()})),
        )
            .into_response();
    }

    Json(json!({
        "symbol": symbol.to_ascii_uppercase(),
        "timeframe": tf.to_ascii_lowercase(),
        "limit": limit,
        "bars": bars,
    }))
    .into_response()
}

/// `to_ms` fallback per spec §4.10: when the caller omits it, consult the
/// symbol's viewer state `meta.replay_cursor_ms` instead of returning the
/// unbounded live tail.
fn replay_cursor_ms(broadcaster: &Broadcaster, symbol: &str) -> Option<i64> {
    broadcaster
        .symbol_state(symbol)?
        .meta?
        .get("replay_cursor_ms")?
        .as_i64()
}

async fn stream_not_implemented() -> Response {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({"error": "websocket_not_implemented"})),
    )
        .into_response()
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn metrics_scrape(State(state): State<Arc<HttpState>>) -> String {
    state.metrics_handle.render()
}

/// Catches any method other than GET/OPTIONS on routes axum would otherwise
/// 405 silently without a JSON body.
pub async fn method_not_allowed_fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({"error": "method_not_allowed"})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ohlcv_limit_clamped_to_bounds() {
        assert_eq!(0usize.clamp(1, MAX_OHLCV_LIMIT), 1);
        assert_eq!(5000usize.clamp(1, MAX_OHLCV_LIMIT), MAX_OHLCV_LIMIT);
        assert_eq!(DEFAULT_OHLCV_LIMIT.clamp(1, MAX_OHLCV_LIMIT), DEFAULT_OHLCV_LIMIT);
    }

    fn broadcaster_with_meta(meta: serde_json::Value) -> Broadcaster {
        let cfg = std::sync::Arc::new(crate::config::RuntimeConfig::default());
        let broadcaster = Broadcaster::new(cfg);
        broadcaster.process_envelope(&json!({
            "assets": [{"symbol": "xauusd", "meta": meta}]
        }));
        broadcaster
    }

    #[test]
    fn replay_cursor_ms_falls_back_to_viewer_state_meta() {
        let broadcaster = broadcaster_with_meta(json!({"replay_cursor_ms": 123_456}));
        assert_eq!(replay_cursor_ms(&broadcaster, "xauusd"), Some(123_456));
    }

    #[test]
    fn replay_cursor_ms_absent_when_meta_has_no_cursor() {
        let broadcaster = broadcaster_with_meta(json!({"smc_compute_kind": "close"}));
        assert_eq!(replay_cursor_ms(&broadcaster, "xauusd"), None);
    }
}
