// =============================================================================
// Broadcaster (C9)
// =============================================================================
//
// Subscribes to the producer's "smc_state" channel, runs C8 per asset, folds
// results into the process-wide snapshot, persists it, and republishes per
// symbol. Reconnect shape shared with the ingestor via `redis_bus`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use metrics::{histogram, increment_counter};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::metrics::names;
use crate::redis_bus;
use crate::viewer_state::{build_viewer_state, AssetHint, ViewerState, ViewerStateCache};

pub struct Broadcaster {
    cfg: Arc<RuntimeConfig>,
    caches: RwLock<HashMap<String, ViewerStateCache>>,
    snapshot: RwLock<HashMap<String, ViewerState>>,
}

impl Broadcaster {
    pub fn new(cfg: Arc<RuntimeConfig>) -> Self {
        Self {
            cfg,
            caches: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    pub fn snapshot_map(&self) -> HashMap<String, ViewerState> {
        self.snapshot.read().clone()
    }

    pub fn symbol_state(&self, symbol: &str) -> Option<ViewerState> {
        self.snapshot.read().get(&symbol.to_ascii_uppercase()).cloned()
    }

    fn asset_hint_from_entry(entry: &Value) -> Option<(String, AssetHint)> {
        let symbol = entry.get("symbol")?.as_str()?.to_ascii_uppercase();
        let meta = entry.get("meta").cloned().unwrap_or(Value::Null);
        let compute_kind = meta
            .get("smc_compute_kind")
            .and_then(|v| v.as_str())
            .unwrap_or("close")
            .to_string();

        let events = entry
            .get("events")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let zones = entry
            .get("zones")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|z| serde_json::from_value(z.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let pools = entry
            .get("liquidity")
            .and_then(|l| l.get("pools"))
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|p| serde_json::from_value(p.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let execution_events = entry
            .get("execution")
            .and_then(|e| e.get("events"))
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let fxcm_meta = entry.get("fxcm").cloned();
        let fxcm_block = entry.get("fxcm_block").cloned();
        let structure = entry.get("structure").cloned().filter(|v| !v.is_null());
        let scenario = Self::scenario_from_entry(entry);
        let hint_meta = entry.get("meta").cloned().filter(|v| !v.is_null());
        let pipeline_state = entry
            .get("pipeline_local")
            .and_then(|p| p.get("state"))
            .and_then(|v| v.as_str())
            .unwrap_or("COLD")
            .to_string();
        let ready_bars = entry
            .get("pipeline_local")
            .and_then(|p| p.get("ready_bars"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let required_bars = entry
            .get("pipeline_local")
            .and_then(|p| p.get("required_bars"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let required_bars_min = entry
            .get("pipeline_local")
            .and_then(|p| p.get("required_bars_min"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        Some((
            symbol,
            AssetHint {
                compute_kind,
                events,
                zones,
                pools,
                execution_events,
                fxcm_meta,
                fxcm_block,
                pipeline_state,
                ready_bars,
                required_bars,
                required_bars_min,
                structure,
                scenario,
                meta: hint_meta,
            },
        ))
    }

    /// Folds the producer's flat `scenario_*` fields (C6, spec §4.6 item 3
    /// "Returned per-symbol stats mirror the FSM for UI") into the nested
    /// `scenario` block the viewer state carries, per spec §3.
    fn scenario_from_entry(entry: &Value) -> Option<Value> {
        entry.get("scenario_id")?;
        Some(serde_json::json!({
            "scenario_id": entry.get("scenario_id").cloned().unwrap_or(Value::Null),
            "scenario_confidence": entry.get("scenario_confidence").cloned().unwrap_or(Value::Null),
            "scenario_raw_id": entry.get("scenario_raw_id").cloned().unwrap_or(Value::Null),
            "scenario_raw_confidence": entry.get("scenario_raw_confidence").cloned().unwrap_or(Value::Null),
            "scenario_raw_confidence_base": entry.get("scenario_raw_confidence_base").cloned().unwrap_or(Value::Null),
            "scenario_pending_id": entry.get("scenario_pending_id").cloned().unwrap_or(Value::Null),
            "scenario_pending_count": entry.get("scenario_pending_count").cloned().unwrap_or(Value::Null),
            "scenario_flip_reason": entry.get("scenario_flip_reason").cloned().unwrap_or(Value::Null),
            "scenario_micro_ok": entry.get("scenario_micro_ok").cloned().unwrap_or(Value::Null),
        }))
    }

    /// Process one "smc_state" envelope, returning the symbols that changed
    /// and should be republished.
    pub fn process_envelope(&self, envelope: &Value) -> Vec<String> {
        let Some(assets) = envelope.get("assets").and_then(|a| a.as_array()) else {
            increment_counter!(names::VIEWER_ERRORS_TOTAL);
            return Vec::new();
        };

        let start = std::time::Instant::now();
        let mut updated = Vec::new();

        for entry in assets {
            let Some((symbol, hint)) = Self::asset_hint_from_entry(entry) else {
                increment_counter!(names::VIEWER_ERRORS_TOTAL);
                continue;
            };

            let mut caches = self.caches.write();
            let cache = caches.entry(symbol.clone()).or_default();
            let viewer_state = build_viewer_state(hint, cache);
            drop(caches);

            self.snapshot.write().insert(symbol.clone(), viewer_state);
            updated.push(symbol);
        }

        histogram!(names::VIEWER_BUILD_LATENCY_MS, start.elapsed().as_secs_f64() * 1000.0);
        updated
    }

    pub async fn run(&self) {
        let mut conn = redis_bus::connect_with_retry(&self.cfg.redis_url).await;

        if let Ok(Some(initial)) = redis_bus::get_json(&mut conn, &self.cfg.key_smc_snapshot).await
        {
            let updated = self.process_envelope(&initial);
            self.persist_and_publish(&mut conn, &updated).await;
        }

        loop {
            let mut pubsub =
                redis_bus::subscribe_with_retry(&self.cfg.redis_url, &self.cfg.channel_smc_state)
                    .await;
            info!(channel = %self.cfg.channel_smc_state, "broadcaster subscribed");
            let mut stream = pubsub.on_message();

            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                let Ok(envelope) = serde_json::from_str::<Value>(&payload) else {
                    increment_counter!(names::VIEWER_ERRORS_TOTAL);
                    continue;
                };

                let updated = self.process_envelope(&envelope);
                self.persist_and_publish(&mut conn, &updated).await;
            }

            warn!("broadcaster: pubsub stream ended, reconnecting");
        }
    }

    async fn persist_and_publish(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        updated_symbols: &[String],
    ) {
        let snapshot_value = serde_json::to_value(self.snapshot_map()).unwrap_or(Value::Null);
        if let Err(err) =
            redis_bus::set_json(conn, &self.cfg.key_viewer_snapshot, &snapshot_value).await
        {
            warn!(error = %err, "broadcaster: failed to persist viewer snapshot");
            increment_counter!(names::VIEWER_ERRORS_TOTAL);
        }

        for symbol in updated_symbols {
            if let Some(state) = self.symbol_state(symbol) {
                let message = serde_json::json!({ "symbol": symbol, "viewer_state": state });
                if let Err(err) =
                    redis_bus::publish_json(conn, &self.cfg.channel_viewer_extended, &message).await
                {
                    warn!(error = %err, symbol, "broadcaster: failed to publish viewer update");
                    increment_counter!(names::VIEWER_ERRORS_TOTAL);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processes_envelope_and_populates_snapshot() {
        let cfg = Arc::new(RuntimeConfig::default());
        let b = Broadcaster::new(cfg);
        let envelope = serde_json::json!({
            "assets": [
                {"symbol": "xauusd", "meta": {"smc_compute_kind": "close"}, "events": ["BOS_UP"]}
            ]
        });
        let updated = b.process_envelope(&envelope);
        assert_eq!(updated, vec!["XAUUSD".to_string()]);
        assert!(b.symbol_state("XAUUSD").is_some());
    }

    #[test]
    fn structure_and_scenario_survive_into_viewer_state() {
        let cfg = Arc::new(RuntimeConfig::default());
        let b = Broadcaster::new(cfg);
        let envelope = serde_json::json!({
            "assets": [{
                "symbol": "xauusd",
                "meta": {"smc_compute_kind": "close"},
                "structure": {"legs": [1, 2]},
                "scenario_id": "4_2",
                "scenario_confidence": 0.8,
                "scenario_raw_id": "4_2",
                "scenario_raw_confidence": 0.8,
                "scenario_raw_confidence_base": 0.8,
                "scenario_pending_id": null,
                "scenario_pending_count": 0,
                "scenario_flip_reason": null,
                "scenario_micro_ok": false,
            }]
        });
        b.process_envelope(&envelope);
        let state = b.symbol_state("XAUUSD").unwrap();
        assert_eq!(state.structure.unwrap()["legs"].as_array().unwrap().len(), 2);
        assert_eq!(state.scenario.unwrap()["scenario_id"], "4_2");
    }

    #[test]
    fn malformed_envelope_is_skipped_without_panic() {
        let cfg = Arc::new(RuntimeConfig::default());
        let b = Broadcaster::new(cfg);
        let updated = b.process_envelope(&serde_json::json!({"nonsense": true}));
        assert!(updated.is_empty());
    }

    #[test]
    fn applying_transform_twice_is_idempotent_snapshot_shape() {
        let cfg = Arc::new(RuntimeConfig::default());
        let b = Broadcaster::new(cfg);
        let envelope = serde_json::json!({
            "assets": [{"symbol": "xauusd", "meta": {"smc_compute_kind": "close"}}]
        });
        b.process_envelope(&envelope);
        let first = b.snapshot_map();
        b.process_envelope(&envelope);
        let second = b.snapshot_map();
        assert_eq!(first.keys().collect::<Vec<_>>(), second.keys().collect::<Vec<_>>());
    }
}
