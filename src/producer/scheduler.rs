// =============================================================================
// SMC producer (C6) — scheduler and cycle
// =============================================================================
//
// Owns per-symbol `AssetState`; no external mutation. Cycle shape ported
// from `strategy.rs::evaluate_symbol` (per-symbol scoring call wrapped in a
// catch-and-continue) and `app_state.rs::build_snapshot` (single envelope
// assembled once per cycle, batched concurrency via join_all).
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::feed_state::FeedStateTracker;
use crate::history::{compute_history_status, HistoryState};
use crate::scenario_fsm::{RawInput, ScenarioFsm, Stage6Config};
use crate::store::BarStore;
use crate::types::Timeframe;

use super::engine::{EngineContext, Hint, SmcEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineState {
    Cold,
    Warmup,
    Live,
}

#[derive(Debug, Clone)]
struct Readiness {
    symbol: String,
    bars_count: usize,
    last_open_time_ms: Option<i64>,
    state: HistoryState,
    ready_min: bool,
    ready_target: bool,
}

/// Outcome of the readiness scan that precedes batch processing, shared by
/// the sync and async cycle entry points so both build the exact same
/// `CycleEnvelope` header fields.
enum CyclePrep {
    Idle {
        cycle_seq: i64,
        cycle_started_ts: i64,
        reason: String,
        total: usize,
    },
    Ready {
        cycle_seq: i64,
        cycle_started_ts: i64,
        tf: String,
        pipeline_state: PipelineState,
        ready_min_count: usize,
        ready_target_count: usize,
        total: usize,
        skipped_assets: Vec<String>,
        selected: Vec<Readiness>,
    },
}

#[derive(Debug, Clone)]
pub struct AssetState {
    pub symbol: String,
    pub paused: bool,
    pub last_hint: Option<Hint>,
}

impl AssetState {
    fn init_asset(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            paused: false,
            last_hint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AssetEnvelopeEntry {
    pub symbol: String,
    pub status: String,
    pub smc_hint_preserved: bool,
    pub structure: Option<Value>,
    pub liquidity: Option<Value>,
    pub zones: Option<Value>,
    pub execution: Option<Value>,
    pub meta: Value,
    pub scenario_id: String,
    pub scenario_confidence: f64,
    pub scenario_raw_id: String,
    pub scenario_raw_confidence: f64,
    pub scenario_raw_confidence_base: f64,
    pub scenario_pending_id: Option<String>,
    pub scenario_pending_count: u32,
    pub scenario_flip_reason: Option<String>,
    pub scenario_micro_ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleEnvelope {
    pub cycle_seq: i64,
    pub cycle_started_ts: i64,
    pub cycle_ready_ts: i64,
    pub cycle_duration_ms: i64,
    pub idle: bool,
    pub idle_reason: Option<String>,
    pub pipeline_state: PipelineState,
    pub ready_min: usize,
    pub ready_target: usize,
    pub total: usize,
    pub skipped_assets: Vec<String>,
    pub assets: Vec<AssetEnvelopeEntry>,
}

pub struct SmcProducer {
    cfg: Arc<RuntimeConfig>,
    store: Arc<BarStore>,
    feed_state: Arc<FeedStateTracker>,
    fsm: Arc<ScenarioFsm>,
    stage6_cfg: Stage6Config,
    engine: Arc<dyn SmcEngine>,
    assets: RwLock<HashMap<String, AssetState>>,
    cycle_seq: AtomicI64,
}

impl SmcProducer {
    pub fn new(
        cfg: Arc<RuntimeConfig>,
        store: Arc<BarStore>,
        feed_state: Arc<FeedStateTracker>,
        fsm: Arc<ScenarioFsm>,
        stage6_cfg: Stage6Config,
        engine: Arc<dyn SmcEngine>,
    ) -> Self {
        Self {
            cfg,
            store,
            feed_state,
            fsm,
            stage6_cfg,
            engine,
            assets: RwLock::new(HashMap::new()),
            cycle_seq: AtomicI64::new(0),
        }
    }

    /// Additions get `init_asset`; removals are paused, never deleted, per
    /// spec §9's "missing means pause, not delete" design note.
    pub fn refresh_fast_symbols(&self, fast_symbols: &[String]) {
        let mut assets = self.assets.write();
        let wanted: std::collections::HashSet<String> = fast_symbols
            .iter()
            .map(|s| s.to_ascii_uppercase())
            .collect();

        for symbol in &wanted {
            assets
                .entry(symbol.clone())
                .or_insert_with(|| AssetState::init_asset(symbol));
        }
        for (symbol, state) in assets.iter_mut() {
            state.paused = !wanted.contains(symbol);
        }
    }

    fn ok_for_compute(state: HistoryState, market_open: bool, ohlcv_degraded: bool) -> bool {
        match state {
            HistoryState::Ok => true,
            HistoryState::StaleTail => !market_open || ohlcv_degraded,
            _ => false,
        }
    }

    fn pipeline_state(ready_min: usize, ready_target: usize, total: usize) -> PipelineState {
        if ready_min == 0 {
            PipelineState::Cold
        } else if total > 0 && ready_target >= total {
            PipelineState::Live
        } else {
            PipelineState::Warmup
        }
    }

    /// Readiness scan shared by `run_cycle` and `run_cycle_async`: decides
    /// whether C1 wants this cycle skipped and, if not, which symbols are
    /// selected for batch processing this cycle.
    fn prepare_cycle(&self, now_ms: i64) -> CyclePrep {
        let cycle_started_ts = now_ms;
        let cycle_seq = self.cycle_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let verdict = self.feed_state.should_run_smc_cycle(now_ms);
        if verdict.decision == crate::feed_state::CycleDecision::Skip {
            return CyclePrep::Idle {
                cycle_seq,
                cycle_started_ts,
                reason: verdict.reason.to_string(),
                total: self.assets.read().len(),
            };
        }

        let feed = self.feed_state.snapshot();
        let market_open = feed.market_state == crate::types::MarketState::Open;
        let ohlcv_degraded = matches!(
            feed.ohlcv_state,
            crate::types::OhlcvState::Delayed | crate::types::OhlcvState::Down
        );

        let tf = self.cfg.default_timeframe.clone();
        let tf_ms = Timeframe::parse_ms(&tf).unwrap_or(300_000);
        let desired_limit = self.cfg.smc_runtime_params_limit;
        let min_bars = self.cfg.min_bars_for_tf(tf_ms).unwrap_or(desired_limit);

        let symbols: Vec<String> = {
            let assets = self.assets.read();
            assets
                .values()
                .filter(|a| !a.paused)
                .map(|a| a.symbol.clone())
                .collect()
        };
        let total = symbols.len();

        let mut readiness = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let tail = self.store.tail(symbol, &tf, desired_limit.max(min_bars) as usize);
            let status = compute_history_status(
                symbol,
                &tf,
                &tail,
                now_ms,
                min_bars,
                tf_ms,
                self.cfg.smc_s2_stale_k,
            );
            let ok = Self::ok_for_compute(status.state, market_open, ohlcv_degraded);
            readiness.push(Readiness {
                symbol: symbol.clone(),
                bars_count: status.bars_count,
                last_open_time_ms: status.last_open_time_ms,
                state: status.state,
                ready_min: ok && status.bars_count as i64 >= min_bars,
                ready_target: ok && status.bars_count as i64 >= desired_limit,
            });
        }

        let ready_min_count = readiness.iter().filter(|r| r.ready_min).count();
        let ready_target_count = readiness.iter().filter(|r| r.ready_target).count();
        let pipeline_state = Self::pipeline_state(ready_min_count, ready_target_count, total);

        let mut ready_symbols: Vec<Readiness> =
            readiness.into_iter().filter(|r| r.ready_min).collect();
        ready_symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let cap = self.cfg.smc_max_assets_per_cycle;
        let (selected, skipped): (Vec<Readiness>, Vec<Readiness>) = if cap == 0 {
            (ready_symbols, Vec::new())
        } else {
            let split = ready_symbols.len().min(cap);
            let tail = ready_symbols.split_off(split);
            (ready_symbols, tail)
        };

        let skipped_assets: Vec<String> = skipped.into_iter().map(|r| r.symbol).collect();

        CyclePrep::Ready {
            cycle_seq,
            cycle_started_ts,
            tf,
            pipeline_state,
            ready_min_count,
            ready_target_count,
            total,
            skipped_assets,
            selected,
        }
    }

    fn idle_envelope(cycle_seq: i64, cycle_started_ts: i64, reason: String, total: usize) -> CycleEnvelope {
        CycleEnvelope {
            cycle_seq,
            cycle_started_ts,
            cycle_ready_ts: cycle_started_ts,
            cycle_duration_ms: 0,
            idle: true,
            idle_reason: Some(reason),
            pipeline_state: PipelineState::Cold,
            ready_min: 0,
            ready_target: 0,
            total,
            skipped_assets: Vec::new(),
            assets: Vec::new(),
        }
    }

    /// Run exactly one cycle and return the envelope to publish. Batches are
    /// processed sequentially here; `run_cycle_async` is the concurrent
    /// entry point used by the production loop.
    pub fn run_cycle(&self, now_ms: i64) -> CycleEnvelope {
        match self.prepare_cycle(now_ms) {
            CyclePrep::Idle { cycle_seq, cycle_started_ts, reason, total } => {
                Self::idle_envelope(cycle_seq, cycle_started_ts, reason, total)
            }
            CyclePrep::Ready {
                cycle_seq,
                cycle_started_ts,
                tf,
                pipeline_state,
                ready_min_count,
                ready_target_count,
                total,
                skipped_assets,
                selected,
            } => {
                let mut assets_out = Vec::with_capacity(selected.len());
                for chunk in selected.chunks(self.cfg.smc_batch_size.max(1)) {
                    let entries: Vec<AssetEnvelopeEntry> = chunk
                        .iter()
                        .map(|r| {
                            self.process_symbol(
                                r.symbol.clone(),
                                r.bars_count,
                                r.last_open_time_ms,
                                r.state,
                                &tf,
                                now_ms,
                            )
                        })
                        .collect();
                    assets_out.extend(entries);
                }

                let cycle_ready_ts = now_ms;
                CycleEnvelope {
                    cycle_seq,
                    cycle_started_ts,
                    cycle_ready_ts,
                    cycle_duration_ms: (cycle_ready_ts - cycle_started_ts).max(0),
                    idle: false,
                    idle_reason: None,
                    pipeline_state,
                    ready_min: ready_min_count,
                    ready_target: ready_target_count,
                    total,
                    skipped_assets,
                    assets: assets_out,
                }
            }
        }
    }

    fn process_symbol(
        &self,
        symbol: String,
        bars_count: usize,
        last_open_time_ms: Option<i64>,
        history_state: HistoryState,
        tf: &str,
        now_ms: i64,
    ) -> AssetEnvelopeEntry {
        let _ = last_open_time_ms;
        if bars_count == 0 {
            return self.no_ohlcv_entry(&symbol, "SMC_NO_OHLCV");
        }

        let tail = self.store.tail(&symbol, tf, bars_count);
        let mut bars_by_tf = HashMap::new();
        bars_by_tf.insert(tf.to_string(), tail);

        let ctx = EngineContext {
            symbol: &symbol,
            tick_mid: None,
            bars_by_tf: &bars_by_tf,
            history_state: history_state.as_str(),
        };

        let new_hint = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.engine.compute_hint(&ctx)
        }))
        .unwrap_or_else(|_| {
            warn!(symbol = %symbol, "engine panicked computing hint, treated as SMC_ERROR");
            None
        });

        let mut assets = self.assets.write();
        let state = assets
            .entry(symbol.clone())
            .or_insert_with(|| AssetState::init_asset(&symbol));

        let (effective_hint, preserved) = match (&new_hint, &state.last_hint) {
            (Some(h), Some(prev)) if h.is_gated_empty() => {
                let mut merged = prev.clone();
                merged.meta = h.meta.clone();
                (Some(merged), true)
            }
            (Some(h), _) => (Some(h.clone()), false),
            (None, _) => (None, false),
        };

        if let Some(h) = &effective_hint {
            state.last_hint = Some(h.clone());
        }
        drop(assets);

        let Some(hint) = effective_hint else {
            return self.no_ohlcv_entry(&symbol, "SMC_ERROR");
        };

        let raw_id = if hint.meta.scenario_id.is_empty() {
            crate::scenario_fsm::UNCLEAR.to_string()
        } else {
            hint.meta.scenario_id.clone()
        };
        let input = RawInput {
            id: raw_id,
            confidence: hint.meta.scenario_confidence,
            telemetry: hint.meta.telemetry.clone(),
            micro: None,
        };
        let stage6 = self
            .fsm
            .apply(&symbol, input, &self.stage6_cfg, now_ms as f64 / 1000.0);

        AssetEnvelopeEntry {
            symbol,
            status: "ok".to_string(),
            smc_hint_preserved: preserved,
            structure: hint.structure,
            liquidity: hint.liquidity,
            zones: hint.zones,
            execution: hint.execution,
            meta: serde_json::json!({
                "tf_effective": hint.meta.tf_effective,
                "tf_health": hint.meta.tf_health,
                "gates": hint.meta.gates,
                "history_state": hint.meta.history_state,
                "bars_5m": hint.meta.bars_5m,
                "smc_hint_preserved": preserved,
            }),
            scenario_id: stage6.scenario_id,
            scenario_confidence: stage6.scenario_confidence,
            scenario_raw_id: stage6.scenario_raw_id,
            scenario_raw_confidence: stage6.scenario_raw_confidence,
            scenario_raw_confidence_base: stage6.scenario_raw_confidence_base,
            scenario_pending_id: stage6.scenario_pending_id,
            scenario_pending_count: stage6.scenario_pending_count,
            scenario_flip_reason: stage6.scenario_flip.map(|f| f.reason),
            scenario_micro_ok: stage6.scenario_micro_ok,
        }
    }

    fn no_ohlcv_entry(&self, symbol: &str, status: &str) -> AssetEnvelopeEntry {
        AssetEnvelopeEntry {
            symbol: symbol.to_string(),
            status: status.to_string(),
            smc_hint_preserved: false,
            structure: None,
            liquidity: None,
            zones: None,
            execution: None,
            meta: serde_json::json!({}),
            scenario_id: crate::scenario_fsm::UNCLEAR.to_string(),
            scenario_confidence: 0.0,
            scenario_raw_id: crate::scenario_fsm::UNCLEAR.to_string(),
            scenario_raw_confidence: 0.0,
            scenario_raw_confidence_base: 0.0,
            scenario_pending_id: None,
            scenario_pending_count: 0,
            scenario_flip_reason: None,
            scenario_micro_ok: false,
        }
    }

    /// Spec §4.6 step 5 / §5: symbols are processed in batches of
    /// `SMC_BATCH_SIZE` concurrently. Each chunk runs on its own blocking
    /// thread via `spawn_blocking` (the engine trait is synchronous — see
    /// `producer/engine.rs` — so the concurrency is thread-level, not async
    /// I/O) and `join_all` fans the chunks back in, preserving chunk order.
    pub async fn run_cycle_async(self: &Arc<Self>, now_ms: i64) -> CycleEnvelope {
        let (cycle_seq, cycle_started_ts, tf, pipeline_state, ready_min_count, ready_target_count, total, skipped_assets, selected) =
            match self.prepare_cycle(now_ms) {
                CyclePrep::Idle { cycle_seq, cycle_started_ts, reason, total } => {
                    return Self::idle_envelope(cycle_seq, cycle_started_ts, reason, total);
                }
                CyclePrep::Ready {
                    cycle_seq,
                    cycle_started_ts,
                    tf,
                    pipeline_state,
                    ready_min_count,
                    ready_target_count,
                    total,
                    skipped_assets,
                    selected,
                } => (
                    cycle_seq,
                    cycle_started_ts,
                    tf,
                    pipeline_state,
                    ready_min_count,
                    ready_target_count,
                    total,
                    skipped_assets,
                    selected,
                ),
            };

        let batch_size = self.cfg.smc_batch_size.max(1);
        let handles: Vec<_> = selected
            .chunks(batch_size)
            .map(|chunk| {
                let this = Arc::clone(self);
                let chunk = chunk.to_vec();
                let tf = tf.clone();
                tokio::task::spawn_blocking(move || {
                    chunk
                        .into_iter()
                        .map(|r| this.process_symbol(r.symbol, r.bars_count, r.last_open_time_ms, r.state, &tf, now_ms))
                        .collect::<Vec<AssetEnvelopeEntry>>()
                })
            })
            .collect();

        let mut assets_out = Vec::with_capacity(handles.len() * batch_size);
        for result in join_all(handles).await {
            match result {
                Ok(entries) => assets_out.extend(entries),
                Err(err) => warn!(error = %err, "smc batch task panicked, entries dropped for this batch"),
            }
        }

        let cycle_ready_ts = now_ms;
        CycleEnvelope {
            cycle_seq,
            cycle_started_ts,
            cycle_ready_ts,
            cycle_duration_ms: (cycle_ready_ts - cycle_started_ts).max(0),
            idle: false,
            idle_reason: None,
            pipeline_state,
            ready_min: ready_min_count,
            ready_target: ready_target_count,
            total,
            skipped_assets,
            assets: assets_out,
        }
    }

    pub fn log_cycle(&self, envelope: &CycleEnvelope) {
        if envelope.idle {
            info!(cycle_seq = envelope.cycle_seq, reason = ?envelope.idle_reason, "smc cycle idle");
        } else if envelope.cycle_duration_ms > self.cfg.smc_cycle_budget_ms {
            warn!(
                cycle_seq = envelope.cycle_seq,
                duration_ms = envelope.cycle_duration_ms,
                budget_ms = self.cfg.smc_cycle_budget_ms,
                "smc cycle exceeded budget"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::engine::NullEngine;

    fn producer() -> SmcProducer {
        let cfg = Arc::new(RuntimeConfig::default());
        let store = Arc::new(BarStore::new(5000));
        let feed_state = Arc::new(FeedStateTracker::new());
        feed_state.apply_status(
            crate::feed_state::StatusMessage {
                market: Some("open".to_string()),
                process: None,
                price: Some("ok".to_string()),
                ohlcv: Some("ok".to_string()),
                note: None,
                ts: Some(0),
                session: None,
            },
            0,
        );
        SmcProducer::new(
            cfg,
            store,
            feed_state,
            Arc::new(ScenarioFsm::new()),
            Stage6Config::default(),
            Arc::new(NullEngine),
        )
    }

    #[test]
    fn empty_fast_symbols_publishes_empty_assets_without_crashing() {
        let p = producer();
        let envelope = p.run_cycle(0);
        assert_eq!(envelope.total, 0);
        assert!(envelope.assets.is_empty());
    }

    #[test]
    fn removed_symbol_is_paused_not_deleted() {
        let p = producer();
        p.refresh_fast_symbols(&["XAUUSD".to_string()]);
        assert_eq!(p.assets.read().len(), 1);
        p.refresh_fast_symbols(&[]);
        assert_eq!(p.assets.read().len(), 1);
        assert!(p.assets.read().get("XAUUSD").unwrap().paused);
    }

    #[test]
    fn cycle_seq_strictly_increases() {
        let p = producer();
        let e1 = p.run_cycle(0);
        let e2 = p.run_cycle(1000);
        assert!(e2.cycle_seq > e1.cycle_seq);
    }

    #[test]
    fn pipeline_state_cold_when_no_ready_min() {
        assert_eq!(SmcProducer::pipeline_state(0, 0, 5), PipelineState::Cold);
        assert_eq!(SmcProducer::pipeline_state(5, 5, 5), PipelineState::Live);
        assert_eq!(SmcProducer::pipeline_state(2, 1, 5), PipelineState::Warmup);
    }

    #[test]
    fn max_assets_per_cycle_zero_means_no_cap() {
        let p = producer();
        p.refresh_fast_symbols(&["XAUUSD".to_string(), "EURUSD".to_string()]);
        for symbol in ["XAUUSD", "EURUSD"] {
            let bars: Vec<crate::types::Bar> = (0..400)
                .map(|i| crate::types::Bar {
                    open_time_ms: i * 300_000,
                    close_time_ms: i * 300_000 + 300_000,
                    open: 1.0,
                    high: 1.1,
                    low: 0.9,
                    close: 1.0,
                    volume: 1.0,
                    complete: Some(true),
                    synthetic: None,
                    source: None,
                })
                .collect();
            p.store.put_bars(symbol, "5m", bars);
        }
        let envelope = p.run_cycle(400 * 300_000);
        assert_eq!(envelope.assets.len(), 2);
        assert!(envelope.skipped_assets.is_empty());
    }
}
