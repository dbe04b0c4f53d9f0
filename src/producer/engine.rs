// =============================================================================
// SMC engine boundary
// =============================================================================
//
// The analytic engine itself (`computeHint`) is out of scope — this trait is
// the seam the scheduler calls through. A real deployment wires a concrete
// implementation; tests use a stub. Grounded on the teacher's `strategy.rs`
// pattern of calling out to a scoring function and getting back a structured
// decision the caller never inspects beyond its declared shape.
// =============================================================================

use std::collections::HashMap;

use serde_json::Value;

use crate::scenario_fsm::RawTelemetry;
use crate::types::Bar;

/// Pre-compute guard codes surfaced on `meta.gates`, per the glossary's
/// Stage0 entry.
pub mod gate_codes {
    pub const NO_5M_DATA: &str = "NO_5M_DATA";
    pub const INSUFFICIENT_5M: &str = "INSUFFICIENT_5M";
    pub const STALE_5M: &str = "STALE_5M";
}

#[derive(Debug, Clone)]
pub struct EngineContext<'a> {
    pub symbol: &'a str,
    pub tick_mid: Option<f64>,
    pub bars_by_tf: &'a HashMap<String, Vec<Bar>>,
    pub history_state: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct HintMeta {
    pub tf_effective: String,
    pub tf_health: String,
    pub gates: Vec<String>,
    pub history_state: String,
    pub bars_5m: usize,
    pub telemetry: RawTelemetry,
    pub scenario_id: String,
    pub scenario_confidence: f64,
}

#[derive(Debug, Clone)]
pub struct Hint {
    pub structure: Option<Value>,
    pub liquidity: Option<Value>,
    pub zones: Option<Value>,
    pub execution: Option<Value>,
    pub meta: HintMeta,
}

impl Hint {
    /// A hint is gated-empty when the core blocks all returned `null` and
    /// `meta.gates` is non-empty, per spec §4.6 item 5's preservation rule.
    pub fn is_gated_empty(&self) -> bool {
        self.structure.is_none()
            && self.liquidity.is_none()
            && self.zones.is_none()
            && !self.meta.gates.is_empty()
    }
}

pub trait SmcEngine: Send + Sync {
    fn compute_hint(&self, ctx: &EngineContext) -> Option<Hint>;
}

/// Deterministic stub used where no real engine is wired (tests, and any
/// deployment that only needs the data plane around a pluggable brain).
pub struct NullEngine;

impl SmcEngine for NullEngine {
    fn compute_hint(&self, _ctx: &EngineContext) -> Option<Hint> {
        None
    }
}
