// =============================================================================
// Stage6 anti-flip FSM (C7)
// =============================================================================
//
// Scenario hysteresis: TTL + confirm-bars + switch-delta, with hard
// invalidation and strong-override paths that bypass both TTL and
// confirm-bars. Ported from `smc_state_manager.py`'s `apply_stage6_hysteresis`
// and pinned against every case in `test_smc_stage6_hysteresis.py`.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

pub const UNCLEAR: &str = "UNCLEAR";

#[derive(Debug, Clone)]
pub struct Stage6Config {
    pub ttl_sec: f64,
    pub confirm_bars: u32,
    pub switch_delta: f64,
    pub decay_to_unclear_after: u32,
    pub strong_conf: f64,
    pub strong_score_diff: f64,
    pub micro_confirm_enabled: bool,
    pub micro_ttl_sec: f64,
    pub micro_dmax_atr: f64,
    pub micro_boost: f64,
    pub micro_boost_partial: f64,
}

impl Default for Stage6Config {
    fn default() -> Self {
        Self {
            ttl_sec: 0.0,
            confirm_bars: 1,
            switch_delta: 0.05,
            decay_to_unclear_after: u32::MAX,
            strong_conf: 1.0,
            strong_score_diff: f64::INFINITY,
            micro_confirm_enabled: false,
            micro_ttl_sec: 60.0,
            micro_dmax_atr: 0.8,
            micro_boost: 0.05,
            micro_boost_partial: 0.02,
        }
    }
}

/// Raw hard-invalidation / override telemetry carried on the engine's hint,
/// read out of `meta.telemetry` by the caller before invoking the FSM.
#[derive(Debug, Clone, Default)]
pub struct RawTelemetry {
    pub hold_above_up: bool,
    pub bos_down: bool,
    pub failed_hold_up: bool,
    pub unclear_reason: Option<String>,
    /// `score[candidate_id]` used for strong-override score-diff.
    pub score: HashMap<String, f64>,
}

/// Micro-confirm execution-event context, extracted from the hint's
/// `execution` block by the caller.
#[derive(Debug, Clone)]
pub struct MicroConfirmContext {
    pub has_recent_execution_event: bool,
    pub event_age_sec: f64,
    pub confirmation_count: u32,
    pub price_distance_atr: f64,
    pub in_play: bool,
}

#[derive(Debug, Clone)]
pub struct RawInput {
    pub id: String,
    pub confidence: f64,
    pub telemetry: RawTelemetry,
    pub micro: Option<MicroConfirmContext>,
}

#[derive(Debug, Clone)]
pub struct ScenarioFlip {
    pub from: String,
    pub to: String,
    pub reason: String,
    pub ts: f64,
}

#[derive(Debug, Clone)]
pub struct Stage6Output {
    pub scenario_id: String,
    pub scenario_confidence: f64,
    pub scenario_raw_id: String,
    pub scenario_raw_confidence: f64,
    pub scenario_raw_confidence_base: f64,
    pub scenario_pending_id: Option<String>,
    pub scenario_pending_count: u32,
    pub scenario_flip: Option<ScenarioFlip>,
    pub scenario_micro_ok: bool,
}

#[derive(Debug, Clone)]
struct State {
    stable_id: String,
    stable_conf: f64,
    stable_since_ts: f64,
    pending_id: Option<String>,
    pending_count: u32,
    unclear_streak: u32,
    last_flip: Option<ScenarioFlip>,
}

/// Per-symbol Stage6 state, keyed by symbol. `RwLock<HashMap<..>>` mirrors
/// the regime detector's `RwLock<Option<RegimeState>>` single-instance
/// pattern, generalised to many symbols.
pub struct ScenarioFsm {
    states: RwLock<HashMap<String, State>>,
}

impl Default for ScenarioFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenarioFsm {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    fn micro_confirm_boost(cfg: &Stage6Config, micro: Option<&MicroConfirmContext>) -> (f64, bool) {
        if !cfg.micro_confirm_enabled {
            return (0.0, false);
        }
        let Some(ctx) = micro else {
            return (0.0, false);
        };
        if !ctx.has_recent_execution_event || !ctx.in_play {
            return (0.0, false);
        }
        if ctx.event_age_sec > cfg.micro_ttl_sec {
            return (0.0, false);
        }
        if ctx.price_distance_atr > cfg.micro_dmax_atr {
            return (0.0, false);
        }
        if ctx.confirmation_count >= 2 {
            (cfg.micro_boost, true)
        } else if ctx.confirmation_count == 1 {
            (cfg.micro_boost_partial, true)
        } else {
            (0.0, false)
        }
    }

    pub fn apply(&self, symbol: &str, input: RawInput, cfg: &Stage6Config, now_unix: f64) -> Stage6Output {
        let mut states = self.states.write();
        let key = symbol.to_ascii_uppercase();

        let confidence_base = input.confidence;
        let (boost, micro_ok) = Self::micro_confirm_boost(cfg, input.micro.as_ref());

        // Bootstrap: no stable state yet for this symbol.
        if !states.contains_key(&key) {
            states.insert(
                key.clone(),
                State {
                    stable_id: input.id.clone(),
                    stable_conf: input.confidence,
                    stable_since_ts: now_unix,
                    pending_id: None,
                    pending_count: 0,
                    unclear_streak: 0,
                    last_flip: None,
                },
            );
            return Stage6Output {
                scenario_id: input.id.clone(),
                scenario_confidence: input.confidence,
                scenario_raw_id: input.id.clone(),
                scenario_raw_confidence: confidence_base,
                scenario_raw_confidence_base: confidence_base,
                scenario_pending_id: None,
                scenario_pending_count: 0,
                scenario_flip: None,
                scenario_micro_ok: micro_ok,
            };
        }
        let state = states.get_mut(&key).expect("checked above");

        // UNCLEAR input: keep stable, track decay streak.
        if input.id == UNCLEAR {
            state.unclear_streak += 1;
            state.pending_id = None;
            state.pending_count = 0;

            if state.unclear_streak >= cfg.decay_to_unclear_after {
                let flip = ScenarioFlip {
                    from: state.stable_id.clone(),
                    to: UNCLEAR.to_string(),
                    reason: "decay".to_string(),
                    ts: now_unix,
                };
                state.stable_id = UNCLEAR.to_string();
                state.stable_conf = input.confidence;
                state.stable_since_ts = now_unix;
                state.unclear_streak = 0;
                state.last_flip = Some(flip.clone());
                return Stage6Output {
                    scenario_id: UNCLEAR.to_string(),
                    scenario_confidence: input.confidence,
                    scenario_raw_id: UNCLEAR.to_string(),
                    scenario_raw_confidence: confidence_base,
                    scenario_raw_confidence_base: confidence_base,
                    scenario_pending_id: None,
                    scenario_pending_count: 0,
                    scenario_flip: Some(flip),
                    scenario_micro_ok: micro_ok,
                };
            }

            return Stage6Output {
                scenario_id: state.stable_id.clone(),
                scenario_confidence: state.stable_conf,
                scenario_raw_id: UNCLEAR.to_string(),
                scenario_raw_confidence: confidence_base,
                scenario_raw_confidence_base: confidence_base,
                scenario_pending_id: None,
                scenario_pending_count: 0,
                scenario_flip: None,
                scenario_micro_ok: micro_ok,
            };
        }

        // Same as stable: reset pending/unclear, apply micro-confirm boost to
        // confidence only — never causes a switch by itself.
        if input.id == state.stable_id {
            state.unclear_streak = 0;
            state.pending_id = None;
            state.pending_count = 0;
            state.stable_conf = input.confidence;
            let boosted = (input.confidence + boost).min(1.0);
            return Stage6Output {
                scenario_id: state.stable_id.clone(),
                scenario_confidence: boosted,
                scenario_raw_id: input.id.clone(),
                scenario_raw_confidence: boosted,
                scenario_raw_confidence_base: confidence_base,
                scenario_pending_id: None,
                scenario_pending_count: 0,
                scenario_flip: None,
                scenario_micro_ok: micro_ok,
            };
        }

        // Different from stable.
        state.unclear_streak = 0;

        // Hard invalidation (a): 4_2 -> 4_3 with hold_above_up.
        if state.stable_id == "4_2" && input.id == "4_3" && input.telemetry.hold_above_up {
            let flip = ScenarioFlip {
                from: state.stable_id.clone(),
                to: input.id.clone(),
                reason: "hard_invalidation:hold_above_up".to_string(),
                ts: now_unix,
            };
            state.stable_id = input.id.clone();
            state.stable_conf = input.confidence;
            state.stable_since_ts = now_unix;
            state.pending_id = None;
            state.pending_count = 0;
            state.last_flip = Some(flip.clone());
            return Stage6Output {
                scenario_id: state.stable_id.clone(),
                scenario_confidence: state.stable_conf,
                scenario_raw_id: input.id.clone(),
                scenario_raw_confidence: confidence_base,
                scenario_raw_confidence_base: confidence_base,
                scenario_pending_id: None,
                scenario_pending_count: 0,
                scenario_flip: Some(flip),
                scenario_micro_ok: micro_ok,
            };
        }

        // Hard invalidation (b): stable=4_3, bos_down && !failed_hold_up -> UNCLEAR.
        if state.stable_id == "4_3"
            && input.telemetry.bos_down
            && !input.telemetry.failed_hold_up
        {
            let flip = ScenarioFlip {
                from: state.stable_id.clone(),
                to: UNCLEAR.to_string(),
                reason: "hard_invalidation:bos_down_no_failed_hold".to_string(),
                ts: now_unix,
            };
            state.stable_id = UNCLEAR.to_string();
            state.stable_conf = input.confidence;
            state.stable_since_ts = now_unix;
            state.pending_id = None;
            state.pending_count = 0;
            state.last_flip = Some(flip.clone());
            return Stage6Output {
                scenario_id: UNCLEAR.to_string(),
                scenario_confidence: state.stable_conf,
                scenario_raw_id: input.id.clone(),
                scenario_raw_confidence: confidence_base,
                scenario_raw_confidence_base: confidence_base,
                scenario_pending_id: None,
                scenario_pending_count: 0,
                scenario_flip: Some(flip),
                scenario_micro_ok: micro_ok,
            };
        }

        // Strong override: bypasses TTL and confirm-bars.
        let score_diff = input
            .telemetry
            .score
            .get(&input.id)
            .zip(input.telemetry.score.get(&state.stable_id))
            .map(|(a, b)| a - b)
            .unwrap_or(f64::NEG_INFINITY);
        if input.confidence >= cfg.strong_conf && score_diff >= cfg.strong_score_diff {
            let flip = ScenarioFlip {
                from: state.stable_id.clone(),
                to: input.id.clone(),
                reason: "strong_override".to_string(),
                ts: now_unix,
            };
            state.stable_id = input.id.clone();
            state.stable_conf = input.confidence;
            state.stable_since_ts = now_unix;
            state.pending_id = None;
            state.pending_count = 0;
            state.last_flip = Some(flip.clone());
            return Stage6Output {
                scenario_id: state.stable_id.clone(),
                scenario_confidence: state.stable_conf,
                scenario_raw_id: input.id.clone(),
                scenario_raw_confidence: confidence_base,
                scenario_raw_confidence_base: confidence_base,
                scenario_pending_id: None,
                scenario_pending_count: 0,
                scenario_flip: Some(flip),
                scenario_micro_ok: micro_ok,
            };
        }

        // Gated switch: track pending-candidate confirm count.
        if state.pending_id.as_deref() == Some(input.id.as_str()) {
            state.pending_count += 1;
        } else {
            state.pending_id = Some(input.id.clone());
            state.pending_count = 1;
        }

        let confidence_gate = input.confidence >= state.stable_conf + cfg.switch_delta;
        let confirm_gate = state.pending_count >= cfg.confirm_bars;
        let ttl_gate = now_unix - state.stable_since_ts >= cfg.ttl_sec;

        if confidence_gate && confirm_gate && ttl_gate {
            let flip = ScenarioFlip {
                from: state.stable_id.clone(),
                to: input.id.clone(),
                reason: "gated_switch".to_string(),
                ts: now_unix,
            };
            state.stable_id = input.id.clone();
            state.stable_conf = input.confidence;
            state.stable_since_ts = now_unix;
            state.pending_id = None;
            state.pending_count = 0;
            state.last_flip = Some(flip.clone());
            return Stage6Output {
                scenario_id: state.stable_id.clone(),
                scenario_confidence: state.stable_conf,
                scenario_raw_id: input.id.clone(),
                scenario_raw_confidence: confidence_base,
                scenario_raw_confidence_base: confidence_base,
                scenario_pending_id: None,
                scenario_pending_count: 0,
                scenario_flip: Some(flip),
                scenario_micro_ok: micro_ok,
            };
        }

        Stage6Output {
            scenario_id: state.stable_id.clone(),
            scenario_confidence: state.stable_conf,
            scenario_raw_id: input.id.clone(),
            scenario_raw_confidence: confidence_base,
            scenario_raw_confidence_base: confidence_base,
            scenario_pending_id: state.pending_id.clone(),
            scenario_pending_count: state.pending_count,
            scenario_flip: None,
            scenario_micro_ok: micro_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, confidence: f64) -> RawInput {
        RawInput {
            id: id.to_string(),
            confidence,
            telemetry: RawTelemetry::default(),
            micro: None,
        }
    }

    fn cfg(ttl_sec: f64, confirm_bars: u32, switch_delta: f64) -> Stage6Config {
        Stage6Config {
            ttl_sec,
            confirm_bars,
            switch_delta,
            ..Stage6Config::default()
        }
    }

    #[test]
    fn no_flip_without_confirm_bars() {
        let fsm = ScenarioFsm::new();
        let c = cfg(0.0, 2, 0.05);
        let out1 = fsm.apply("xauusd", raw("4_2", 0.75), &c, 1000.0);
        assert_eq!(out1.scenario_id, "4_2");

        let out2 = fsm.apply("xauusd", raw("4_3", 0.90), &c, 1001.0);
        assert_eq!(out2.scenario_id, "4_2");
        assert_eq!(out2.scenario_pending_id.as_deref(), Some("4_3"));
        assert_eq!(out2.scenario_pending_count, 1);

        let out3 = fsm.apply("xauusd", raw("4_3", 0.90), &c, 1002.0);
        assert_eq!(out3.scenario_id, "4_3");
        assert!(out3.scenario_flip.is_some());
    }

    #[test]
    fn ttl_blocks_flip_until_expired() {
        let fsm = ScenarioFsm::new();
        let c = cfg(10.0, 1, 0.01);
        fsm.apply("xauusd", raw("4_2", 0.80), &c, 2000.0);

        let out2 = fsm.apply("xauusd", raw("4_3", 0.95), &c, 2005.0);
        assert_eq!(out2.scenario_id, "4_2");

        let out3 = fsm.apply("xauusd", raw("4_3", 0.95), &c, 2011.0);
        assert_eq!(out3.scenario_id, "4_3");
    }

    #[test]
    fn unclear_does_not_override_stable() {
        let fsm = ScenarioFsm::new();
        let c = cfg(0.0, 1, 0.01);
        fsm.apply("xauusd", raw("4_2", 0.75), &c, 3000.0);
        let out2 = fsm.apply("xauusd", raw(UNCLEAR, 0.0), &c, 3001.0);
        assert_eq!(out2.scenario_id, "4_2");
        assert_eq!(out2.scenario_raw_id, UNCLEAR);
    }

    #[test]
    fn decay_to_unclear_after_n_unclear() {
        let fsm = ScenarioFsm::new();
        let c = Stage6Config {
            decay_to_unclear_after: 3,
            switch_delta: 0.05,
            ..Stage6Config::default()
        };
        fsm.apply("xauusd", raw("4_3", 0.70), &c, 4000.0);

        let out2 = fsm.apply("xauusd", raw(UNCLEAR, 0.0), &c, 4001.0);
        assert_eq!(out2.scenario_id, "4_3");
        let out3 = fsm.apply("xauusd", raw(UNCLEAR, 0.0), &c, 4002.0);
        assert_eq!(out3.scenario_id, "4_3");
        let out4 = fsm.apply("xauusd", raw(UNCLEAR, 0.0), &c, 4003.0);
        assert_eq!(out4.scenario_id, UNCLEAR);
        assert!(out4.scenario_flip.is_some());
    }

    #[test]
    fn strong_override_can_bypass_ttl() {
        let fsm = ScenarioFsm::new();
        let c = Stage6Config {
            ttl_sec: 100.0,
            confirm_bars: 1,
            switch_delta: 0.05,
            strong_conf: 0.86,
            strong_score_diff: 1.4,
            ..Stage6Config::default()
        };
        fsm.apply("xauusd", raw("4_3", 0.60), &c, 5000.0);

        let mut telemetry = RawTelemetry::default();
        telemetry.score.insert("4_2".to_string(), 6.0);
        telemetry.score.insert("4_3".to_string(), 2.0);
        telemetry.failed_hold_up = true;
        let input = RawInput {
            id: "4_2".to_string(),
            confidence: 0.92,
            telemetry,
            micro: None,
        };
        let out2 = fsm.apply("xauusd", input, &c, 5001.0);
        assert_eq!(out2.scenario_id, "4_2");
        assert!(out2.scenario_flip.is_some());
    }

    #[test]
    fn hard_invalidation_42_to_43_hold_above_bypasses_ttl() {
        let fsm = ScenarioFsm::new();
        let c = cfg(100.0, 2, 0.20);
        fsm.apply("xauusd", raw("4_2", 0.85), &c, 6000.0);

        let mut telemetry = RawTelemetry::default();
        telemetry.hold_above_up = true;
        let input = RawInput {
            id: "4_3".to_string(),
            confidence: 0.55,
            telemetry,
            micro: None,
        };
        let out2 = fsm.apply("xauusd", input, &c, 6001.0);
        assert_eq!(out2.scenario_id, "4_3");
        let flip = out2.scenario_flip.unwrap();
        assert!(flip.reason.starts_with("hard_invalidation:"));
    }

    #[test]
    fn hard_invalidation_43_to_unclear_on_bos_down_no_failed_hold() {
        let fsm = ScenarioFsm::new();
        let c = cfg(100.0, 2, 0.10);
        fsm.apply("xauusd", raw("4_3", 0.70), &c, 7000.0);

        let mut telemetry = RawTelemetry::default();
        telemetry.bos_down = true;
        telemetry.failed_hold_up = false;
        let input = RawInput {
            id: "4_2".to_string(),
            confidence: 0.95,
            telemetry,
            micro: None,
        };
        let out2 = fsm.apply("xauusd", input, &c, 7001.0);
        assert_eq!(out2.scenario_id, UNCLEAR);
        let flip = out2.scenario_flip.unwrap();
        assert_eq!(flip.reason, "hard_invalidation:bos_down_no_failed_hold");
    }

    #[test]
    fn micro_confirm_boosts_confidence_only() {
        let fsm = ScenarioFsm::new();
        let c = Stage6Config {
            ttl_sec: 0.0,
            confirm_bars: 1,
            switch_delta: 0.01,
            micro_confirm_enabled: true,
            micro_ttl_sec: 60.0,
            micro_dmax_atr: 0.80,
            micro_boost: 0.05,
            micro_boost_partial: 0.02,
            ..Stage6Config::default()
        };
        fsm.apply(
            "xauusd",
            raw("4_3", 0.70),
            &c,
            9_000.0,
        );

        let input = RawInput {
            id: "4_3".to_string(),
            confidence: 0.70,
            telemetry: RawTelemetry::default(),
            micro: Some(MicroConfirmContext {
                has_recent_execution_event: true,
                event_age_sec: 10.0,
                confirmation_count: 2,
                price_distance_atr: 0.1,
                in_play: true,
            }),
        };
        let out = fsm.apply("xauusd", input, &c, 10_000.0);
        assert_eq!(out.scenario_id, "4_3");
        assert_eq!(out.scenario_raw_id, "4_3");
        assert!(out.scenario_micro_ok);
        assert_eq!(out.scenario_raw_confidence_base, 0.70);
        assert!((out.scenario_raw_confidence - 0.75).abs() < 1e-9);
    }
}
