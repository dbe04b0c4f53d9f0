// =============================================================================
// Warmup/backfill requester (C5 / "S3")
// =============================================================================
//
// Periodic loop: for each (symbol, tf) in the allow-list, consult C4 and
// emit a rate-limited repair command. Ported from
// `fxcm_warmup_requester.py::_run_once`, generalised from a single asyncio
// loop to a tokio interval task.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::history::{HistoryState, HistoryStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CooldownKey {
    symbol: String,
    tf: String,
    cmd_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct FxcmStatusBlock {
    pub market: String,
    pub price: String,
    pub ohlcv: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmupCommand {
    #[serde(rename = "type")]
    pub cmd_type: String,
    pub symbol: String,
    pub tf: String,
    pub min_history_bars: i64,
    pub lookback_bars: i64,
    pub lookback_minutes: i64,
    pub reason: String,
    pub s2: S2Block,
    pub fxcm_status: FxcmStatusBlock,
}

#[derive(Debug, Clone, Serialize)]
pub struct S2Block {
    pub history_state: String,
    pub bars_count: usize,
    pub last_open_time_ms: Option<i64>,
}

/// Last S3 decision recorded per `(symbol, tf)`, exposed only as a read
/// accessor for operator tooling — no console-bar wiring (SPEC_FULL §11).
#[derive(Debug, Clone)]
pub struct LastDecision {
    pub cmd_type: Option<String>,
    pub reason: String,
    pub emitted: bool,
}

pub struct WarmupRequester {
    cooldown_sec: i64,
    last_emitted_ms: RwLock<HashMap<CooldownKey, i64>>,
    last_decisions: RwLock<HashMap<(String, String), LastDecision>>,
    prefetch_sizes: RwLock<HashMap<(String, String), i64>>,
}

impl WarmupRequester {
    pub fn new(cooldown_sec: i64) -> Self {
        Self {
            cooldown_sec,
            last_emitted_ms: RwLock::new(HashMap::new()),
            last_decisions: RwLock::new(HashMap::new()),
            prefetch_sizes: RwLock::new(HashMap::new()),
        }
    }

    fn rate_limit_ok(&self, key: &CooldownKey, now_ms: i64) -> bool {
        let guard = self.last_emitted_ms.read();
        match guard.get(key) {
            Some(last) => now_ms - last >= self.cooldown_sec * 1000,
            None => true,
        }
    }

    fn mark_emitted(&self, key: CooldownKey, now_ms: i64) {
        self.last_emitted_ms.write().insert(key, now_ms);
    }

    /// Clear cooldown records for both command types once S2 reports `ok`
    /// for this `(symbol, tf)`, per spec §4.5 item 3.
    fn clear_active_issue(&self, symbol: &str, tf: &str) {
        let mut guard = self.last_emitted_ms.write();
        guard.remove(&CooldownKey {
            symbol: symbol.to_string(),
            tf: tf.to_string(),
            cmd_type: "fxcm_warmup",
        });
        guard.remove(&CooldownKey {
            symbol: symbol.to_string(),
            tf: tf.to_string(),
            cmd_type: "fxcm_backfill",
        });
        self.prefetch_sizes
            .write()
            .remove(&(symbol.to_string(), tf.to_string()));
    }

    /// Next prefetch request size: grows monotonically in `desired_limit`
    /// steps from whatever was last requested, capped at `contract_bars`.
    fn next_prefetch_size(&self, symbol: &str, tf: &str, desired_limit: i64, contract_bars: i64) -> i64 {
        let key = (symbol.to_string(), tf.to_string());
        let step = desired_limit.max(1);
        let mut guard = self.prefetch_sizes.write();
        let next = guard.get(&key).copied().unwrap_or(0) + step;
        let clamped = next.min(contract_bars.max(step));
        guard.insert(key, clamped);
        clamped
    }

    fn record_decision(&self, symbol: &str, tf: &str, cmd_type: Option<&str>, reason: &str, emitted: bool) {
        self.last_decisions.write().insert(
            (symbol.to_string(), tf.to_string()),
            LastDecision {
                cmd_type: cmd_type.map(str::to_string),
                reason: reason.to_string(),
                emitted,
            },
        );
    }

    pub fn last_decisions(&self) -> HashMap<(String, String), LastDecision> {
        self.last_decisions.read().clone()
    }

    /// Evaluate one `(symbol, tf)` pair. Returns `Some(command)` if a repair
    /// command should be published, `None` if the state is `ok` and fully
    /// provisioned (cooldown cleared) or the decision is rate-limited.
    ///
    /// `desired_limit` and `contract_bars` are passed separately (not
    /// pre-combined) so the `ok`-but-`bars_count < contract_bars` prefetch
    /// case (spec §4.5 item 3) stays reachable — combining them into one
    /// threshold upstream would make every `Ok` classification imply
    /// `bars_count >= contract_bars` by construction.
    pub fn evaluate(
        &self,
        symbol: &str,
        tf: &str,
        status: &HistoryStatus,
        desired_limit: i64,
        contract_bars: i64,
        default_lookback_minutes: i64,
        fxcm_status: FxcmStatusBlock,
        now_ms: i64,
    ) -> Option<WarmupCommand> {
        if status.state == HistoryState::Ok {
            if contract_bars > 0 && (status.bars_count as i64) < contract_bars {
                let size = self.next_prefetch_size(symbol, tf, desired_limit, contract_bars);
                return self.emit(
                    symbol,
                    tf,
                    status,
                    "fxcm_warmup",
                    "prefetch_history".to_string(),
                    size,
                    default_lookback_minutes,
                    fxcm_status,
                    now_ms,
                );
            }
            self.clear_active_issue(symbol, tf);
            self.record_decision(symbol, tf, None, "ok", false);
            return None;
        }

        let (cmd_type, reason): (&'static str, String) = match status.state {
            HistoryState::Insufficient => ("fxcm_warmup", "insufficient_history".to_string()),
            HistoryState::Unknown => ("fxcm_warmup", "history_unknown".to_string()),
            HistoryState::StaleTail | HistoryState::GappyTail | HistoryState::NonMonotonicTail => {
                // tf=="1m" always falls back to warmup; adapters rarely
                // implement 1m backfill.
                if tf.eq_ignore_ascii_case("1m") {
                    ("fxcm_warmup", status.state.as_str().to_string())
                } else {
                    ("fxcm_backfill", status.state.as_str().to_string())
                }
            }
            HistoryState::Ok => unreachable!("handled above"),
        };

        self.emit(
            symbol,
            tf,
            status,
            cmd_type,
            reason,
            desired_limit,
            default_lookback_minutes,
            fxcm_status,
            now_ms,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        symbol: &str,
        tf: &str,
        status: &HistoryStatus,
        cmd_type: &'static str,
        reason: String,
        min_history_bars: i64,
        default_lookback_minutes: i64,
        fxcm_status: FxcmStatusBlock,
        now_ms: i64,
    ) -> Option<WarmupCommand> {
        let key = CooldownKey {
            symbol: symbol.to_string(),
            tf: tf.to_string(),
            cmd_type,
        };

        if !self.rate_limit_ok(&key, now_ms) {
            debug!(symbol, tf, cmd_type, "S3 rate-limit skip");
            self.record_decision(symbol, tf, Some(cmd_type), &reason, false);
            return None;
        }

        self.mark_emitted(key, now_ms);
        self.record_decision(symbol, tf, Some(cmd_type), &reason, true);

        Some(WarmupCommand {
            cmd_type: cmd_type.to_string(),
            symbol: symbol.to_string(),
            tf: tf.to_string(),
            min_history_bars,
            lookback_bars: min_history_bars,
            lookback_minutes: default_lookback_minutes.max(min_history_bars),
            reason,
            s2: S2Block {
                history_state: status.state.as_str().to_string(),
                bars_count: status.bars_count,
                last_open_time_ms: status.last_open_time_ms,
            },
            fxcm_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryStatus;

    fn status(state: HistoryState, bars_count: usize) -> HistoryStatus {
        HistoryStatus {
            symbol: "XAUUSD".to_string(),
            tf: "1m".to_string(),
            bars_count,
            last_open_time_ms: None,
            age_ms: None,
            state,
            needs_warmup: state == HistoryState::Insufficient,
            needs_backfill: matches!(
                state,
                HistoryState::StaleTail | HistoryState::GappyTail | HistoryState::NonMonotonicTail
            ),
            gaps_count: 0,
            max_gap_ms: None,
            non_monotonic_count: 0,
        }
    }

    fn fxcm_status() -> FxcmStatusBlock {
        FxcmStatusBlock {
            market: "open".to_string(),
            price: "ok".to_string(),
            ohlcv: "ok".to_string(),
        }
    }

    #[test]
    fn insufficient_emits_warmup_once_then_cooldown_blocks() {
        let req = WarmupRequester::new(900);
        let s = status(HistoryState::Insufficient, 0);
        let cmd = req
            .evaluate("XAUUSD", "1m", &s, 2000, 2000, 2000, fxcm_status(), 0)
            .unwrap();
        assert_eq!(cmd.cmd_type, "fxcm_warmup");
        assert_eq!(cmd.reason, "insufficient_history");

        let again = req.evaluate("XAUUSD", "1m", &s, 2000, 2000, 2000, fxcm_status(), 60_000);
        assert!(again.is_none());
    }

    #[test]
    fn stale_1m_falls_back_to_warmup_not_backfill() {
        let req = WarmupRequester::new(900);
        let s = status(HistoryState::StaleTail, 2000);
        let cmd = req
            .evaluate("XAUUSD", "1m", &s, 2000, 2000, 2000, fxcm_status(), 0)
            .unwrap();
        assert_eq!(cmd.cmd_type, "fxcm_warmup");
        assert_eq!(cmd.reason, "stale_tail");
    }

    #[test]
    fn stale_5m_uses_backfill() {
        let req = WarmupRequester::new(900);
        let s = status(HistoryState::StaleTail, 2000);
        let cmd = req
            .evaluate("XAUUSD", "5m", &s, 400, 400, 2000, fxcm_status(), 0)
            .unwrap();
        assert_eq!(cmd.cmd_type, "fxcm_backfill");
    }

    #[test]
    fn ok_clears_cooldown() {
        let req = WarmupRequester::new(900);
        let insufficient = status(HistoryState::Insufficient, 0);
        req.evaluate("XAUUSD", "1m", &insufficient, 2000, 2000, 2000, fxcm_status(), 0);

        let ok = status(HistoryState::Ok, 2000);
        let result = req.evaluate("XAUUSD", "1m", &ok, 2000, 2000, 2000, fxcm_status(), 1_000);
        assert!(result.is_none());

        // Cooldown cleared means a fresh insufficient can emit immediately again.
        let cmd = req
            .evaluate("XAUUSD", "1m", &insufficient, 2000, 2000, 2000, fxcm_status(), 2_000)
            .unwrap();
        assert_eq!(cmd.cmd_type, "fxcm_warmup");
    }

    #[test]
    fn rate_limit_emit_count_bounded_by_interval_over_cooldown() {
        let req = WarmupRequester::new(100);
        let s = status(HistoryState::Insufficient, 0);
        let mut emitted = 0;
        for tick_ms in (0..1_000).step_by(50) {
            if req
                .evaluate("XAUUSD", "1m", &s, 2000, 2000, 2000, fxcm_status(), tick_ms)
                .is_some()
            {
                emitted += 1;
            }
        }
        // interval=1000ms, cooldown=100_000ms -> ceil(1000/100_000) = 1
        assert!(emitted <= 1);
    }

    #[test]
    fn unknown_state_emits_warmup_with_history_unknown_reason() {
        let req = WarmupRequester::new(900);
        let s = status(HistoryState::Unknown, 0);
        let cmd = req
            .evaluate("XAUUSD", "1m", &s, 2000, 2000, 2000, fxcm_status(), 0)
            .unwrap();
        assert_eq!(cmd.cmd_type, "fxcm_warmup");
        assert_eq!(cmd.reason, "history_unknown");
    }

    #[test]
    fn ok_below_contract_bars_emits_prefetch_history() {
        let req = WarmupRequester::new(900);
        // bars_count(150) is enough for desired_limit(100) but below contract(500).
        let s = status(HistoryState::Ok, 150);
        let cmd = req
            .evaluate("XAUUSD", "1m", &s, 100, 500, 100, fxcm_status(), 0)
            .unwrap();
        assert_eq!(cmd.cmd_type, "fxcm_warmup");
        assert_eq!(cmd.reason, "prefetch_history");
        assert_eq!(cmd.min_history_bars, 250); // first step grows by desired_limit
    }

    #[test]
    fn prefetch_request_size_grows_monotonically_until_contract_bars() {
        let req = WarmupRequester::new(0);
        let s = status(HistoryState::Ok, 150);
        let first = req
            .evaluate("XAUUSD", "1m", &s, 100, 500, 100, fxcm_status(), 0)
            .unwrap();
        assert_eq!(first.min_history_bars, 250);

        let second = req
            .evaluate("XAUUSD", "1m", &s, 100, 500, 100, fxcm_status(), 1)
            .unwrap();
        assert_eq!(second.min_history_bars, 350);

        // Once bars_count reaches contract_bars, cooldown/prefetch state resets.
        let ok = status(HistoryState::Ok, 500);
        let cleared = req.evaluate("XAUUSD", "1m", &ok, 100, 500, 100, fxcm_status(), 2);
        assert!(cleared.is_none());
    }
}
