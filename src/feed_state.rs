// =============================================================================
// Feed-state tracker (C1)
// =============================================================================
//
// Single mutable snapshot of broker/market/price/ohlcv state, replaced
// atomically on every validated `fxcm:status` message. Single-writer
// (the status listener), many readers via `snapshot()`.
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{MarketState, OhlcvState, PriceState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: Option<String>,
    pub state: Option<String>,
    pub seconds_to_close: Option<i64>,
    pub seconds_to_next_open: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedState {
    pub market_state: MarketState,
    pub process_state: String,
    pub price_state: PriceState,
    pub ohlcv_state: OhlcvState,
    pub last_bar_close_ms: Option<i64>,
    pub lag_seconds: Option<i64>,
    pub next_open_utc: Option<String>,
    pub session: Option<SessionInfo>,
    pub status_ts: i64,
    pub note: Option<String>,
}

impl Default for FeedState {
    fn default() -> Self {
        Self {
            market_state: MarketState::Unknown,
            process_state: "unknown".to_string(),
            price_state: PriceState::Down,
            ohlcv_state: OhlcvState::Down,
            last_bar_close_ms: None,
            lag_seconds: None,
            next_open_utc: None,
            session: None,
            status_ts: 0,
            note: None,
        }
    }
}

/// Inbound, loosely-typed status message as validated by `wire.rs`.
#[derive(Debug, Clone, Default)]
pub struct StatusMessage {
    pub market: Option<String>,
    pub process: Option<String>,
    pub price: Option<String>,
    pub ohlcv: Option<String>,
    pub note: Option<String>,
    pub ts: Option<i64>,
    pub session: Option<SessionInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDecision {
    Run,
    Skip,
}

pub struct CycleVerdict {
    pub decision: CycleDecision,
    pub reason: &'static str,
}

pub struct FeedStateTracker {
    inner: RwLock<FeedState>,
}

impl Default for FeedStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedStateTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(FeedState::default()),
        }
    }

    /// Normalise and replace the snapshot atomically. Malformed input (none
    /// of the recognised fields present) is dropped and the prior snapshot
    /// survives, per spec §4.1's failure policy.
    pub fn apply_status(&self, msg: StatusMessage, now_ms: i64) {
        if msg.market.is_none()
            && msg.process.is_none()
            && msg.price.is_none()
            && msg.ohlcv.is_none()
            && msg.session.is_none()
        {
            warn!("dropping feed status message with no recognised fields");
            return;
        }

        let mut guard = self.inner.write();
        if let Some(market) = msg.market.as_deref() {
            guard.market_state = MarketState::from_token(market);
        }
        if let Some(process) = msg.process {
            guard.process_state = process;
        }
        if let Some(price) = msg.price.as_deref() {
            guard.price_state = PriceState::from_token(price);
        }
        if let Some(ohlcv) = msg.ohlcv.as_deref() {
            guard.ohlcv_state = OhlcvState::from_token(ohlcv);
        }
        if msg.note.is_some() {
            guard.note = msg.note;
        }
        if msg.session.is_some() {
            guard.session = msg.session;
        }
        guard.status_ts = msg.ts.unwrap_or(now_ms);
        Self::refresh_lag(&mut guard, now_ms);
    }

    /// Update `last_bar_close_ms` and refresh `lag_seconds`. Time never
    /// moves backward.
    pub fn note_bar_close(&self, close_time_ms: i64, now_ms: i64) {
        let mut guard = self.inner.write();
        if guard
            .last_bar_close_ms
            .map(|prev| close_time_ms > prev)
            .unwrap_or(true)
        {
            guard.last_bar_close_ms = Some(close_time_ms);
        }
        Self::refresh_lag(&mut guard, now_ms);
    }

    fn refresh_lag(state: &mut FeedState, now_ms: i64) {
        state.lag_seconds = state
            .last_bar_close_ms
            .map(|close_ms| ((now_ms - close_ms).max(0)) / 1000);
    }

    pub fn snapshot(&self) -> FeedState {
        self.inner.read().clone()
    }

    /// Decision table from spec §4.1.
    pub fn should_run_smc_cycle(&self, now_ms: i64) -> CycleVerdict {
        let state = self.inner.read();
        let status_age_sec = ((now_ms - state.status_ts).max(0)) / 1000;

        match state.market_state {
            MarketState::Closed => {
                if state.price_state == PriceState::Ok && status_age_sec <= 60 {
                    CycleVerdict {
                        decision: CycleDecision::Run,
                        reason: "fxcm_market_closed_but_ticks_ok",
                    }
                } else {
                    CycleVerdict {
                        decision: CycleDecision::Skip,
                        reason: "fxcm_market_closed",
                    }
                }
            }
            MarketState::Unknown => CycleVerdict {
                decision: CycleDecision::Run,
                reason: "fxcm_status_unknown",
            },
            MarketState::Open => {
                if state.price_state != PriceState::Ok {
                    CycleVerdict {
                        decision: CycleDecision::Skip,
                        reason: match state.price_state {
                            PriceState::Lag => "fxcm_price_lag",
                            _ => "fxcm_price_down",
                        },
                    }
                } else if state.ohlcv_state != OhlcvState::Ok {
                    CycleVerdict {
                        decision: CycleDecision::Run,
                        reason: match state.ohlcv_state {
                            OhlcvState::Delayed => "fxcm_ohlcv_delayed_ignored",
                            _ => "fxcm_ohlcv_down_ignored",
                        },
                    }
                } else {
                    CycleVerdict {
                        decision: CycleDecision::Run,
                        reason: "fxcm_ok",
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub fn reset_for_tests(&self) {
        *self.inner.write() = FeedState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(market: &str, price: &str, ohlcv: &str) -> StatusMessage {
        StatusMessage {
            market: Some(market.to_string()),
            process: None,
            price: Some(price.to_string()),
            ohlcv: Some(ohlcv.to_string()),
            note: None,
            ts: Some(0),
            session: None,
        }
    }

    #[test]
    fn market_closed_defaults_to_skip() {
        let tracker = FeedStateTracker::new();
        tracker.apply_status(status("closed", "down", "down"), 0);
        let verdict = tracker.should_run_smc_cycle(0);
        assert_eq!(verdict.decision, CycleDecision::Skip);
        assert_eq!(verdict.reason, "fxcm_market_closed");
    }

    #[test]
    fn market_closed_with_fresh_ticks_overrides_to_run() {
        let tracker = FeedStateTracker::new();
        tracker.apply_status(status("closed", "ok", "down"), 0);
        let verdict = tracker.should_run_smc_cycle(30_000);
        assert_eq!(verdict.decision, CycleDecision::Run);
        assert_eq!(verdict.reason, "fxcm_market_closed_but_ticks_ok");
    }

    #[test]
    fn market_open_with_bad_price_skips() {
        let tracker = FeedStateTracker::new();
        tracker.apply_status(status("open", "down", "ok"), 0);
        let verdict = tracker.should_run_smc_cycle(0);
        assert_eq!(verdict.decision, CycleDecision::Skip);
    }

    #[test]
    fn market_open_ok_price_bad_ohlcv_runs_with_ignored_reason() {
        let tracker = FeedStateTracker::new();
        tracker.apply_status(status("open", "ok", "delayed"), 0);
        let verdict = tracker.should_run_smc_cycle(0);
        assert_eq!(verdict.decision, CycleDecision::Run);
        assert_eq!(verdict.reason, "fxcm_ohlcv_delayed_ignored");
    }

    #[test]
    fn unknown_market_runs() {
        let tracker = FeedStateTracker::new();
        let verdict = tracker.should_run_smc_cycle(0);
        assert_eq!(verdict.decision, CycleDecision::Run);
        assert_eq!(verdict.reason, "fxcm_status_unknown");
    }

    #[test]
    fn malformed_status_is_dropped_and_prior_snapshot_survives() {
        let tracker = FeedStateTracker::new();
        tracker.apply_status(status("open", "ok", "ok"), 0);
        tracker.apply_status(StatusMessage::default(), 1_000);
        let snap = tracker.snapshot();
        assert_eq!(snap.market_state, MarketState::Open);
    }

    #[test]
    fn bar_close_never_moves_backward() {
        let tracker = FeedStateTracker::new();
        tracker.note_bar_close(10_000, 10_000);
        tracker.note_bar_close(5_000, 10_000);
        let snap = tracker.snapshot();
        assert_eq!(snap.last_bar_close_ms, Some(10_000));
    }
}
