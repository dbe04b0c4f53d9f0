// =============================================================================
// History classifier (C4 / "S2")
// =============================================================================
//
// Pure function over a tail window: no I/O, no mutable state. Ported from
// the original `classify_history`/`compute_history_status` pair, translated
// to Rust idiom.
// =============================================================================

use crate::types::Bar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    Ok,
    Insufficient,
    StaleTail,
    GappyTail,
    NonMonotonicTail,
    Unknown,
}

impl HistoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryState::Ok => "ok",
            HistoryState::Insufficient => "insufficient",
            HistoryState::StaleTail => "stale_tail",
            HistoryState::GappyTail => "gappy_tail",
            HistoryState::NonMonotonicTail => "non_monotonic_tail",
            HistoryState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStatus {
    pub symbol: String,
    pub tf: String,
    pub bars_count: usize,
    pub last_open_time_ms: Option<i64>,
    pub age_ms: Option<i64>,
    pub state: HistoryState,
    pub needs_warmup: bool,
    pub needs_backfill: bool,
    pub gaps_count: u32,
    pub max_gap_ms: Option<i64>,
    pub non_monotonic_count: u32,
}

/// Core classification, ignoring tail-walk gap/non-monotonic detection —
/// this mirrors `classify_history()` in the original exactly.
fn classify_core(
    now_ms: i64,
    bars_count: usize,
    last_open_time_ms: Option<i64>,
    min_history_bars: i64,
    tf_ms: i64,
    stale_k: f64,
) -> (HistoryState, bool, bool, Option<i64>) {
    let min_bars = if min_history_bars <= 0 { 0 } else { min_history_bars as usize };
    let tf_ms_safe = tf_ms.max(1);

    if bars_count < min_bars {
        return (HistoryState::Insufficient, true, false, None);
    }

    let Some(last_open_time_ms) = last_open_time_ms else {
        return (HistoryState::Unknown, false, false, None);
    };

    let age_ms = (now_ms - last_open_time_ms).max(0);
    let threshold_ms = (stale_k * tf_ms_safe as f64) as i64;
    if age_ms > threshold_ms {
        return (HistoryState::StaleTail, false, true, Some(age_ms));
    }

    (HistoryState::Ok, false, false, Some(age_ms))
}

/// Full S2 computation over an in-memory tail window (already bounded to
/// `min(desired_limit, contract_min)` bars by the caller). Bars are assumed
/// oldest-first, as returned by `BarStore::tail`.
pub fn compute_history_status(
    symbol: &str,
    tf: &str,
    tail: &[Bar],
    now_ms: i64,
    min_history_bars: i64,
    tf_ms: i64,
    stale_k: f64,
) -> HistoryStatus {
    let bars_count = tail.len();
    let last_open_time_ms = tail.last().map(|b| b.open_time_ms);

    let (mut state, mut needs_warmup, mut needs_backfill, age_ms) =
        classify_core(now_ms, bars_count, last_open_time_ms, min_history_bars, tf_ms, stale_k);

    let mut gaps_count: u32 = 0;
    let mut max_gap_ms: Option<i64> = None;
    let mut non_monotonic_count: u32 = 0;

    if bars_count >= 2 {
        let gap_threshold = (tf_ms.max(1) as f64 * 1.5) as i64;
        for window in tail.windows(2) {
            let delta = window[1].open_time_ms - window[0].open_time_ms;
            if delta < 0 {
                non_monotonic_count += 1;
            } else if delta > gap_threshold {
                gaps_count += 1;
                max_gap_ms = Some(max_gap_ms.map_or(delta, |m: i64| m.max(delta)));
            }
            // delta == 0 is ignored.
        }
    }

    // Precedence when tail is otherwise fresh: non_monotonic_tail > gappy_tail > ok.
    if state == HistoryState::Ok && non_monotonic_count > 0 {
        state = HistoryState::NonMonotonicTail;
        needs_warmup = false;
        needs_backfill = true;
    } else if state == HistoryState::Ok && gaps_count > 0 {
        state = HistoryState::GappyTail;
        needs_warmup = false;
        needs_backfill = true;
    }

    HistoryStatus {
        symbol: symbol.to_ascii_uppercase(),
        tf: tf.to_ascii_lowercase(),
        bars_count,
        last_open_time_ms,
        age_ms,
        state,
        needs_warmup,
        needs_backfill,
        gaps_count,
        max_gap_ms,
        non_monotonic_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time_ms: i64) -> Bar {
        Bar {
            open_time_ms,
            close_time_ms: open_time_ms + 60_000,
            open: 1.0,
            high: 1.1,
            low: 0.9,
            close: 1.0,
            volume: 1.0,
            complete: Some(true),
            synthetic: None,
            source: None,
        }
    }

    #[test]
    fn insufficient_when_below_minimum() {
        let tail = vec![bar(0)];
        let status = compute_history_status("xau", "1m", &tail, 0, 10, 60_000, 3.0);
        assert_eq!(status.state, HistoryState::Insufficient);
        assert!(status.needs_warmup);
    }

    #[test]
    fn exactly_min_history_bars_is_ok_not_insufficient() {
        let tail: Vec<Bar> = (0..10).map(|i| bar(i * 60_000)).collect();
        let status = compute_history_status("xau", "1m", &tail, 9 * 60_000, 10, 60_000, 3.0);
        assert_eq!(status.state, HistoryState::Ok);
    }

    #[test]
    fn stale_k_times_tf_ms_exactly_equal_age_is_ok_not_stale() {
        let tail = vec![bar(0), bar(60_000)];
        // age_ms = 3*60_000 = 180_000, threshold = stale_k*tf_ms = 180_000
        let status = compute_history_status("xau", "1m", &tail, 180_000 + 60_000, 2, 60_000, 3.0);
        assert_eq!(status.state, HistoryState::Ok);
    }

    #[test]
    fn stale_tail_when_age_exceeds_threshold() {
        let tail = vec![bar(0), bar(60_000)];
        let status = compute_history_status("xau", "1m", &tail, 300_000 + 60_000, 2, 60_000, 3.0);
        assert_eq!(status.state, HistoryState::StaleTail);
        assert!(status.needs_backfill);
    }

    #[test]
    fn unknown_when_last_open_time_missing() {
        let status = compute_history_status("xau", "1m", &[], 0, 0, 60_000, 3.0);
        assert_eq!(status.state, HistoryState::Unknown);
    }

    #[test]
    fn gappy_tail_detected_and_precedence_over_ok() {
        let tail = vec![bar(0), bar(60_000), bar(300_000)]; // delta 240_000 > 1.5*60_000
        let status = compute_history_status("xau", "1m", &tail, 300_000, 2, 60_000, 3.0);
        assert_eq!(status.state, HistoryState::GappyTail);
        assert_eq!(status.gaps_count, 1);
        assert!(status.needs_backfill);
    }

    #[test]
    fn non_monotonic_takes_precedence_over_gappy() {
        let tail = vec![bar(0), bar(300_000), bar(60_000)];
        let status = compute_history_status("xau", "1m", &tail, 300_000, 2, 60_000, 3.0);
        assert_eq!(status.state, HistoryState::NonMonotonicTail);
        assert_eq!(status.non_monotonic_count, 1);
    }

    #[test]
    fn zero_delta_is_ignored() {
        let tail = vec![bar(0), bar(0), bar(60_000)];
        let status = compute_history_status("xau", "1m", &tail, 60_000, 2, 60_000, 3.0);
        assert_eq!(status.state, HistoryState::Ok);
        assert_eq!(status.gaps_count, 0);
        assert_eq!(status.non_monotonic_count, 0);
    }
}
