// =============================================================================
// Bar store — ring-buffer time-series keyed by (symbol, tf)
// =============================================================================
//
// Adapted from the market-data candle buffer: a bounded VecDeque per key
// behind a single RwLock<HashMap<..>>. Single writer (the ingestor), many
// tail-query readers. `complete=false` bars are rejected here too, as a
// last line of defense even though the ingestor is expected to filter them
// first (Invariant 2).
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::types::Bar;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarKey {
    pub symbol: String,
    pub tf: String,
}

impl BarKey {
    pub fn new(symbol: impl Into<String>, tf: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().to_ascii_uppercase(),
            tf: tf.into().to_ascii_lowercase(),
        }
    }
}

pub struct BarStore {
    max_bars: usize,
    inner: RwLock<HashMap<BarKey, VecDeque<Bar>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    RejectedIncomplete,
    RejectedNonMonotonic,
}

impl BarStore {
    pub fn new(max_bars: usize) -> Self {
        Self {
            max_bars,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert validated bars for `(symbol, tf)`. `complete=false` bars are
    /// rejected (Invariant 2); bars with `open_time` not strictly greater
    /// than the current tail are rejected (Invariant 1) rather than
    /// silently reordering the buffer — callers should route those through
    /// S2 as a non-monotonic signal instead.
    pub fn put_bars(&self, symbol: &str, tf: &str, bars: Vec<Bar>) -> Vec<PutOutcome> {
        let key = BarKey::new(symbol, tf);
        let mut guard = self.inner.write();
        let deque = guard.entry(key).or_insert_with(VecDeque::new);

        let mut outcomes = Vec::with_capacity(bars.len());
        for bar in bars {
            if bar.complete == Some(false) {
                outcomes.push(PutOutcome::RejectedIncomplete);
                continue;
            }
            if let Some(last) = deque.back() {
                if bar.open_time_ms <= last.open_time_ms {
                    outcomes.push(PutOutcome::RejectedNonMonotonic);
                    continue;
                }
            }
            deque.push_back(bar);
            if deque.len() > self.max_bars {
                deque.pop_front();
            }
            outcomes.push(PutOutcome::Inserted);
        }
        outcomes
    }

    /// Most recent `limit` bars for `(symbol, tf)`, oldest first.
    pub fn tail(&self, symbol: &str, tf: &str, limit: usize) -> Vec<Bar> {
        let key = BarKey::new(symbol, tf);
        let guard = self.inner.read();
        match guard.get(&key) {
            Some(deque) => {
                let skip = deque.len().saturating_sub(limit);
                deque.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn count(&self, symbol: &str, tf: &str) -> usize {
        let key = BarKey::new(symbol, tf);
        self.inner.read().get(&key).map(VecDeque::len).unwrap_or(0)
    }

    pub fn last_close(&self, symbol: &str, tf: &str) -> Option<f64> {
        let key = BarKey::new(symbol, tf);
        self.inner
            .read()
            .get(&key)
            .and_then(|d| d.back())
            .map(|b| b.close)
    }

    pub fn last_open_time_ms(&self, symbol: &str, tf: &str) -> Option<i64> {
        let key = BarKey::new(symbol, tf);
        self.inner
            .read()
            .get(&key)
            .and_then(|d| d.back())
            .map(|b| b.open_time_ms)
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
            close: 1.05,
            volume: 1.0,
            complete: Some(true),
            synthetic: None,
            source: None,
        }
    }

    #[test]
    fn rejects_incomplete_bars() {
        let store = BarStore::new(10);
        let mut incomplete = bar(1000);
        incomplete.complete = Some(false);
        let outcomes = store.put_bars("XAUUSD", "1m", vec![incomplete]);
        assert_eq!(outcomes, vec![PutOutcome::RejectedIncomplete]);
        assert_eq!(store.count("XAUUSD", "1m"), 0);
    }

    #[test]
    fn rejects_non_monotonic_open_time() {
        let store = BarStore::new(10);
        store.put_bars("XAUUSD", "1m", vec![bar(2000)]);
        let outcomes = store.put_bars("XAUUSD", "1m", vec![bar(1000)]);
        assert_eq!(outcomes, vec![PutOutcome::RejectedNonMonotonic]);
        assert_eq!(store.count("XAUUSD", "1m"), 1);
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let store = BarStore::new(2);
        store.put_bars("XAUUSD", "1m", vec![bar(1000), bar(2000), bar(3000)]);
        assert_eq!(store.count("XAUUSD", "1m"), 2);
        let tail = store.tail("XAUUSD", "1m", 10);
        assert_eq!(tail[0].open_time_ms, 2000);
    }

    #[test]
    fn keys_are_case_normalised() {
        let store = BarStore::new(10);
        store.put_bars("xauusd", "1M", vec![bar(1000)]);
        assert_eq!(store.count("XAUUSD", "1m"), 1);
    }
}
