// =============================================================================
// Shared value types — timeframe parsing, feed-state tokens
// =============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

/// A timeframe string (`1m`, `5m`, `15m`, `1h`, `4h`, `1d`) normalised to
/// milliseconds. Unknown formats fail to parse rather than guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe(pub i64);

impl Timeframe {
    /// Parse a timeframe string into milliseconds. Returns `None` for
    /// anything outside the fixed `1m/5m/15m/1h/4h/1d`-shaped table.
    pub fn parse_ms(raw: &str) -> Option<i64> {
        let tf = raw.trim().to_ascii_lowercase();
        if tf.is_empty() {
            return None;
        }
        let (value_raw, unit) = tf.split_at(tf.len() - 1);
        let value: i64 = value_raw.parse().ok()?;
        if value <= 0 {
            return None;
        }
        match unit {
            "m" => Some(value * 60_000),
            "h" => Some(value * 3_600_000),
            "d" => Some(value * 86_400_000),
            _ => None,
        }
    }
}

/// Market-open token derived from broker status telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketState {
    Open,
    Closed,
    Unknown,
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketState::Open => "open",
            MarketState::Closed => "closed",
            MarketState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl MarketState {
    pub fn from_token(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => MarketState::Open,
            "closed" => MarketState::Closed,
            _ => MarketState::Unknown,
        }
    }
}

/// Price-feed health token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceState {
    Ok,
    Lag,
    Down,
}

impl fmt::Display for PriceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PriceState::Ok => "ok",
            PriceState::Lag => "lag",
            PriceState::Down => "down",
        };
        write!(f, "{s}")
    }
}

impl PriceState {
    pub fn from_token(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ok" => PriceState::Ok,
            "lag" => PriceState::Lag,
            _ => PriceState::Down,
        }
    }
}

/// OHLCV-feed health token — diagnostic only, never blocks a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OhlcvState {
    Ok,
    Delayed,
    Down,
}

impl fmt::Display for OhlcvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OhlcvState::Ok => "ok",
            OhlcvState::Delayed => "delayed",
            OhlcvState::Down => "down",
        };
        write!(f, "{s}")
    }
}

impl OhlcvState {
    pub fn from_token(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ok" => OhlcvState::Ok,
            "delayed" => OhlcvState::Delayed,
            _ => OhlcvState::Down,
        }
    }
}

/// One OHLCV candle. Identity is `(symbol, tf, open_time_ms)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time_ms: i64,
    pub close_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub complete: Option<bool>,
    #[serde(default)]
    pub synthetic: Option<bool>,
    #[serde(default)]
    pub source: Option<String>,
}

impl Bar {
    /// True for all finite-valued, properly-ordered OHLC bars.
    pub fn is_well_formed(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
            && self.high >= self.open.max(self.close)
            && self.open.min(self.close) >= self.low
    }
}

/// Last-value tick cache entry. Ephemeral — never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub tick_ts: i64,
    pub snap_ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_timeframes() {
        assert_eq!(Timeframe::parse_ms("1m"), Some(60_000));
        assert_eq!(Timeframe::parse_ms("5m"), Some(300_000));
        assert_eq!(Timeframe::parse_ms("15m"), Some(900_000));
        assert_eq!(Timeframe::parse_ms("1h"), Some(3_600_000));
        assert_eq!(Timeframe::parse_ms("4h"), Some(14_400_000));
        assert_eq!(Timeframe::parse_ms("1d"), Some(86_400_000));
    }

    #[test]
    fn rejects_unknown_timeframes() {
        assert_eq!(Timeframe::parse_ms(""), None);
        assert_eq!(Timeframe::parse_ms("banana"), None);
        assert_eq!(Timeframe::parse_ms("0m"), None);
        assert_eq!(Timeframe::parse_ms("1w"), None);
    }

    #[test]
    fn bar_well_formed_rejects_inverted_hl() {
        let bar = Bar {
            open_time_ms: 0,
            close_time_ms: 60_000,
            open: 10.0,
            high: 9.0,
            low: 11.0,
            close: 10.0,
            volume: 1.0,
            complete: Some(true),
            synthetic: None,
            source: None,
        };
        assert!(!bar.is_well_formed());
    }
}
