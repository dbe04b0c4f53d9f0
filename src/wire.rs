// =============================================================================
// Wire validator (C2)
// =============================================================================
//
// Stateless parse+validate of inbound broker messages. Fails closed: returns
// `None` on hard violations, never raises. Unknown fields are simply not
// round-tripped since we only lift the fields the rest of the system reads —
// there is no requirement to echo the message back.
// =============================================================================

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::feed_state::{SessionInfo, StatusMessage};
use crate::types::Bar;

type HmacSha256 = Hmac<Sha256>;

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64().filter(|n| n.is_finite())
}

fn as_i64(v: &Value) -> Option<i64> {
    if let Some(i) = v.as_i64() {
        return Some(i);
    }
    v.as_f64().map(|f| f as i64)
}

/// Parse one bar out of a JSON object. Returns `None` if any required
/// numeric field is missing or non-finite.
fn parse_bar(v: &Value) -> Option<Bar> {
    let obj = v.as_object()?;
    let open = as_f64(obj.get("open")?)?;
    let high = as_f64(obj.get("high")?)?;
    let low = as_f64(obj.get("low")?)?;
    let close = as_f64(obj.get("close")?)?;
    let volume = as_f64(obj.get("volume")?)?;
    let open_time_ms = as_i64(obj.get("open_time")?)?;
    let close_time_ms = as_i64(obj.get("close_time")?)?;
    let complete = obj.get("complete").and_then(|b| b.as_bool());
    let synthetic = obj.get("synthetic").and_then(|b| b.as_bool());
    let source = obj
        .get("source")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string());

    Some(Bar {
        open_time_ms,
        close_time_ms,
        open,
        high,
        low,
        close,
        volume,
        complete,
        synthetic,
        source,
    })
}

/// A validated `fxcm:ohlcv` envelope: symbol, timeframe, and the subset of
/// bars that parsed cleanly. The whole message survives if at least one
/// valid bar remains; a bar missing any required numeric is dropped.
pub struct OhlcvEnvelope {
    pub symbol: String,
    pub tf: String,
    pub bars: Vec<Bar>,
    pub sig: Option<String>,
}

pub fn parse_ohlcv(raw: &Value) -> Option<OhlcvEnvelope> {
    let obj = raw.as_object()?;
    let symbol = obj.get("symbol")?.as_str()?.to_string();
    let tf = obj.get("tf")?.as_str()?.to_string();
    let bars_raw = obj.get("bars")?.as_array()?;

    let bars: Vec<Bar> = bars_raw.iter().filter_map(parse_bar).collect();
    if bars.is_empty() {
        return None;
    }

    let sig = obj.get("sig").and_then(|s| s.as_str()).map(str::to_string);

    Some(OhlcvEnvelope {
        symbol,
        tf,
        bars,
        sig,
    })
}

/// A validated `fxcm:price_tik` message — all fields required.
pub struct PriceTick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
    pub tick_ts: i64,
    pub snap_ts: i64,
}

pub fn parse_price_tick(raw: &Value) -> Option<PriceTick> {
    let obj = raw.as_object()?;
    Some(PriceTick {
        symbol: obj.get("symbol")?.as_str()?.to_string(),
        bid: as_f64(obj.get("bid")?)?,
        ask: as_f64(obj.get("ask")?)?,
        mid: as_f64(obj.get("mid")?)?,
        tick_ts: as_i64(obj.get("tick_ts")?)?,
        snap_ts: as_i64(obj.get("snap_ts")?)?,
    })
}

/// Any subset of `fxcm:status` fields is accepted; empty strings collapse
/// to absence. Only hard violation is a non-object payload.
pub fn parse_status(raw: &Value) -> Option<StatusMessage> {
    let obj = raw.as_object()?;

    let non_empty = |key: &str| -> Option<String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let session = obj.get("session").and_then(|s| s.as_object()).map(|s| {
        SessionInfo {
            name: s.get("name").and_then(|v| v.as_str()).map(str::to_string),
            state: s.get("state").and_then(|v| v.as_str()).map(str::to_string),
            seconds_to_close: s.get("seconds_to_close").and_then(as_i64),
            seconds_to_next_open: s.get("seconds_to_next_open").and_then(as_i64),
        }
    });

    Some(StatusMessage {
        market: non_empty("market"),
        process: non_empty("process"),
        price: non_empty("price"),
        ohlcv: non_empty("ohlcv"),
        note: non_empty("note"),
        ts: obj.get("ts").and_then(as_i64),
        session,
    })
}

/// Constant-time HMAC verification of an inbound payload's raw bytes
/// against the `sig` field, per spec §4.3 item 5.
pub fn verify_hmac(secret: &[u8], raw_bytes: &[u8], sig_hex: &str) -> bool {
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(raw_bytes);
    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_ohlcv_drops_bars_missing_required_numerics_keeps_rest() {
        let raw = json!({
            "symbol": "XAUUSD",
            "tf": "1m",
            "bars": [
                {"open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 10.0, "open_time": 1000, "close_time": 60000},
                {"open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "open_time": 1000, "close_time": 60000}
            ]
        });
        let env = parse_ohlcv(&raw).unwrap();
        assert_eq!(env.bars.len(), 1);
    }

    #[test]
    fn parse_ohlcv_all_bars_invalid_drops_whole_message() {
        let raw = json!({
            "symbol": "XAUUSD",
            "tf": "1m",
            "bars": [{"open": 1.0}]
        });
        assert!(parse_ohlcv(&raw).is_none());
    }

    #[test]
    fn parse_ohlcv_rejects_non_object() {
        assert!(parse_ohlcv(&json!([1, 2, 3])).is_none());
        assert!(parse_ohlcv(&json!({"tf": "1m", "bars": []})).is_none());
    }

    #[test]
    fn parse_price_tick_requires_all_fields() {
        let raw = json!({"symbol": "XAUUSD", "bid": 1.0, "ask": 1.1, "mid": 1.05, "tick_ts": 1, "snap_ts": 1});
        assert!(parse_price_tick(&raw).is_some());
        let missing = json!({"symbol": "XAUUSD", "bid": 1.0});
        assert!(parse_price_tick(&missing).is_none());
    }

    #[test]
    fn parse_status_empty_strings_collapse_to_absence() {
        let raw = json!({"market": "open", "price": "", "ohlcv": "ok"});
        let status = parse_status(&raw).unwrap();
        assert_eq!(status.market.as_deref(), Some("open"));
        assert_eq!(status.price, None);
        assert_eq!(status.ohlcv.as_deref(), Some("ok"));
    }

    #[test]
    fn hmac_roundtrip_verifies() {
        let secret = b"topsecret";
        let payload = b"{\"symbol\":\"XAUUSD\"}";
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(payload);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_hmac(secret, payload, &sig));
        assert!(!verify_hmac(secret, payload, "00"));
    }
}
