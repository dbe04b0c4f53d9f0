// =============================================================================
// Ingestor (C3)
// =============================================================================
//
// Subscribes to the broker's ohlcv channel; validates, gates, and writes to
// the bar store. Reconnect shape ported from the market-data kline stream's
// subscribe/reconnect loop, generalised from a websocket client to a Redis
// pub/sub subscriber.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use metrics::{counter, increment_counter};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::feed_state::FeedStateTracker;
use crate::metrics::names;
use crate::redis_bus;
use crate::store::BarStore;
use crate::wire::{parse_ohlcv, verify_hmac};

pub struct Ingestor {
    cfg: Arc<RuntimeConfig>,
    store: Arc<BarStore>,
    feed_state: Arc<FeedStateTracker>,
    allow_list: HashSet<(String, String)>,
    hmac_secret: Option<Vec<u8>>,
    hmac_required: bool,
}

impl Ingestor {
    pub fn new(
        cfg: Arc<RuntimeConfig>,
        store: Arc<BarStore>,
        feed_state: Arc<FeedStateTracker>,
        timeframes: &[&str],
        hmac_secret: Option<Vec<u8>>,
        hmac_required: bool,
    ) -> Self {
        let allow_list = cfg
            .allowed_pairs
            .iter()
            .flat_map(|symbol| {
                timeframes
                    .iter()
                    .map(move |tf| (symbol.to_ascii_uppercase(), tf.to_ascii_lowercase()))
            })
            .collect();

        Self {
            cfg,
            store,
            feed_state,
            allow_list,
            hmac_secret,
            hmac_required,
        }
    }

    fn is_allowed(&self, symbol: &str, tf: &str) -> bool {
        self.allow_list
            .contains(&(symbol.to_ascii_uppercase(), tf.to_ascii_lowercase()))
    }

    /// Runs forever, reconnecting with backoff on transport error. Never
    /// returns except on a channel the caller cancels via task abort.
    pub async fn run(&self) {
        loop {
            let mut pubsub =
                redis_bus::subscribe_with_retry(&self.cfg.redis_url, &self.cfg.channel_fxcm_ohlcv)
                    .await;
            info!(channel = %self.cfg.channel_fxcm_ohlcv, "ingestor subscribed");
            let mut stream = pubsub.on_message();

            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(error = %err, "ingestor: non-string payload");
                        continue;
                    }
                };
                self.handle_message(&payload);
            }

            warn!("ingestor: pubsub stream ended, reconnecting");
        }
    }

    fn handle_message(&self, raw_payload: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw_payload) {
            Ok(v) => v,
            Err(_) => {
                increment_counter!(names::WIRE_ERRORS_TOTAL);
                return;
            }
        };

        let Some(envelope) = parse_ohlcv(&value) else {
            increment_counter!(names::WIRE_ERRORS_TOTAL);
            return;
        };

        if let Some(secret) = &self.hmac_secret {
            match &envelope.sig {
                Some(sig) if verify_hmac(secret, raw_payload.as_bytes(), sig) => {}
                _ if self.hmac_required => {
                    increment_counter!(names::INGESTOR_HMAC_REJECTED_TOTAL);
                    return;
                }
                _ => {}
            }
        }

        if !self.is_allowed(&envelope.symbol, &envelope.tf) {
            debug!(symbol = %envelope.symbol, tf = %envelope.tf, "ingestor: symbol/tf not in allow-list, dropping");
            return;
        }

        let feed = self.feed_state.snapshot();
        if feed.market_state == crate::types::MarketState::Closed {
            debug!("ingestor: market closed, dropping bars");
            return;
        }

        let bars: Vec<_> = envelope
            .bars
            .into_iter()
            .filter(|b| b.complete != Some(false))
            .collect();
        if bars.is_empty() {
            return;
        }

        let max_close = bars.iter().map(|b| b.close_time_ms).max();
        let outcomes = self
            .store
            .put_bars(&envelope.symbol, &envelope.tf, bars);

        let accepted = outcomes
            .iter()
            .filter(|o| **o == crate::store::PutOutcome::Inserted)
            .count();
        let dropped = outcomes.len() - accepted;
        counter!(names::INGESTOR_BARS_ACCEPTED_TOTAL, accepted as u64);
        if dropped > 0 {
            counter!(names::INGESTOR_BARS_DROPPED_TOTAL, dropped as u64);
        }

        if accepted > 0 {
            if let Some(close_ms) = max_close {
                let now_ms = chrono::Utc::now().timestamp_millis();
                self.feed_state.note_bar_close(close_ms, now_ms);
            }
        }
    }
}
