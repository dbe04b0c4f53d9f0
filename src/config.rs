// =============================================================================
// Runtime configuration — environment-driven, typed defaults
// =============================================================================
//
// Every tunable named in the external interfaces section lives here. Unlike
// the teacher's hot-reloadable JSON config, this system has no runtime
// mutation surface — configuration is read once at startup from the
// environment, with typed defaults so an unset variable never panics.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<bool>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    // --- pipeline gating -----------------------------------------------------
    pub smc_pipeline_enabled: bool,
    pub smc_runtime_params_limit: i64,
    pub smc_runtime_params_enabled: bool,
    pub smc_batch_size: usize,
    pub smc_max_assets_per_cycle: usize,
    pub smc_refresh_interval_sec: u64,
    pub smc_cycle_budget_ms: i64,

    // --- S2/S3 -----------------------------------------------------------
    pub smc_s2_stale_k: f64,
    pub smc_s3_requester_enabled: bool,
    pub smc_s3_poll_sec: u64,
    pub smc_s3_cooldown_sec: i64,
    pub smc_s3_commands_channel: String,

    // --- scheduling thresholds ---------------------------------------------
    pub min_ready_pct: f64,
    pub default_timeframe: String,
    pub default_lookback: i64,

    // --- broker repair channel ----------------------------------------------
    pub fxcm_commands_channel: String,
    pub fxcm_stale_lag_seconds: i64,

    // --- UI-only toggles (accepted, no-op here) ------------------------------
    pub smc_console_status_bar_enabled: bool,
    pub smc_viewer_ohlcv_frames_by_tf_enabled: bool,
    pub smc_viewer_ohlcv_frames_min_bars_by_tf: HashMap<String, i64>,

    // --- transport -----------------------------------------------------------
    pub redis_url: String,
    pub smc_viewer_bind_addr: String,
    pub smc_viewer_ws_bind_addr: String,

    // --- well-known Redis keys/channels ---------------------------------------
    pub channel_fxcm_status: String,
    pub channel_fxcm_ohlcv: String,
    pub channel_fxcm_price_tik: String,
    pub channel_smc_state: String,
    pub key_smc_snapshot: String,
    pub channel_viewer_extended: String,
    pub key_viewer_snapshot: String,

    pub allowed_pairs: Vec<String>,
    pub min_history_bars: i64,
    pub contract_1m_bars: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            smc_pipeline_enabled: true,
            smc_runtime_params_limit: 300,
            smc_runtime_params_enabled: true,
            smc_batch_size: 8,
            smc_max_assets_per_cycle: 0,
            smc_refresh_interval_sec: 5,
            smc_cycle_budget_ms: 2_000,

            smc_s2_stale_k: 3.0,
            smc_s3_requester_enabled: true,
            smc_s3_poll_sec: 60,
            smc_s3_cooldown_sec: 900,
            smc_s3_commands_channel: "fxcm:commands".to_string(),

            min_ready_pct: 0.8,
            default_timeframe: "5m".to_string(),
            default_lookback: 600,

            fxcm_commands_channel: "fxcm:commands".to_string(),
            fxcm_stale_lag_seconds: 60,

            smc_console_status_bar_enabled: false,
            smc_viewer_ohlcv_frames_by_tf_enabled: false,
            smc_viewer_ohlcv_frames_min_bars_by_tf: HashMap::new(),

            redis_url: "redis://127.0.0.1:6379".to_string(),
            smc_viewer_bind_addr: "0.0.0.0:8080".to_string(),
            smc_viewer_ws_bind_addr: "0.0.0.0:8081".to_string(),

            channel_fxcm_status: "fxcm:status".to_string(),
            channel_fxcm_ohlcv: "fxcm:ohlcv".to_string(),
            channel_fxcm_price_tik: "fxcm:price_tik".to_string(),
            channel_smc_state: "ui:smc_state".to_string(),
            key_smc_snapshot: "ui:smc_snapshot".to_string(),
            channel_viewer_extended: "ui:smc_viewer_extended".to_string(),
            key_viewer_snapshot: "ui:smc_viewer_snapshot".to_string(),

            allowed_pairs: vec!["XAUUSD".to_string(), "EURUSD".to_string()],
            min_history_bars: 300,
            contract_1m_bars: 2000,
        }
    }
}

impl RuntimeConfig {
    /// Load from the process environment, falling back to defaults for
    /// anything unset or unparsable.
    pub fn load_from_env() -> Result<Self> {
        let defaults = Self::default();

        let pairs_raw = std::env::var("SMC_ALLOWED_PAIRS").ok();
        let allowed_pairs = pairs_raw
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.allowed_pairs);

        let cfg = Self {
            smc_pipeline_enabled: env_bool("SMC_PIPELINE_ENABLED", defaults.smc_pipeline_enabled),
            smc_runtime_params_limit: env_i64(
                "SMC_RUNTIME_PARAMS_LIMIT",
                defaults.smc_runtime_params_limit,
            ),
            smc_runtime_params_enabled: env_bool(
                "SMC_RUNTIME_PARAMS_ENABLED",
                defaults.smc_runtime_params_enabled,
            ),
            smc_batch_size: env_i64("SMC_BATCH_SIZE", defaults.smc_batch_size as i64).max(1)
                as usize,
            smc_max_assets_per_cycle: env_i64(
                "SMC_MAX_ASSETS_PER_CYCLE",
                defaults.smc_max_assets_per_cycle as i64,
            )
            .max(0) as usize,
            smc_refresh_interval_sec: env_i64(
                "SMC_REFRESH_INTERVAL",
                defaults.smc_refresh_interval_sec as i64,
            )
            .max(1) as u64,
            smc_cycle_budget_ms: env_i64("SMC_CYCLE_BUDGET_MS", defaults.smc_cycle_budget_ms),

            smc_s2_stale_k: env_f64("SMC_S2_STALE_K", defaults.smc_s2_stale_k),
            smc_s3_requester_enabled: env_bool(
                "SMC_S3_REQUESTER_ENABLED",
                defaults.smc_s3_requester_enabled,
            ),
            smc_s3_poll_sec: env_i64("SMC_S3_POLL_SEC", defaults.smc_s3_poll_sec as i64).max(1)
                as u64,
            smc_s3_cooldown_sec: env_i64("SMC_S3_COOLDOWN_SEC", defaults.smc_s3_cooldown_sec),
            smc_s3_commands_channel: env_string(
                "SMC_S3_COMMANDS_CHANNEL",
                &defaults.smc_s3_commands_channel,
            ),

            min_ready_pct: env_f64("MIN_READY_PCT", defaults.min_ready_pct),
            default_timeframe: env_string("DEFAULT_TIMEFRAME", &defaults.default_timeframe),
            default_lookback: env_i64("DEFAULT_LOOKBACK", defaults.default_lookback),

            fxcm_commands_channel: env_string(
                "FXCM_COMMANDS_CHANNEL",
                &defaults.fxcm_commands_channel,
            ),
            fxcm_stale_lag_seconds: env_i64(
                "FXCM_STALE_LAG_SECONDS",
                defaults.fxcm_stale_lag_seconds,
            ),

            smc_console_status_bar_enabled: env_bool(
                "SMC_CONSOLE_STATUS_BAR_ENABLED",
                defaults.smc_console_status_bar_enabled,
            ),
            smc_viewer_ohlcv_frames_by_tf_enabled: env_bool(
                "SMC_VIEWER_OHLCV_FRAMES_BY_TF_ENABLED",
                defaults.smc_viewer_ohlcv_frames_by_tf_enabled,
            ),
            smc_viewer_ohlcv_frames_min_bars_by_tf: defaults
                .smc_viewer_ohlcv_frames_min_bars_by_tf
                .clone(),

            redis_url: env_string("REDIS_URL", &defaults.redis_url),
            smc_viewer_bind_addr: env_string("SMC_VIEWER_BIND_ADDR", &defaults.smc_viewer_bind_addr),
            smc_viewer_ws_bind_addr: env_string(
                "SMC_VIEWER_WS_BIND_ADDR",
                &defaults.smc_viewer_ws_bind_addr,
            ),

            channel_fxcm_status: defaults.channel_fxcm_status.clone(),
            channel_fxcm_ohlcv: defaults.channel_fxcm_ohlcv.clone(),
            channel_fxcm_price_tik: defaults.channel_fxcm_price_tik.clone(),
            channel_smc_state: defaults.channel_smc_state.clone(),
            key_smc_snapshot: defaults.key_smc_snapshot.clone(),
            channel_viewer_extended: defaults.channel_viewer_extended.clone(),
            key_viewer_snapshot: defaults.key_viewer_snapshot.clone(),

            allowed_pairs,
            min_history_bars: env_i64("SMC_MIN_HISTORY_BARS", defaults.min_history_bars),
            contract_1m_bars: env_i64("SMC_CONTRACT_1M_BARS", defaults.contract_1m_bars),
        };

        Ok(cfg)
    }

    /// `contract_1m_bars` converted to the bar count of a given timeframe:
    /// `ceil(contract_1m_bars / minutes_per_bar)`. Kept separate from
    /// `min_bars_for_tf` so S2/S3 can compare `bars_count` against the
    /// contract threshold independently of the desired-lookback threshold
    /// (spec §4.5 item 3's `ok`-but-below-`contract_bars` prefetch case needs
    /// both numbers, not their max).
    pub fn contract_bars_for_tf(&self, tf_ms: i64) -> i64 {
        let minutes_per_bar = (tf_ms / 60_000).max(1);
        (self.contract_1m_bars + minutes_per_bar - 1) / minutes_per_bar
    }

    /// Minimum bars required for a `(symbol, tf)` pair, per spec §4.5:
    /// `max(desired_limit, contract_bars_for_tf)`. Used for the store-tail
    /// fetch window (needs to cover the larger of the two thresholds); S2/S3
    /// gating itself uses `smc_runtime_params_limit` and
    /// `contract_bars_for_tf` separately.
    pub fn min_bars_for_tf(&self, tf_ms: i64) -> Result<i64> {
        Ok(self.smc_runtime_params_limit.max(self.contract_bars_for_tf(tf_ms)))
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.smc_batch_size, 8);
        assert_eq!(cfg.smc_s2_stale_k, 3.0);
        assert_eq!(cfg.smc_s3_cooldown_sec, 900);
        assert!(cfg.smc_pipeline_enabled);
    }

    #[test]
    fn min_bars_for_tf_takes_the_max() {
        let cfg = RuntimeConfig::default();
        // 1m: contract_bars = ceil(2000/1) = 2000 > limit(300)
        assert_eq!(cfg.min_bars_for_tf(60_000).unwrap(), 2000);
        // 5m: contract_bars = ceil(2000/5) = 400 > limit(300)
        assert_eq!(cfg.min_bars_for_tf(300_000).unwrap(), 400);
        // 1h: contract_bars = ceil(2000/60) = 34 < limit(300)
        assert_eq!(cfg.min_bars_for_tf(3_600_000).unwrap(), 300);
    }
}
