// =============================================================================
// Metrics (C12)
// =============================================================================
//
// Every counter/gauge/histogram named across §4.9-§4.11 and the error table
// in §7, registered once at startup and exported on `/metrics`. Grounded on
// the teacher's use of the `metrics` facade; the Prometheus exporter itself
// is an enrichment pulled in because this system's surface (HTTP+WS server)
// needs an actual scrape endpoint, unlike the teacher's fire-and-forget bot.
// =============================================================================

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

pub mod names {
    pub const WIRE_ERRORS_TOTAL: &str = "ai_one_smc_wire_errors_total";
    pub const INGESTOR_HMAC_REJECTED_TOTAL: &str = "ai_one_smc_ingestor_hmac_rejected_total";
    pub const INGESTOR_BARS_ACCEPTED_TOTAL: &str = "ai_one_smc_ingestor_bars_accepted_total";
    pub const INGESTOR_BARS_DROPPED_TOTAL: &str = "ai_one_smc_ingestor_bars_dropped_total";

    pub const S3_COMMANDS_EMITTED_TOTAL: &str = "ai_one_smc_s3_commands_emitted_total";
    pub const S3_RATE_LIMIT_SKIPPED_TOTAL: &str = "ai_one_smc_s3_rate_limit_skipped_total";

    pub const PRODUCER_CYCLE_DURATION_MS: &str = "ai_one_smc_producer_cycle_duration_ms";
    pub const PRODUCER_CYCLE_SKIPPED_TOTAL: &str = "ai_one_smc_producer_cycle_skipped_total";
    pub const PRODUCER_SYMBOL_ERRORS_TOTAL: &str = "ai_one_smc_producer_symbol_errors_total";

    pub const VIEWER_ERRORS_TOTAL: &str = "ai_one_smc_viewer_errors_total";
    pub const VIEWER_BUILD_LATENCY_MS: &str = "ai_one_smc_viewer_build_latency_ms";

    pub const HTTP_REQUESTS_TOTAL: &str = "ai_one_smc_viewer_http_requests_total";
    pub const HTTP_LATENCY_MS: &str = "ai_one_smc_viewer_http_latency_ms";

    pub const WS_CONNECTIONS: &str = "ai_one_smc_viewer_ws_connections";
    pub const WS_MESSAGES_TOTAL: &str = "ai_one_smc_viewer_ws_messages_total";
    pub const WS_ERRORS_TOTAL: &str = "ai_one_smc_viewer_ws_errors_total";
}
