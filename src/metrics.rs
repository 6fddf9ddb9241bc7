//! Prometheus metrics for admission decisions.
//!
//! Metrics are exposed via a dedicated HTTP listener on `METRICS_PORT`.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `admission_requests_total` - Admission outcomes (labels: stage, outcome)
//! - `admission_threats_total` - Threat findings (labels: category)
//! - `admission_weak_user_agent_total` - Requests with a missing/short User-Agent
//! - `admission_quota_decisions_total` - Quota checks (labels: policy, allowed, degraded)
//! - `admission_store_fallbacks_total` - Calls served by the local store (labels: reason)
//! - `admission_store_circuit_opens_total` - Times the shared-store breaker opened
//! - `admission_geo_decisions_total` - Country gate outcomes (labels: outcome)
//! - `admission_slow_responses_total` / `admission_large_responses_total`
//!
//! ## Histograms
//! - `admission_pipeline_duration_seconds` - Time spent in admission stages
//! - `admission_store_duration_seconds` - Shared-store round trip (labels: op)
//!
//! ## Gauges
//! - `admission_store_circuit_state` - Breaker state (0 = closed, 1 = half-open, 2 = open)
//! - `admission_local_quota_entries` - Live entries in the local quota store

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "admission_requests_total";
    pub const THREATS_TOTAL: &str = "admission_threats_total";
    pub const WEAK_USER_AGENT_TOTAL: &str = "admission_weak_user_agent_total";
    pub const QUOTA_DECISIONS_TOTAL: &str = "admission_quota_decisions_total";
    pub const STORE_FALLBACKS_TOTAL: &str = "admission_store_fallbacks_total";
    pub const STORE_CIRCUIT_OPENS_TOTAL: &str = "admission_store_circuit_opens_total";
    pub const GEO_DECISIONS_TOTAL: &str = "admission_geo_decisions_total";
    pub const SLOW_RESPONSES_TOTAL: &str = "admission_slow_responses_total";
    pub const LARGE_RESPONSES_TOTAL: &str = "admission_large_responses_total";
    pub const PIPELINE_DURATION_SECONDS: &str = "admission_pipeline_duration_seconds";
    pub const STORE_DURATION_SECONDS: &str = "admission_store_duration_seconds";
    pub const STORE_CIRCUIT_STATE: &str = "admission_store_circuit_state";
    pub const LOCAL_QUOTA_ENTRIES: &str = "admission_local_quota_entries";
}

/// Initialize the Prometheus metrics exporter.
///
/// Sets up metric descriptions and starts the Prometheus HTTP listener.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Admission outcomes by stage");
    describe_counter!(names::THREATS_TOTAL, "Threat findings by category");
    describe_counter!(
        names::WEAK_USER_AGENT_TOTAL,
        "Requests with a missing or very short User-Agent"
    );
    describe_counter!(names::QUOTA_DECISIONS_TOTAL, "Quota decisions by policy");
    describe_counter!(
        names::STORE_FALLBACKS_TOTAL,
        "Quota calls served by the process-local store while degraded"
    );
    describe_counter!(
        names::STORE_CIRCUIT_OPENS_TOTAL,
        "Times the shared-store circuit breaker opened"
    );
    describe_counter!(names::GEO_DECISIONS_TOTAL, "Country gate outcomes");
    describe_counter!(names::SLOW_RESPONSES_TOTAL, "Responses above the slow threshold");
    describe_counter!(names::LARGE_RESPONSES_TOTAL, "Responses above the size threshold");

    describe_histogram!(
        names::PIPELINE_DURATION_SECONDS,
        "Time spent in admission stages in seconds"
    );
    describe_histogram!(
        names::STORE_DURATION_SECONDS,
        "Shared quota store round trip in seconds"
    );

    describe_gauge!(
        names::STORE_CIRCUIT_STATE,
        "Shared-store breaker state (0 = closed, 1 = half-open, 2 = open)"
    );
    describe_gauge!(names::LOCAL_QUOTA_ENTRIES, "Live entries in the local quota store");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record the outcome of one pipeline stage (`admitted` or `rejected`).
pub fn record_admission(stage: &'static str, outcome: &'static str) {
    counter!(names::REQUESTS_TOTAL, "stage" => stage, "outcome" => outcome).increment(1);
}

pub fn record_threat(category: &'static str) {
    counter!(names::THREATS_TOTAL, "category" => category).increment(1);
}

pub fn record_weak_user_agent() {
    counter!(names::WEAK_USER_AGENT_TOTAL).increment(1);
}

pub fn record_quota_decision(policy: &str, allowed: bool, degraded: bool) {
    counter!(
        names::QUOTA_DECISIONS_TOTAL,
        "policy" => policy.to_string(),
        "allowed" => if allowed { "true" } else { "false" },
        "degraded" => if degraded { "true" } else { "false" }
    )
    .increment(1);
}

/// Record a local-store fallback. `reason`: `error`, `timeout`, `circuit_open`.
pub fn record_store_fallback(reason: &'static str) {
    counter!(names::STORE_FALLBACKS_TOTAL, "reason" => reason).increment(1);
}

pub fn record_store_circuit_open() {
    counter!(names::STORE_CIRCUIT_OPENS_TOTAL).increment(1);
}

pub fn record_geo_decision(outcome: &'static str) {
    counter!(names::GEO_DECISIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_slow_response() {
    counter!(names::SLOW_RESPONSES_TOTAL).increment(1);
}

pub fn record_large_response() {
    counter!(names::LARGE_RESPONSES_TOTAL).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

pub fn record_pipeline_duration(duration_secs: f64) {
    histogram!(names::PIPELINE_DURATION_SECONDS).record(duration_secs);
}

pub fn record_store_duration(op: &'static str, duration_secs: f64) {
    histogram!(names::STORE_DURATION_SECONDS, "op" => op).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Update circuit breaker state gauge.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_store_circuit_state(state: u8) {
    gauge!(names::STORE_CIRCUIT_STATE).set(f64::from(state));
}

pub fn set_local_quota_entries(count: usize) {
    gauge!(names::LOCAL_QUOTA_ENTRIES).set(count as f64);
}
