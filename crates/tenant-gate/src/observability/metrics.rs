//! Prometheus metrics for tenant-gate

use std::sync::OnceLock;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::Result;
use crate::error::Error;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static START_TIME: OnceLock<Instant> = OnceLock::new();

const METRIC_UPTIME: &str = "tenant_gate_uptime_seconds";
const METRIC_INFO: &str = "tenant_gate_info";

// Access decisions
const METRIC_GUARD_DECISIONS: &str = "tenant_gate_guard_decisions_total";
const METRIC_AUTH_STATE: &str = "tenant_gate_auth_state";

// Token refresh
const METRIC_REFRESHES: &str = "tenant_gate_token_refreshes_total";

// Audit pipeline
const METRIC_AUDIT_DROPPED: &str = "tenant_gate_audit_dropped_total";
const METRIC_AUDIT_FAILED: &str = "tenant_gate_audit_failed_total";

/// Initialize Prometheus metrics recorder.
pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("Failed to install metrics recorder: {e}")))?;

    PROMETHEUS_HANDLE.set(handle).ok();
    START_TIME.set(Instant::now()).ok();

    register_metrics();
    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

fn register_metrics() {
    describe_gauge!(METRIC_UPTIME, "Process uptime in seconds");
    describe_gauge!(METRIC_INFO, "Build information (always 1)");

    describe_counter!(METRIC_GUARD_DECISIONS, "Guard decisions by result");
    describe_gauge!(
        METRIC_AUTH_STATE,
        "Session state (0 initializing, 1 unauthenticated, 2 authenticating, 3 authenticated, 4 error)"
    );

    describe_counter!(METRIC_REFRESHES, "Token refresh attempts by status");

    describe_counter!(METRIC_AUDIT_DROPPED, "Audit events dropped on a full buffer");
    describe_counter!(METRIC_AUDIT_FAILED, "Audit events the store failed to write");

    gauge!(
        METRIC_INFO,
        "version" => env!("CARGO_PKG_VERSION"),
    )
    .set(1.0);
}

/// Render metrics in Prometheus text format.
#[must_use]
pub fn render_metrics() -> String {
    if let Some(start) = START_TIME.get() {
        gauge!(METRIC_UPTIME).set(start.elapsed().as_secs_f64());
    }

    PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Record a guard decision (`admit`, `deny` or `redirect`).
pub fn record_guard_decision(decision: &'static str) {
    counter!(METRIC_GUARD_DECISIONS, "decision" => decision).increment(1);
}

/// Record the outcome of a token refresh.
pub fn record_refresh(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(METRIC_REFRESHES, "status" => status).increment(1);
}

/// Update the session state gauge.
pub fn set_auth_state(code: u8) {
    gauge!(METRIC_AUTH_STATE).set(f64::from(code));
}

/// Record an audit event dropped before reaching the store.
pub fn record_audit_dropped() {
    counter!(METRIC_AUDIT_DROPPED).increment(1);
}

/// Record an audit event the store rejected.
pub fn record_audit_failed() {
    counter!(METRIC_AUDIT_FAILED).increment(1);
}
