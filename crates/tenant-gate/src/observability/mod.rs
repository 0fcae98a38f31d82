//! Observability module for logging and metrics

#[cfg(feature = "metrics")]
mod metrics;

#[cfg(feature = "metrics")]
pub use metrics::{
    init_metrics, record_audit_dropped, record_audit_failed, record_guard_decision,
    record_refresh, render_metrics, set_auth_state,
};

use crate::Result;
use crate::config::TelemetryConfig;

/// Initialize observability stack
pub fn init_observability(config: &TelemetryConfig) -> Result<()> {
    #[cfg(feature = "metrics")]
    {
        init_metrics()?;
    }

    init_logging(config);
    Ok(())
}

fn init_logging(config: &TelemetryConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    // A subscriber installed earlier (tests, embedding application) wins
    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already set");
    }
}

// Without the `metrics` feature the recording points compile to nothing.

#[cfg(not(feature = "metrics"))]
pub const fn record_guard_decision(_decision: &'static str) {}

#[cfg(not(feature = "metrics"))]
pub const fn record_refresh(_success: bool) {}

#[cfg(not(feature = "metrics"))]
pub const fn set_auth_state(_code: u8) {}

#[cfg(not(feature = "metrics"))]
pub const fn record_audit_dropped() {}

#[cfg(not(feature = "metrics"))]
pub const fn record_audit_failed() {}

#[cfg(not(feature = "metrics"))]
#[must_use]
pub const fn render_metrics() -> String {
    String::new()
}
