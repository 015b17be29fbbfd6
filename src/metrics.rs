//! Prometheus counters for the proxy surface.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, TextEncoder};

const NAMESPACE: &str = "utilmeta_proxy";

lazy_static::lazy_static! {
    /// Proxied requests by mode and final upstream status.
    pub static ref PROXIED_REQUESTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("proxied_requests_total", "Requests handled by the proxy engine")
                .namespace(NAMESPACE),
            &["mode", "status"]
        ).unwrap();

    /// Upstream attempts beyond the first, across all requests.
    pub static ref PROXY_RETRIES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("retries_total", "Retried upstream attempts")
                .namespace(NAMESPACE)
        ).unwrap();

    /// Registrations by outcome (registered / rejected / failed).
    pub static ref REGISTRATIONS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("registrations_total", "Instance registrations by outcome")
                .namespace(NAMESPACE),
            &["outcome"]
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    prometheus::default_registry().register(Box::new(PROXIED_REQUESTS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(PROXY_RETRIES_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(REGISTRATIONS_TOTAL.clone()))?;
    Ok(())
}

/// Text exposition of the default registry.
pub fn gather_metrics_string() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
