//! Dispatch metrics
//!
//! Collectors are registered on a registry the caller owns, never on the
//! process-wide default, so several managers (or tests) can coexist.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::time::Duration;

use crate::domain::DispatchResult;

/// Where the dispatch manager reports what happened
pub trait MetricsSink: Send + Sync {
    fn record_dispatch(&self, result: &DispatchResult);

    /// Per-vehicle send-to-ack latencies of one dispatch
    fn record_latencies(&self, _latencies: &[(String, Duration)]) {}

    fn record_fleet_size(&self, size: usize);

    fn record_publish_failure(&self, vehicle_id: &str);
}

pub struct PrometheusMetrics {
    dispatches: IntCounterVec,
    acked: IntCounter,
    failed: IntCounter,
    publish_failures: IntCounter,
    fallbacks: IntCounter,
    ack_latency: Histogram,
    fleet_size: IntGauge,
    target_kw: Gauge,
    unserved_kw: Gauge,
}

impl PrometheusMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let dispatches = IntCounterVec::new(
            Opts::new("v2g_dispatch_total", "Dispatches by signal kind"),
            &["signal"],
        )?;
        let acked = IntCounter::new("v2g_vehicle_acked_total", "Orders acknowledged")?;
        let failed = IntCounter::new("v2g_vehicle_failed_total", "Orders not acknowledged")?;
        let publish_failures = IntCounter::new(
            "v2g_publish_failures_total",
            "Orders that could not be published after retries",
        )?;
        let fallbacks = IntCounter::new("v2g_fallback_total", "Dispatches that ran a fallback")?;
        let ack_latency = Histogram::with_opts(
            HistogramOpts::new("v2g_ack_latency_seconds", "Send to ack or timeout")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
        )?;
        let fleet_size = IntGauge::new("v2g_fleet_size", "Vehicles returned by discovery")?;
        let target_kw = Gauge::new("v2g_target_kw", "Magnitude of the last signal")?;
        let unserved_kw = Gauge::new("v2g_unserved_kw", "Target not covered by acked vehicles")?;

        registry.register(Box::new(dispatches.clone()))?;
        registry.register(Box::new(acked.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(fallbacks.clone()))?;
        registry.register(Box::new(ack_latency.clone()))?;
        registry.register(Box::new(fleet_size.clone()))?;
        registry.register(Box::new(target_kw.clone()))?;
        registry.register(Box::new(unserved_kw.clone()))?;

        Ok(Self {
            dispatches,
            acked,
            failed,
            publish_failures,
            fallbacks,
            ack_latency,
            fleet_size,
            target_kw,
            unserved_kw,
        })
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_dispatch(&self, result: &DispatchResult) {
        self.dispatches
            .with_label_values(&[result.signal.kind.as_ref()])
            .inc();
        let acked = result.acked_count() as u64;
        self.acked.inc_by(acked);
        self.failed
            .inc_by((result.acknowledged.len() as u64).saturating_sub(acked));
        if !result.fallback_assignments.is_empty() {
            self.fallbacks.inc();
        }
        let target = result.signal.target_kw();
        self.target_kw.set(target);
        self.unserved_kw
            .set((target - result.delivered_kw()).max(0.0));
    }

    fn record_latencies(&self, latencies: &[(String, Duration)]) {
        for (_, latency) in latencies {
            self.ack_latency.observe(latency.as_secs_f64());
        }
    }

    fn record_fleet_size(&self, size: usize) {
        self.fleet_size.set(size as i64);
    }

    fn record_publish_failure(&self, vehicle_id: &str) {
        tracing::debug!(vehicle_id, "publish failure recorded");
        self.publish_failures.inc();
    }
}

/// Text exposition of everything in `registry`
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, FlexibilitySignal, SignalKind};

    #[test]
    fn test_record_dispatch_counts() {
        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(&registry).unwrap();

        let signal = FlexibilitySignal::new(SignalKind::Fcr, 80.0, Duration::from_secs(60));
        let mut result = DispatchResult::new(signal, 0.0);
        result.assignments.insert("v1".into(), 40.0);
        result.assignments.insert("v2".into(), 40.0);
        result.acknowledged.insert("v1".into(), false);
        result.acknowledged.insert("v2".into(), true);
        result.errors.insert("v1".into(), FailureKind::AckTimeout);

        metrics.record_dispatch(&result);
        metrics.record_fleet_size(12);
        metrics.record_publish_failure("v1");
        metrics.record_latencies(&[("v2".into(), Duration::from_millis(120))]);

        assert_eq!(metrics.dispatches.with_label_values(&["FCR"]).get(), 1);
        assert_eq!(metrics.acked.get(), 1);
        assert_eq!(metrics.failed.get(), 1);
        assert_eq!(metrics.publish_failures.get(), 1);
        assert_eq!(metrics.fleet_size.get(), 12);
        assert_eq!(metrics.unserved_kw.get(), 40.0);
        assert_eq!(metrics.ack_latency.get_sample_count(), 1);

        let text = render(&registry).unwrap();
        assert!(text.contains("v2g_dispatch_total{signal=\"FCR\"} 1"));
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = Registry::new();
        let b = Registry::new();
        assert!(PrometheusMetrics::new(&a).is_ok());
        assert!(PrometheusMetrics::new(&b).is_ok());
        // same registry twice collides
        assert!(PrometheusMetrics::new(&a).is_err());
    }
}
