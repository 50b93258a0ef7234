use crate::detection::Decision;
use log::{debug, warn};
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

// Use global registry for Pingora's built-in Prometheus service
static EVALUATIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("anomaly_evaluations_total", "Requests evaluated by the anomaly engine")
        .expect("metric creation failed")
});

static ALLOWED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("anomaly_allowed_total", "Requests allowed by the anomaly engine")
        .expect("metric creation failed")
});

static BLOCKED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("anomaly_blocked_total", "Requests flagged as anomalous"),
        &["attribution"],
    )
    .expect("metric creation failed")
});

static TRACKED_IPS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("anomaly_tracked_ips", "IP addresses held in the rate state store")
        .expect("metric creation failed")
});

fn register<C: Collector + Clone + 'static>(collector: &C) {
    match prometheus::register(Box::new(collector.clone())) {
        Ok(()) => {}
        Err(prometheus::Error::AlreadyReg) => debug!("Metric already registered"),
        Err(e) => warn!("Failed to register metric: {}", e),
    }
}

pub struct MetricsCollector {
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        // Register with default registry (used by Pingora)
        register(&*EVALUATIONS);
        register(&*ALLOWED);
        register(&*BLOCKED);
        register(&*TRACKED_IPS);

        Self {
            registry: Arc::new(prometheus::default_registry().clone()),
        }
    }

    pub fn record_decision(&self, decision: &Decision) {
        EVALUATIONS.inc();
        if decision.anomalous {
            BLOCKED
                .with_label_values(&[decision.attribution.as_str()])
                .inc();
        } else {
            ALLOWED.inc();
        }
    }

    pub fn set_tracked_ips(&self, count: usize) {
        TRACKED_IPS.set(count as i64);
    }

    pub fn evaluations(&self) -> u64 {
        EVALUATIONS.get()
    }

    pub fn allowed(&self) -> u64 {
        ALLOWED.get()
    }

    pub fn blocked(&self, attribution: &str) -> u64 {
        BLOCKED.with_label_values(&[attribution]).get()
    }

    /// Registry contents in the Prometheus text format.
    pub fn render(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Attribution;

    #[test]
    fn test_record_decision_counts() {
        let metrics = MetricsCollector::new();
        let evaluations = metrics.evaluations();
        let allowed = metrics.allowed();
        let ua_blocks = metrics.blocked("ua-blacklist");

        metrics.record_decision(&Decision::allowed(0));
        metrics.record_decision(&Decision::blocked(Attribution::UaBlacklist, 0, "curl"));

        assert_eq!(metrics.evaluations(), evaluations + 2);
        assert_eq!(metrics.allowed(), allowed + 1);
        assert_eq!(metrics.blocked("ua-blacklist"), ua_blocks + 1);
    }

    #[test]
    fn test_duplicate_registration_tolerated() {
        let first = MetricsCollector::new();
        let second = MetricsCollector::new();
        second.set_tracked_ips(3);
        let rendered = first.render();
        assert!(rendered.contains("anomaly_tracked_ips 3"));
        assert!(rendered.contains("anomaly_evaluations_total"));
    }
}
