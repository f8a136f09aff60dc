//! Prometheus metrics for the HTTP service.
//!
//! Every [`ServiceMetrics`] owns its own [`Registry`] so that several routers
//! (tests, embedded use) can coexist in one process without colliding on the
//! global default registry.

use hook_reconciler_core::{PipelineOutcome, WebhookSource};
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Service metrics for observability
#[derive(Debug)]
pub struct ServiceMetrics {
    registry: Registry,

    // HTTP request metrics
    pub http_requests_total: IntCounterVec,

    // Webhook processing metrics
    pub webhook_requests_total: IntCounterVec,
    pub webhook_processing_duration: HistogramVec,
    pub signature_failures_total: IntCounterVec,

    // Side effects and administrative operations
    pub notification_failures_total: IntCounter,
    pub replay_operations_total: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new_custom(Some("hook_reconciler".to_string()), None)?;

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )?;
        let webhook_requests_total = IntCounterVec::new(
            Opts::new(
                "webhook_requests_total",
                "Webhook deliveries by source and outcome",
            ),
            &["source", "outcome"],
        )?;
        let webhook_processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "webhook_processing_duration_seconds",
                "Time spent running a delivery through the pipeline",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["source"],
        )?;
        let signature_failures_total = IntCounterVec::new(
            Opts::new(
                "signature_failures_total",
                "Deliveries rejected during authentication",
            ),
            &["source"],
        )?;
        let notification_failures_total = IntCounter::new(
            "notification_failures_total",
            "Notifications the sink did not accept",
        )?;
        let replay_operations_total = IntCounterVec::new(
            Opts::new(
                "replay_operations_total",
                "Operator-initiated attempt replays by result",
            ),
            &["result"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(webhook_requests_total.clone()))?;
        registry.register(Box::new(webhook_processing_duration.clone()))?;
        registry.register(Box::new(signature_failures_total.clone()))?;
        registry.register(Box::new(notification_failures_total.clone()))?;
        registry.register(Box::new(replay_operations_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            webhook_requests_total,
            webhook_processing_duration,
            signature_failures_total,
            notification_failures_total,
            replay_operations_total,
        }))
    }

    /// Record the outcome of one pipeline run.
    pub fn observe_webhook(&self, outcome: &PipelineOutcome, elapsed: Duration) {
        let source = outcome.source.as_str();
        let label = outcome_label(outcome);

        self.webhook_requests_total
            .with_label_values(&[source, label])
            .inc();
        self.webhook_processing_duration
            .with_label_values(&[source])
            .observe(elapsed.as_secs_f64());

        if label == "authentication" {
            self.signature_failures_total
                .with_label_values(&[source])
                .inc();
        }
        if outcome.notification_delivered == Some(false) {
            self.notification_failures_total.inc();
        }
    }

    /// Count a rejected body that never reached the pipeline.
    pub fn observe_oversized(&self, source: WebhookSource) {
        self.webhook_requests_total
            .with_label_values(&[source.as_str(), "too_large"])
            .inc();
    }

    pub fn observe_replay(&self, result: &str) {
        self.replay_operations_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn observe_http(&self, method: &str, path: &str, status: u16) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, status.as_str()])
            .inc();
    }

    /// Encode every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

/// `completed` for successes, otherwise the failure kind.
fn outcome_label(outcome: &PipelineOutcome) -> &'static str {
    match outcome.failure_kind() {
        None => "completed",
        Some(kind) => kind.as_str(),
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
