//! Reconcile metrics
//!
//! The controller reports every outcome through [`OutcomeRecorder`];
//! [`ControllerMetrics`] forwards them to the `metrics` facade, which
//! `main.rs` exports in Prometheus format.

use crate::engine::ReconcileOutcome;
use crate::kinds::ObjectKey;
use std::time::Duration;

/// Sink for reconcile outcomes and watch health
pub trait OutcomeRecorder: Send + Sync {
    fn record(&self, outcome: &ReconcileOutcome, elapsed: Duration);

    /// A reconcile failed before producing an outcome
    fn record_error(&self, _reason: &str) {}

    fn record_watch_error(&self, _kind: &str) {}

    fn record_queue_depth(&self, _depth: usize) {}
}

/// Recorder that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl OutcomeRecorder for NoopRecorder {
    fn record(&self, _outcome: &ReconcileOutcome, _elapsed: Duration) {}
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Requests waiting for a worker
    pub queue_depth: metrics::Gauge,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("rbac_operator_reconciliations_total"),
            duration: metrics::histogram!("rbac_operator_reconciliation_duration_seconds"),
            queue_depth: metrics::gauge!("rbac_operator_queue_depth"),
        }
    }

    fn objects(&self, keys: &[ObjectKey], action: &'static str) {
        for key in keys {
            metrics::counter!(
                "rbac_operator_objects_total",
                "kind" => key.kind.as_str(),
                "action" => action
            )
            .increment(1);
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeRecorder for ControllerMetrics {
    fn record(&self, outcome: &ReconcileOutcome, elapsed: Duration) {
        self.reconciliations.increment(1);
        self.duration.record(elapsed.as_secs_f64());

        if let Some(err) = outcome.error() {
            self.record_error(err.reason());
        }
        if let Some(report) = outcome.report() {
            self.objects(&report.created, "create");
            self.objects(&report.updated, "update");
            self.objects(&report.replaced, "replace");
            self.objects(&report.deleted, "delete");
            self.objects(&report.released, "release");
            self.objects(&report.skipped, "skip");
        }
    }

    fn record_error(&self, reason: &str) {
        metrics::counter!(
            "rbac_operator_reconciliation_errors_total",
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    fn record_watch_error(&self, kind: &str) {
        metrics::counter!("rbac_operator_watch_errors_total", "kind" => kind.to_string())
            .increment(1);
    }

    fn record_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }
}
