use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkflowLabels {
    pub outcome: WorkflowOutcome,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum WorkflowOutcome {
    Done,
    Failed,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the bridge.
pub struct Metrics {
    // -- requests --
    pub requests_total: Family<OperationLabels, Counter>,
    pub rejected_total: Family<RejectLabels, Counter>,

    // -- repositories --
    pub repo_inits_total: Counter,
    pub repo_removals_total: Counter,

    // -- subprocesses --
    pub active_subprocesses: Gauge,

    // -- push workflow --
    pub push_workflows_total: Family<WorkflowLabels, Counter>,
    pub push_workflow_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<OperationLabels, Counter>::default();
        registry.register(
            "pushgate_requests",
            "Accepted pack requests by protocol operation",
            requests_total.clone(),
        );

        let rejected_total = Family::<RejectLabels, Counter>::default();
        registry.register(
            "pushgate_rejected",
            "Requests that failed before or during the pack exchange, by reason",
            rejected_total.clone(),
        );

        let repo_inits_total = Counter::default();
        registry.register(
            "pushgate_repo_inits",
            "Bare repositories created",
            repo_inits_total.clone(),
        );

        let repo_removals_total = Counter::default();
        registry.register(
            "pushgate_repo_removals",
            "Bare repositories removed after a push",
            repo_removals_total.clone(),
        );

        let active_subprocesses: Gauge = Gauge::default();
        registry.register(
            "pushgate_active_subprocesses",
            "Pack subprocesses currently running",
            active_subprocesses.clone(),
        );

        let push_workflows_total = Family::<WorkflowLabels, Counter>::default();
        registry.register(
            "pushgate_push_workflows",
            "Completed push workflows by outcome",
            push_workflows_total.clone(),
        );

        let push_workflow_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 14));
        registry.register(
            "pushgate_push_workflow_duration_seconds",
            "Clone, hook and cleanup latency in seconds",
            push_workflow_duration_seconds.clone(),
        );

        Self {
            requests_total,
            rejected_total,
            repo_inits_total,
            repo_removals_total,
            active_subprocesses,
            push_workflows_total,
            push_workflow_duration_seconds,
        }
    }

    pub fn request(&self, operation: &str) {
        self.requests_total
            .get_or_create(&OperationLabels {
                operation: operation.to_owned(),
            })
            .inc();
    }

    pub fn rejected(&self, reason: &str) {
        self.rejected_total
            .get_or_create(&RejectLabels {
                reason: reason.to_owned(),
            })
            .inc();
    }

    pub fn workflow_finished(&self, outcome: WorkflowOutcome, seconds: f64) {
        self.push_workflows_total
            .get_or_create(&WorkflowLabels { outcome })
            .inc();
        self.push_workflow_duration_seconds.observe(seconds);
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all bridge metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_rendered_with_labels() {
        let registry = MetricsRegistry::new();
        registry.metrics.request("receive_pack");
        registry.metrics.rejected("unauthorized");
        registry.metrics.workflow_finished(WorkflowOutcome::Done, 0.2);

        let text = registry.encode().unwrap();
        assert!(text.contains("pushgate_requests_total{operation=\"receive_pack\"} 1"));
        assert!(text.contains("pushgate_rejected_total{reason=\"unauthorized\"} 1"));
        assert!(text.contains("pushgate_push_workflows_total{outcome=\"Done\"} 1"));
        assert!(text.contains("pushgate_active_subprocesses 0"));
    }
}
