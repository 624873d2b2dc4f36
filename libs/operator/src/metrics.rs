use crate::controller::ControllerId;

use std::collections::HashMap;
use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::time::Instant;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabel {
    controller: String,
}

pub struct Metrics {
    pub registry: Arc<Registry>,
    pub controllers: HashMap<ControllerId, Arc<ControllerMetrics>>,
}

impl Metrics {
    pub fn new(mut registry: Registry, controller_names: &[&'static str]) -> Self {
        let families = MetricFamilies::default();
        registry.register(
            "reconcile_operations",
            "Total number of reconcile operations",
            families.reconcile_operations.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of errors that occurred during reconcile operations",
            families.reconcile_failures.clone(),
        );
        registry.register(
            "reconcile_duration_seconds",
            "Histogram of reconcile operation durations",
            families.reconcile_duration.clone(),
        );
        registry.register(
            "status_update_errors",
            "Number of errors during updates to status subresources",
            families.status_update_errors.clone(),
        );
        registry.register(
            "ready",
            "1 when the controller is ready to reconcile resources, 0 otherwise",
            families.ready.clone(),
        );

        let controllers = controller_names
            .iter()
            .map(|&id| (id, Arc::new(ControllerMetrics::new(id, families.clone()))))
            .collect();

        Self {
            registry: Arc::new(registry),
            controllers,
        }
    }
}

#[derive(Clone)]
struct MetricFamilies {
    reconcile_operations: Family<ControllerLabel, Counter>,
    reconcile_failures: Family<ControllerLabel, Counter>,
    reconcile_duration: Family<ControllerLabel, Histogram>,
    status_update_errors: Family<ControllerLabel, Counter>,
    ready: Family<ControllerLabel, Gauge>,
}

impl Default for MetricFamilies {
    fn default() -> Self {
        Self {
            reconcile_operations: Family::default(),
            reconcile_failures: Family::default(),
            reconcile_duration: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 12))
            }),
            status_update_errors: Family::default(),
            ready: Family::default(),
        }
    }
}

pub struct ControllerMetrics {
    label: ControllerLabel,
    families: MetricFamilies,
}

impl ControllerMetrics {
    fn new(controller: &str, families: MetricFamilies) -> Self {
        Self {
            label: ControllerLabel {
                controller: controller.to_string(),
            },
            families,
        }
    }

    pub fn reconcile_failure_inc(&self) {
        self.families
            .reconcile_failures
            .get_or_create(&self.label)
            .inc();
    }

    pub fn reconcile_count_and_measure(&self) -> ReconcileMeasurer {
        self.families
            .reconcile_operations
            .get_or_create(&self.label)
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self
                .families
                .reconcile_duration
                .get_or_create(&self.label)
                .clone(),
        }
    }

    pub fn status_update_errors_inc(&self) {
        self.families
            .status_update_errors
            .get_or_create(&self.label)
            .inc();
    }

    pub fn ready_set(&self, status: i64) {
        self.families.ready.get_or_create(&self.label).set(status);
    }
}

impl Default for ControllerMetrics {
    /// Unregistered metrics for test contexts
    fn default() -> Self {
        Self::new("test", MetricFamilies::default())
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metric.observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_all_controllers() {
        let metrics = Metrics::new(Registry::default(), &["store", "other"]);
        assert!(metrics.controllers.contains_key("store"));
        assert!(metrics.controllers.contains_key("other"));
    }

    #[test]
    fn test_reconcile_measurer_observes_on_drop() {
        let metrics = ControllerMetrics::default();
        {
            let _timer = metrics.reconcile_count_and_measure();
        }
        metrics.reconcile_failure_inc();
        metrics.ready_set(1);
    }
}
