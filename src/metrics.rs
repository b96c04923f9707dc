use crate::Error;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub capacity_overcommit: IntCounterVec,
    pub dynamic_vms_created: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "hobbyfarm_operator_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "hobbyfarm_operator_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("hobbyfarm_operator_reconciliations_total", "reconciliations").unwrap();
        let capacity_overcommit = IntCounterVec::new(
            opts!(
                "hobbyfarm_operator_capacity_overcommit_total",
                "scheduled events provisioned beyond the capacity of an environment",
            ),
            &["environment"],
        )
        .unwrap();
        let dynamic_vms_created = IntCounter::new(
            "hobbyfarm_operator_dynamic_vms_created_total",
            "virtual machines created on demand",
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            capacity_overcommit,
            dynamic_vms_created,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.capacity_overcommit.clone()))?;
        registry.register(Box::new(self.dynamic_vms_created.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: kube::Resource<DynamicType = ()>>(&self, obj: &T, e: &Error) {
        self.failures
            .with_label_values(&[T::kind(&()).as_ref(), obj.name_any().as_ref(), e.metric_label()])
            .inc()
    }

    pub fn capacity_overcommitted(&self, environment: &str) {
        self.capacity_overcommit
            .with_label_values(&[environment])
            .inc()
    }

    pub fn count_and_measure<T: kube::Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer<T> {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            _resource_type: std::marker::PhantomData,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer<T: kube::Resource<DynamicType = ()>> {
    start: Instant,
    metric: HistogramVec,
    _resource_type: std::marker::PhantomData<T>,
}

impl<T: kube::Resource<DynamicType = ()>> Drop for ReconcileMeasurer<T> {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[T::kind(&()).as_ref()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::scheduledevents::ScheduledEvent;

    #[test]
    fn registers_and_counts() {
        let registry = Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();

        let se = ScheduledEvent::new("se-a", Default::default());
        metrics.reconcile_failure(&se, &Error::InvalidSpec("bad".into()));
        metrics.capacity_overcommitted("env1");
        drop(metrics.count_and_measure::<ScheduledEvent>());

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|m| m.get_name().to_owned())
            .collect();
        assert!(names.contains(&"hobbyfarm_operator_reconciliation_errors_total".to_owned()));
        assert!(names.contains(&"hobbyfarm_operator_capacity_overcommit_total".to_owned()));
        assert_eq!(metrics.reconciliations.get(), 1);
        assert_eq!(
            metrics
                .failures
                .with_label_values(&["ScheduledEvent", "se-a", "InvalidSpec"])
                .get(),
            1
        );
    }
}
