//! Prometheus metrics for registry health

use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use registry_core::{ProbeOutcome, ServiceStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Prometheus metrics describing instance health per service.
///
/// Clones share the same underlying registry and metrics.
#[derive(Clone)]
pub struct RegistryMetrics {
    /// Probe results by service and outcome
    pub probe_results_total: IntCounterVec,
    /// Registered instances per service
    pub instances_total: IntGaugeVec,
    /// Healthy instances per service
    pub instances_healthy: IntGaugeVec,
    /// Instances with an open circuit per service
    pub circuits_open: IntGaugeVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl RegistryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let probe_results_total = IntCounterVec::new(
            Opts::new("registry_probe_results_total", "Health probe results by outcome"),
            &["service", "outcome"],
        )?;

        let instances_total = IntGaugeVec::new(
            Opts::new("registry_instances_total", "Registered instances"),
            &["service"],
        )?;

        let instances_healthy = IntGaugeVec::new(
            Opts::new("registry_instances_healthy", "Instances passing health checks"),
            &["service"],
        )?;

        let circuits_open = IntGaugeVec::new(
            Opts::new("registry_circuits_open", "Instances with an open circuit breaker"),
            &["service"],
        )?;

        registry.register(Box::new(probe_results_total.clone()))?;
        registry.register(Box::new(instances_total.clone()))?;
        registry.register(Box::new(instances_healthy.clone()))?;
        registry.register(Box::new(circuits_open.clone()))?;

        Ok(Self {
            probe_results_total,
            instances_total,
            instances_healthy,
            circuits_open,
            registry,
        })
    }

    pub fn record_probe(&self, service: &str, outcome: &ProbeOutcome) {
        self.probe_results_total
            .with_label_values(&[service, outcome.label()])
            .inc();
    }

    /// Refresh the per-service gauges from a status snapshot
    pub fn update_from_status(&self, status: &BTreeMap<String, ServiceStatus>) {
        for (service, summary) in status {
            let open = summary.instances.iter().filter(|i| i.circuit_open).count();

            self.instances_total
                .with_label_values(&[service.as_str()])
                .set(summary.total_count as i64);
            self.instances_healthy
                .with_label_values(&[service.as_str()])
                .set(summary.healthy_count as i64);
            self.circuits_open
                .with_label_values(&[service.as_str()])
                .set(open as i64);
        }
        debug!("Updated registry gauges for {} services", status.len());
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
