//! Health checking for registered service instances

use crate::metrics::RegistryMetrics;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use registry_core::{HealthCheckSettings, ProbeOutcome, ServiceRegistry};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, error, info, warn};

/// Health check configuration
#[derive(Clone, Debug, PartialEq)]
pub struct HealthCheckConfig {
    /// Pause between the end of one cycle and the start of the next
    pub check_interval: Duration,
    /// Upper bound for a single probe
    pub timeout: Duration,
    /// Probes allowed in flight at once
    pub max_concurrent_probes: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_concurrent_probes: 32,
        }
    }
}

impl From<&HealthCheckSettings> for HealthCheckConfig {
    fn from(settings: &HealthCheckSettings) -> Self {
        Self {
            check_interval: settings.interval(),
            timeout: settings.timeout(),
            max_concurrent_probes: settings.max_concurrent_probes,
        }
    }
}

/// A way of asking one instance whether it is healthy
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}

/// Probe that issues `GET {address}{health_path}`; only 200 counts as healthy
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        match time::timeout(timeout, self.client.get(url).timeout(timeout).send()).await {
            Ok(Ok(response)) if response.status() == StatusCode::OK => ProbeOutcome::Healthy,
            Ok(Ok(response)) => ProbeOutcome::UnhealthyStatus(response.status().as_u16()),
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::Timeout,
            Ok(Err(e)) => ProbeOutcome::ConnectionError(e.to_string()),
            Err(_) => ProbeOutcome::Timeout,
        }
    }
}

/// Counts for one completed probe cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Periodically probes every registered instance and records the outcome
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: HealthCheckConfig,
    metrics: Option<RegistryMetrics>,
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new(
        registry: Arc<ServiceRegistry>,
        probe: Arc<dyn HealthProbe>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            config,
            metrics: None,
        }
    }

    /// Record probe outcomes and registry gauges into `metrics`
    pub fn with_metrics(mut self, metrics: RegistryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Start the periodic check loop as a background task
    pub fn spawn(self) -> HealthCheckHandle {
        let (shutdown, stop_rx) = watch::channel(false);
        HealthCheckHandle {
            handle: tokio::spawn(self.run(stop_rx)),
            shutdown,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Health checker started with interval {:?}, probe timeout {:?}",
            self.config.check_interval, self.config.timeout
        );

        loop {
            match self.cycle(&mut shutdown).await {
                Ok(Some(summary)) => debug!(
                    "Health check cycle complete: {} probed, {} healthy, {} unhealthy",
                    summary.probed, summary.healthy, summary.unhealthy
                ),
                Ok(None) => break,
                Err(e) => error!("Health check cycle failed: {:#}", e),
            }

            tokio::select! {
                _ = time::sleep(self.config.check_interval) => {}
                _ = stopped(&mut shutdown) => break,
            }
        }

        debug!("Health check loop exited");
    }

    /// Probe every instance once and apply the results.
    ///
    /// Probes run concurrently, at most `max_concurrent_probes` at a time, and
    /// each is cut off at its own timeout. Results are applied as they arrive.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let (_keep_running, mut shutdown) = watch::channel(false);
        Ok(self.cycle(&mut shutdown).await?.unwrap_or_default())
    }

    /// One probe cycle; `Ok(None)` when `shutdown` fired before it completed.
    ///
    /// On shutdown every outstanding probe is aborted and awaited before
    /// returning, and results not yet applied are discarded.
    async fn cycle(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Option<CycleSummary>> {
        let targets = self.registry.probe_targets().await;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_probes.max(1)));
        let mut probes = JoinSet::new();
        let mut in_flight: HashMap<task::Id, (String, String)> = HashMap::with_capacity(targets.len());

        for target in targets {
            let semaphore = semaphore.clone();
            let probe = self.probe.clone();
            let url = target.instance.health_url();
            let timeout = target.instance.timeout.min(self.config.timeout);

            let spawned = probes.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return ProbeOutcome::Unexpected(e.to_string()),
                };
                match time::timeout(timeout, probe.probe(&url, timeout)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::Timeout,
                }
            });
            in_flight.insert(spawned.id(), (target.service, target.instance.address));
        }

        let mut summary = CycleSummary::default();
        let mut lost = 0usize;

        loop {
            let next = tokio::select! {
                joined = probes.join_next_with_id() => Some(joined),
                _ = stopped(shutdown) => None,
            };
            let Some(joined) = next else {
                probes.shutdown().await;
                debug!("Health check cycle interrupted with {} probes outstanding", in_flight.len());
                return Ok(None);
            };
            let Some(joined) = joined else { break };

            // A panicking probe surfaces as a join error carrying its task id
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(e) => (e.id(), ProbeOutcome::Unexpected(e.to_string())),
            };
            let Some((service, address)) = in_flight.remove(&id) else {
                warn!("Health probe task {} finished with no known target", id);
                lost += 1;
                continue;
            };

            if let Some(metrics) = &self.metrics {
                metrics.record_probe(&service, &outcome);
            }

            summary.probed += 1;
            if outcome.is_healthy() {
                summary.healthy += 1;
            } else {
                summary.unhealthy += 1;
            }

            self.registry.apply_probe_result(&service, &address, outcome).await;
        }

        if let Some(metrics) = &self.metrics {
            metrics.update_from_status(&self.registry.get_service_status().await);
        }

        if lost > 0 {
            return Err(anyhow!("{} of {} health probes did not report", lost, lost + summary.probed));
        }
        Ok(Some(summary))
    }
}

/// Resolves once a stop has been requested or the handle is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Handle to a running health checker.
///
/// Dropping the handle without calling [`stop`](Self::stop) also ends the loop.
pub struct HealthCheckHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl HealthCheckHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the check loop and wait until it and its probes have unwound
    pub async fn stop(self) {
        // Err only when the loop already exited
        let _ = self.shutdown.send(true);
        match self.handle.await {
            Ok(()) => info!("Health checker stopped"),
            Err(e) => error!("Health checker terminated abnormally: {}", e),
        }
    }
}
