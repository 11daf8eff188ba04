//! Service registry: service configs, instance selection and outcome reporting

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::GatewayConfig;
use crate::instance::{InstanceRecord, InstanceStatus, ProbeOutcome};
use crate::load_balancer::{LoadBalancer, LoadBalancingStrategy};
use crate::{CoreError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Registration request for one logical service
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub name: String,
    pub strategy: LoadBalancingStrategy,
    pub instances: Vec<InstanceRecord>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, strategy: LoadBalancingStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            instances: Vec::new(),
        }
    }

    pub fn with_instance(mut self, instance: InstanceRecord) -> Self {
        self.instances.push(instance);
        self
    }
}

/// Registry entry for a service
#[derive(Debug)]
struct ServiceEntry {
    instances: Vec<InstanceRecord>,
    balancer: LoadBalancer,
}

impl ServiceEntry {
    fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            instances: Vec::new(),
            balancer: LoadBalancer::new(strategy),
        }
    }

    fn instance_mut(&mut self, address: &str) -> Option<&mut InstanceRecord> {
        self.instances.iter_mut().find(|i| i.address == address)
    }
}

/// Instance to probe, captured outside the registry lock
#[derive(Clone, Debug)]
pub struct ProbeTarget {
    pub service: String,
    pub instance: InstanceRecord,
}

/// Health summary for one service
#[derive(Clone, Debug, Serialize)]
pub struct ServiceStatus {
    pub strategy: LoadBalancingStrategy,
    pub instances: Vec<InstanceStatus>,
    pub healthy_count: usize,
    pub total_count: usize,
    pub health_percentage: f64,
}

/// ServiceRegistry owns every service config and instance record.
///
/// All mutation happens under the write lock, so a selection, an outcome
/// report and a probe result never interleave on the same record.
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<String, ServiceEntry>>>,
    breaker: CircuitBreakerConfig,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_breaker(CircuitBreakerConfig::default())
    }

    pub fn with_breaker(breaker: CircuitBreakerConfig) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            breaker,
        }
    }

    /// Build a registry seeded from bootstrap configuration
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;
        let registry = Self::with_breaker(CircuitBreakerConfig::from(&config.circuit_breaker));

        for definition in &config.services {
            let service = ServiceConfig {
                name: definition.name.clone(),
                strategy: definition.strategy,
                instances: definition
                    .instances
                    .iter()
                    .cloned()
                    .map(InstanceRecord::from)
                    .collect(),
            };
            registry.register_service(service).await?;
        }

        info!("Service registry seeded with {} services", config.services.len());
        Ok(registry)
    }

    pub fn breaker_config(&self) -> &CircuitBreakerConfig {
        &self.breaker
    }

    /// Register or replace a service
    pub async fn register_service(&self, config: ServiceConfig) -> Result<()> {
        if config.name.is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "service name must not be empty".to_string(),
            ));
        }

        let mut entry = ServiceEntry::new(config.strategy);
        entry.instances = config.instances;

        let mut services = self.services.write().await;
        if services.insert(config.name.clone(), entry).is_some() {
            debug!("Replaced service: {}", config.name);
        } else {
            debug!("Registered service: {}", config.name);
        }
        Ok(())
    }

    /// Append an instance, creating a round-robin service if needed
    pub async fn add_service_instance(
        &self,
        service_name: &str,
        instance: InstanceRecord,
    ) -> Result<()> {
        if service_name.is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "service name must not be empty".to_string(),
            ));
        }

        let mut services = self.services.write().await;
        debug!("Adding instance {} to service {}", instance.address, service_name);
        services
            .entry(service_name.to_string())
            .or_insert_with(|| ServiceEntry::new(LoadBalancingStrategy::default()))
            .instances
            .push(instance);
        Ok(())
    }

    /// Pick a healthy instance of a service, or None when nothing is eligible.
    ///
    /// When no instance is healthy with a closed circuit, instances whose
    /// cool-down has elapsed are reset and become the candidate set.
    pub async fn get_healthy_instance(&self, service_name: &str) -> Option<InstanceRecord> {
        let now = Instant::now();
        let mut services = self.services.write().await;

        let Some(entry) = services.get_mut(service_name) else {
            debug!("No such service: {}", service_name);
            return None;
        };

        let mut eligible: Vec<usize> = entry
            .instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.is_eligible())
            .map(|(idx, _)| idx)
            .collect();

        if eligible.is_empty() {
            for (idx, instance) in entry.instances.iter_mut().enumerate() {
                if instance.circuit_expired(now) {
                    info!(
                        "Instance {} of {} re-admitted after circuit cool-down",
                        instance.address, service_name
                    );
                    instance.reset_circuit();
                    eligible.push(idx);
                }
            }
        }

        if eligible.is_empty() {
            debug!("No healthy instance available for service: {}", service_name);
            return None;
        }

        let candidates: Vec<&InstanceRecord> =
            eligible.iter().map(|&idx| &entry.instances[idx]).collect();
        let selected = entry.balancer.select(&candidates).cloned();

        if let Some(instance) = &selected {
            debug!("Selected instance for {}: {}", service_name, instance.address);
        }
        selected
    }

    /// Report a failed call. Returns false if the instance is unknown.
    pub async fn mark_failure(&self, service_name: &str, instance_address: &str) -> bool {
        let now = Instant::now();
        let mut services = self.services.write().await;

        match services
            .get_mut(service_name)
            .and_then(|entry| entry.instance_mut(instance_address))
        {
            Some(instance) => {
                instance.record_failure(now, &self.breaker);
                debug!(
                    "Failure reported for {} ({}), consecutive failures: {}",
                    instance_address, service_name, instance.consecutive_failures
                );
                true
            }
            None => {
                warn!("Failure reported for unknown instance {} of {}", instance_address, service_name);
                false
            }
        }
    }

    /// Report a successful call. An open circuit stays open.
    pub async fn mark_success(&self, service_name: &str, instance_address: &str) -> bool {
        let mut services = self.services.write().await;

        match services
            .get_mut(service_name)
            .and_then(|entry| entry.instance_mut(instance_address))
        {
            Some(instance) => {
                instance.record_success();
                true
            }
            None => {
                warn!("Success reported for unknown instance {} of {}", instance_address, service_name);
                false
            }
        }
    }

    /// Snapshot of every instance, for the health prober
    pub async fn probe_targets(&self) -> Vec<ProbeTarget> {
        let services = self.services.read().await;
        services
            .iter()
            .flat_map(|(name, entry)| {
                entry.instances.iter().map(move |instance| ProbeTarget {
                    service: name.clone(),
                    instance: instance.clone(),
                })
            })
            .collect()
    }

    /// Apply one probe outcome. Returns false if the instance is gone.
    pub async fn apply_probe_result(
        &self,
        service_name: &str,
        instance_address: &str,
        outcome: ProbeOutcome,
    ) -> bool {
        let now = Instant::now();
        let mut services = self.services.write().await;

        match services
            .get_mut(service_name)
            .and_then(|entry| entry.instance_mut(instance_address))
        {
            Some(instance) => {
                instance.apply_probe(outcome, now, &self.breaker);
                true
            }
            None => {
                debug!(
                    "Dropping probe result for {} of {}: no longer registered",
                    instance_address, service_name
                );
                false
            }
        }
    }

    /// Get a copy of a service's instances
    pub async fn get_instances(&self, service_name: &str) -> Result<Vec<InstanceRecord>> {
        let services = self.services.read().await;
        services
            .get(service_name)
            .map(|entry| entry.instances.clone())
            .ok_or_else(|| CoreError::ServiceNotFound(service_name.to_string()))
    }

    /// Health summary of every service, keyed by name
    pub async fn get_service_status(&self) -> BTreeMap<String, ServiceStatus> {
        let now = Instant::now();
        let services = self.services.read().await;

        services
            .iter()
            .map(|(name, entry)| {
                let total_count = entry.instances.len();
                let healthy_count = entry.instances.iter().filter(|i| i.is_healthy).count();
                let health_percentage = if total_count == 0 {
                    0.0
                } else {
                    healthy_count as f64 / total_count as f64 * 100.0
                };

                let status = ServiceStatus {
                    strategy: entry.balancer.strategy(),
                    instances: entry.instances.iter().map(|i| i.status(now)).collect(),
                    healthy_count,
                    total_count,
                    health_percentage,
                };
                (name.clone(), status)
            })
            .collect()
    }

    /// List registered service names
    pub async fn service_names(&self) -> Vec<String> {
        let services = self.services.read().await;
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get count of registered services
    pub async fn service_count(&self) -> usize {
        let services = self.services.read().await;
        services.len()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
