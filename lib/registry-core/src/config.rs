//! Bootstrap configuration loaded at process start

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::instance::InstanceConfig;
use crate::load_balancer::LoadBalancingStrategy;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Top-level bootstrap document
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub health_check: HealthCheckSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub services: Vec<ServiceDefinition>,
}

/// Health prober settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSettings {
    /// Pause between the end of one probe cycle and the start of the next
    pub interval_secs: u64,
    /// Upper bound for any single probe, whatever the instance asks for
    pub timeout_secs: u64,
    /// Probes allowed in flight at once
    pub max_concurrent_probes: usize,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
            max_concurrent_probes: 32,
        }
    }
}

impl HealthCheckSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub cool_down_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            cool_down_secs: defaults.cool_down.as_secs(),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            cool_down: Duration::from_secs(settings.cool_down_secs),
        }
    }
}

/// One logical service and its statically known replicas
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

impl GatewayConfig {
    /// Parse and validate a YAML bootstrap document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        debug!("Parsed bootstrap configuration with {} services", config.services.len());
        Ok(config)
    }

    /// Read, parse and validate a YAML bootstrap file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_check.interval_secs == 0 {
            return Err(CoreError::InvalidConfiguration(
                "health_check.interval_secs must be positive".to_string(),
            ));
        }
        if self.health_check.timeout_secs == 0 {
            return Err(CoreError::InvalidConfiguration(
                "health_check.timeout_secs must be positive".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(CoreError::InvalidConfiguration(
                "circuit_breaker.failure_threshold must be positive".to_string(),
            ));
        }
        if self.health_check.max_concurrent_probes == 0 {
            return Err(CoreError::InvalidConfiguration(
                "health_check.max_concurrent_probes must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(CoreError::InvalidConfiguration(
                    "service name must not be empty".to_string(),
                ));
            }
            if !seen.insert(service.name.as_str()) {
                return Err(CoreError::InvalidConfiguration(format!(
                    "duplicate service: {}",
                    service.name
                )));
            }
            if let Some(instance) = service.instances.iter().find(|i| i.address.is_empty()) {
                return Err(CoreError::InvalidConfiguration(format!(
                    "instance {:?} of service {} has no address",
                    instance.name, service.name
                )));
            }
            if let Some(instance) = service.instances.iter().find(|i| i.timeout_secs == 0) {
                return Err(CoreError::InvalidConfiguration(format!(
                    "instance {} of service {} has a zero timeout_secs",
                    instance.address, service.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
health_check:
  interval_secs: 10
  max_concurrent_probes: 4
circuit_breaker:
  failure_threshold: 3
services:
  - name: users
    strategy: weighted
    instances:
      - name: users-a
        address: http://10.0.0.1:8001
        weight: 9
      - address: http://10.0.0.2:8001
        health_path: /healthz
        timeout_secs: 2
  - name: bookings
"#;

    #[test]
    fn test_parse_sample() {
        let config = GatewayConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.health_check.interval(), Duration::from_secs(10));
        assert_eq!(config.health_check.timeout(), Duration::from_secs(5));
        assert_eq!(config.health_check.max_concurrent_probes, 4);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.cool_down_secs, 60);

        assert_eq!(config.services.len(), 2);
        let users = &config.services[0];
        assert_eq!(users.strategy, LoadBalancingStrategy::Weighted);
        assert_eq!(users.instances[0].weight, 9);
        assert_eq!(users.instances[1].health_path, "/healthz");
        assert_eq!(users.instances[1].timeout_secs, 2);

        let bookings = &config.services[1];
        assert_eq!(bookings.strategy, LoadBalancingStrategy::RoundRobin);
        assert!(bookings.instances.is_empty());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = GatewayConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.health_check.interval_secs, 30);

        let breaker = CircuitBreakerConfig::from(&config.circuit_breaker);
        assert_eq!(breaker, CircuitBreakerConfig::default());
    }

    #[test]
    fn test_rejects_duplicate_service() {
        let yaml = "services:\n  - name: a\n  - name: a\n";
        assert!(matches!(
            GatewayConfig::from_yaml_str(yaml),
            Err(CoreError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_rejects_empty_name_and_address() {
        assert!(GatewayConfig::from_yaml_str("services:\n  - name: ''\n").is_err());
        let yaml = "services:\n  - name: a\n    instances:\n      - address: ''\n";
        assert!(GatewayConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let yaml = "health_check:\n  interval_secs: 0\n";
        assert!(GatewayConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts_and_threshold() {
        for yaml in [
            "health_check:\n  timeout_secs: 0\n",
            "circuit_breaker:\n  failure_threshold: 0\n",
            "services:\n  - name: a\n    instances:\n      - address: http://a\n        timeout_secs: 0\n",
        ] {
            assert!(
                matches!(
                    GatewayConfig::from_yaml_str(yaml),
                    Err(CoreError::InvalidConfiguration(_))
                ),
                "accepted {:?}",
                yaml
            );
        }
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            GatewayConfig::from_yaml_str("services: [1, 2"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            GatewayConfig::load("/nonexistent/registry.yaml"),
            Err(CoreError::Io(_))
        ));
    }
}
