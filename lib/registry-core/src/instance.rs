//! Backend instance records and their live health state

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_weight() -> u32 {
    1
}

/// Static description of one replica, as found in bootstrap configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Display name; falls back to the address when empty
    #[serde(default)]
    pub name: String,
    /// Base address, e.g. `http://10.0.0.1:8080`
    pub address: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Per-probe timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            health_path: default_health_path(),
            timeout_secs: default_timeout_secs(),
            weight: default_weight(),
        }
    }
}

/// Result of a single health probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Health endpoint answered 200
    Healthy,
    /// Health endpoint answered with another status code
    UnhealthyStatus(u16),
    /// No answer within the instance's probe timeout
    Timeout,
    /// Connection could not be established or broke mid-request
    ConnectionError(String),
    /// The probe task itself failed
    Unexpected(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }

    /// Short stable label, used as a metrics dimension
    pub fn label(&self) -> &'static str {
        match self {
            ProbeOutcome::Healthy => "healthy",
            ProbeOutcome::UnhealthyStatus(_) => "unhealthy_status",
            ProbeOutcome::Timeout => "timeout",
            ProbeOutcome::ConnectionError(_) => "connection_error",
            ProbeOutcome::Unexpected(_) => "unexpected",
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Healthy => write!(f, "healthy"),
            ProbeOutcome::UnhealthyStatus(code) => write!(f, "unhealthy status {}", code),
            ProbeOutcome::Timeout => write!(f, "timeout"),
            ProbeOutcome::ConnectionError(e) => write!(f, "connection error: {}", e),
            ProbeOutcome::Unexpected(e) => write!(f, "unexpected error: {}", e),
        }
    }
}

/// One deployed replica: identity plus live health and circuit state
#[derive(Clone, Debug)]
pub struct InstanceRecord {
    pub name: String,
    pub address: String,
    pub health_path: String,
    pub timeout: Duration,
    /// Selection weight, always at least 1
    pub weight: u32,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub circuit: CircuitBreaker,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_probe: Option<ProbeOutcome>,
}

impl InstanceRecord {
    pub fn new(config: InstanceConfig) -> Self {
        let name = if config.name.is_empty() {
            config.address.clone()
        } else {
            config.name
        };

        Self {
            name,
            address: config.address,
            health_path: config.health_path,
            timeout: Duration::from_secs(config.timeout_secs),
            weight: config.weight.max(1),
            is_healthy: true,
            consecutive_failures: 0,
            circuit: CircuitBreaker::new(),
            last_health_check: None,
            last_probe: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn circuit_open(&self) -> bool {
        self.circuit.is_open()
    }

    pub fn circuit_open_until(&self) -> Option<Instant> {
        self.circuit.open_until()
    }

    /// Healthy and not excluded by an open circuit
    pub fn is_eligible(&self) -> bool {
        self.is_healthy && !self.circuit.is_open()
    }

    /// Full URL of the health endpoint
    pub fn health_url(&self) -> String {
        let base = self.address.trim_end_matches('/');
        if self.health_path.starts_with('/') {
            format!("{}{}", base, self.health_path)
        } else {
            format!("{}/{}", base, self.health_path)
        }
    }

    /// Count a failure and open the circuit once the threshold is reached.
    ///
    /// Returns true when this failure opened (or re-armed) the circuit.
    pub fn record_failure(&mut self, now: Instant, breaker: &CircuitBreakerConfig) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if breaker.should_trip(self.consecutive_failures) {
            let was_open = self.circuit.is_open();
            self.circuit.trip(now, breaker.cool_down);
            if !was_open {
                warn!(
                    "Instance {} circuit opened after {} consecutive failures",
                    self.address, self.consecutive_failures
                );
            }
            return true;
        }
        false
    }

    /// Caller-reported success. Leaves an open circuit open.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.is_healthy = true;
    }

    /// Apply the outcome of a health probe taken at `now`
    pub fn apply_probe(
        &mut self,
        outcome: ProbeOutcome,
        now: Instant,
        breaker: &CircuitBreakerConfig,
    ) {
        self.last_health_check = Some(Utc::now());

        if outcome.is_healthy() {
            self.is_healthy = true;
            self.consecutive_failures = 0;
            if self.circuit.is_open() {
                debug!("Instance {} recovered, closing circuit", self.address);
                self.circuit.close();
            }
        } else {
            warn!("Instance {} health check failed: {}", self.address, outcome);
            self.is_healthy = false;
            self.record_failure(now, breaker);
        }

        self.last_probe = Some(outcome);
    }

    /// True when the circuit is open and its cool-down has run out by `now`
    pub fn circuit_expired(&self, now: Instant) -> bool {
        self.circuit.is_expired(now)
    }

    /// Close an expired circuit and clear the failure count
    pub fn reset_circuit(&mut self) {
        self.circuit.close();
        self.consecutive_failures = 0;
    }

    /// Read-only view for observability
    pub fn status(&self, now: Instant) -> InstanceStatus {
        InstanceStatus {
            name: self.name.clone(),
            address: self.address.clone(),
            weight: self.weight,
            is_healthy: self.is_healthy,
            consecutive_failures: self.consecutive_failures,
            circuit_state: self.circuit.state(),
            circuit_open: self.circuit.is_open(),
            circuit_open_remaining_ms: self
                .circuit
                .remaining(now)
                .map(|d| d.as_millis() as u64),
            last_health_check: self.last_health_check,
            last_probe: self.last_probe.as_ref().map(|o| o.to_string()),
        }
    }
}

impl From<InstanceConfig> for InstanceRecord {
    fn from(config: InstanceConfig) -> Self {
        Self::new(config)
    }
}

/// Snapshot of one instance as reported by the status endpoint
#[derive(Clone, Debug, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub address: String,
    pub weight: u32,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
    pub circuit_open: bool,
    pub circuit_open_remaining_ms: Option<u64>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_probe: Option<String>,
}
