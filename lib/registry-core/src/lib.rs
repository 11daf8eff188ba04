//! Service registry core for the API gateway
//!
//! This library provides:
//! - Instance records with live health and circuit-breaker state
//! - A service registry store with per-service load balancing
//! - Caller outcome reporting (success/failure) feeding the circuit breaker
//! - Bootstrap configuration loading

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod instance;
pub mod load_balancer;
pub mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{CircuitBreakerSettings, GatewayConfig, HealthCheckSettings, ServiceDefinition};
pub use error::{CoreError, Result};
pub use instance::{InstanceConfig, InstanceRecord, InstanceStatus, ProbeOutcome};
pub use load_balancer::{LoadBalancer, LoadBalancingStrategy};
pub use registry::{ProbeTarget, ServiceConfig, ServiceRegistry, ServiceStatus};
