//! Health probing and health metrics for the service registry
pub mod health_check;
pub mod metrics;

pub use health_check::{
    CycleSummary, HealthCheckConfig, HealthCheckHandle, HealthChecker, HealthProbe, HttpHealthProbe,
};
pub use metrics::RegistryMetrics;
