//! Circuit breaker and selection working together with the health checker

use async_trait::async_trait;
use registry_core::{
    InstanceConfig, InstanceRecord, LoadBalancingStrategy, ProbeOutcome, ServiceConfig,
    ServiceRegistry,
};
use registry_health::{HealthCheckConfig, HealthChecker, HealthProbe};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const A: &str = "http://a.internal:8080";
const B: &str = "http://b.internal:8080";

/// Reports A as down until told otherwise; B is always up
struct ToggleProbe {
    a_up: AtomicBool,
}

#[async_trait]
impl HealthProbe for ToggleProbe {
    async fn probe(&self, url: &str, _timeout: Duration) -> ProbeOutcome {
        if url.starts_with(A) && !self.a_up.load(Ordering::SeqCst) {
            ProbeOutcome::ConnectionError("connection refused".to_string())
        } else {
            ProbeOutcome::Healthy
        }
    }
}

async fn two_instance_registry() -> Arc<ServiceRegistry> {
    let registry = ServiceRegistry::new();
    registry
        .register_service(
            ServiceConfig::new("x", LoadBalancingStrategy::RoundRobin)
                .with_instance(InstanceRecord::new(InstanceConfig::new("a", A)))
                .with_instance(InstanceRecord::new(InstanceConfig::new("b", B))),
        )
        .await
        .unwrap();
    Arc::new(registry)
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_excludes_instance_until_probe_recovers() {
    let registry = two_instance_registry().await;

    for _ in 0..5 {
        assert!(registry.mark_failure("x", A).await);
    }

    for _ in 0..10 {
        let picked = registry.get_healthy_instance("x").await.unwrap();
        assert_eq!(picked.address, B);
    }

    tokio::time::advance(Duration::from_secs(60)).await;

    let probe = Arc::new(ToggleProbe {
        a_up: AtomicBool::new(true),
    });
    let checker = HealthChecker::new(registry.clone(), probe, HealthCheckConfig::default());
    checker.run_cycle().await.unwrap();

    let first = registry.get_healthy_instance("x").await.unwrap().address;
    let second = registry.get_healthy_instance("x").await.unwrap().address;
    let third = registry.get_healthy_instance("x").await.unwrap().address;
    assert_ne!(first, second);
    assert_eq!(first, third);

    let seen: HashSet<String> = [first, second].into_iter().collect();
    assert!(seen.contains(A) && seen.contains(B));
}

#[tokio::test(start_paused = true)]
async fn test_probe_loop_drives_breaker_and_recovery() {
    let registry = two_instance_registry().await;
    let probe = Arc::new(ToggleProbe {
        a_up: AtomicBool::new(false),
    });
    let config = HealthCheckConfig {
        check_interval: Duration::from_secs(30),
        ..Default::default()
    };
    let handle = HealthChecker::new(registry.clone(), probe.clone(), config).spawn();

    // Cycles at 0, 30, 60, 90 and 120 seconds: five failures for A
    tokio::time::sleep(Duration::from_secs(125)).await;
    let a = registry.get_instances("x").await.unwrap()[0].clone();
    assert!(!a.is_healthy);
    assert!(a.circuit_open());
    for _ in 0..5 {
        assert_eq!(registry.get_healthy_instance("x").await.unwrap().address, B);
    }

    probe.a_up.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;

    let a = registry.get_instances("x").await.unwrap()[0].clone();
    assert!(a.is_healthy);
    assert!(!a.circuit_open());
    assert_eq!(a.consecutive_failures, 0);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_all_down_then_cool_down_readmits() {
    let registry = two_instance_registry().await;
    for address in [A, B] {
        for _ in 0..5 {
            registry.mark_failure("x", address).await;
        }
    }
    assert!(registry.get_healthy_instance("x").await.is_none());

    tokio::time::advance(Duration::from_secs(61)).await;
    let picked = registry.get_healthy_instance("x").await.unwrap();
    assert_eq!(picked.consecutive_failures, 0);
    assert!(!picked.circuit_open());

    let status = registry.get_service_status().await;
    assert!(status["x"].instances.iter().all(|i| !i.circuit_open));
    assert_eq!(status["x"].health_percentage, 100.0);
}
