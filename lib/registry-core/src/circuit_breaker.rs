//! Per-instance circuit breaker
//!
//! The breaker has no half-open state: once the cool-down window elapses the
//! instance is re-admitted as a normal candidate (lazily, at selection time)
//! or closed by the next successful health probe.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Circuit breaker states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - the instance is a selection candidate
    Closed,
    /// Circuit is open - the instance is excluded until the cool-down elapses
    Open,
}

/// Circuit breaker configuration shared by every instance in a registry
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an opened circuit keeps the instance out of rotation
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Whether a failure count has reached the trip threshold
    pub fn should_trip(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.failure_threshold
    }
}

/// Breaker state carried by one instance.
///
/// The circuit is open exactly when a deadline is stored, so an open circuit
/// can never lack its `open_until` timestamp.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CircuitBreaker {
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CircuitState {
        if self.open_until.is_some() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_until.is_some()
    }

    /// Deadline after which the open circuit may be re-admitted
    pub fn open_until(&self) -> Option<Instant> {
        self.open_until
    }

    /// Open (or re-arm) the circuit for `cool_down` starting at `now`
    pub fn trip(&mut self, now: Instant, cool_down: Duration) {
        // A zero cool-down would produce a deadline that is not in the future.
        let cool_down = cool_down.max(Duration::from_millis(1));
        self.open_until = Some(now + cool_down);
        debug!("Circuit breaker: open for {:?}", cool_down);
    }

    pub fn close(&mut self) {
        if self.open_until.take().is_some() {
            debug!("Circuit breaker: closing circuit");
        }
    }

    /// True when the circuit is open and its cool-down has elapsed
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.open_until, Some(until) if until <= now)
    }

    /// Time left in the cool-down window, if open
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.open_until
            .map(|until| until.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cool_down, Duration::from_secs(60));
    }

    #[test]
    fn test_should_trip_at_threshold() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            cool_down: Duration::from_secs(60),
        };
        assert!(!config.should_trip(2));
        assert!(config.should_trip(3));
        assert!(config.should_trip(4));
    }

    #[test]
    fn test_new_breaker_is_closed() {
        let cb = CircuitBreaker::new();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.is_open());
        assert!(cb.open_until().is_none());
    }

    #[test]
    fn test_trip_sets_future_deadline() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new();
        cb.trip(now, Duration::from_secs(60));

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.open_until().unwrap() > now);
        assert!(!cb.is_expired(now));
        assert!(cb.is_expired(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_cool_down_still_in_future() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new();
        cb.trip(now, Duration::ZERO);
        assert!(cb.open_until().unwrap() > now);
    }

    #[test]
    fn test_close_clears_deadline() {
        let mut cb = CircuitBreaker::new();
        cb.trip(Instant::now(), Duration::from_secs(60));
        cb.close();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.open_until().is_none());
        assert!(!cb.is_expired(Instant::now()));
    }

    #[test]
    fn test_remaining() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new();
        assert!(cb.remaining(now).is_none());

        cb.trip(now, Duration::from_secs(60));
        assert_eq!(cb.remaining(now), Some(Duration::from_secs(60)));
        assert_eq!(
            cb.remaining(now + Duration::from_secs(90)),
            Some(Duration::ZERO)
        );
    }
}
