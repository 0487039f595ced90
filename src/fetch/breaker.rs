//! Per-host circuit breaker
//!
//! Tracks consecutive fetch failures per host across three states:
//! Closed (normal), Open (short-circuit every call), and HalfOpen
//! (a bounded number of probe requests after the reset timeout). A
//! single probe success closes the circuit; a probe failure reopens it.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::{HarvestError, HarvestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct HostHealth {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_left: u32,
}

impl HostHealth {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probes_left: 0,
        }
    }
}

/// Shared breaker map, one entry per host.
pub struct CircuitBreaker {
    hosts: DashMap<String, HostHealth>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            config,
        }
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    /// Gate a fetch attempt. `Err(CircuitOpen)` means the caller must
    /// not touch the network for this host yet.
    pub fn preflight(&self, host: &str) -> HarvestResult<()> {
        let mut health = self
            .hosts
            .entry(host.to_ascii_lowercase())
            .or_insert_with(HostHealth::new);

        match health.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if health.probes_left > 0 {
                    health.probes_left -= 1;
                    Ok(())
                } else {
                    Err(HarvestError::CircuitOpen {
                        host: host.to_string(),
                        retry_after: self.reset_timeout(),
                    })
                }
            }
            CircuitState::Open => {
                let elapsed = health.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout() {
                    health.state = CircuitState::HalfOpen;
                    health.probes_left = self.config.half_open_probes.saturating_sub(1);
                    info!(host = %host, "circuit half-open, probing");
                    Ok(())
                } else {
                    Err(HarvestError::CircuitOpen {
                        host: host.to_string(),
                        retry_after: self.reset_timeout().saturating_sub(elapsed),
                    })
                }
            }
        }
    }

    /// Record a successful fetch; closes a half-open circuit.
    pub fn record_success(&self, host: &str) {
        if let Some(mut health) = self.hosts.get_mut(&host.to_ascii_lowercase()) {
            health.consecutive_failures = 0;
            if health.state != CircuitState::Closed {
                info!(host = %host, "circuit closed");
            }
            health.state = CircuitState::Closed;
            health.opened_at = None;
            health.probes_left = 0;
        }
    }

    /// Record a failed fetch; may open the circuit.
    pub fn record_failure(&self, host: &str, error: &str) {
        let mut health = self
            .hosts
            .entry(host.to_ascii_lowercase())
            .or_insert_with(HostHealth::new);

        health.consecutive_failures += 1;

        match health.state {
            CircuitState::HalfOpen => {
                health.state = CircuitState::Open;
                health.opened_at = Some(Instant::now());
                warn!(host = %host, error = %error, "probe failed, circuit reopened");
            }
            CircuitState::Closed => {
                if health.consecutive_failures >= self.config.failure_threshold {
                    health.state = CircuitState::Open;
                    health.opened_at = Some(Instant::now());
                    warn!(
                        host = %host,
                        failures = health.consecutive_failures,
                        error = %error,
                        "circuit opened"
                    );
                } else {
                    debug!(
                        host = %host,
                        failures = health.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "fetch failure recorded"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state for a host; `Closed` when the host is unknown.
    #[must_use]
    pub fn state(&self, host: &str) -> CircuitState {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .map(|h| h.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Hosts currently in the Open state.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.hosts
            .iter()
            .filter(|e| e.value().state == CircuitState::Open)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
            half_open_probes: probes,
        })
    }

    #[test]
    fn opens_after_threshold() {
        let cb = breaker(3, 60_000, 3);
        for _ in 0..2 {
            cb.record_failure("example.com", "timeout");
            assert!(cb.preflight("example.com").is_ok());
        }
        cb.record_failure("example.com", "timeout");
        assert_eq!(cb.state("example.com"), CircuitState::Open);
        let err = cb.preflight("example.com").unwrap_err();
        assert_eq!(err.kind(), "CircuitOpen");
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breaker(3, 60_000, 3);
        cb.record_failure("example.com", "timeout");
        cb.record_failure("example.com", "timeout");
        cb.record_success("example.com");
        cb.record_failure("example.com", "timeout");
        cb.record_failure("example.com", "timeout");
        assert_eq!(cb.state("example.com"), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_reset_with_probe_budget() {
        let cb = breaker(1, 10, 2);
        cb.record_failure("example.com", "connect");
        assert_eq!(cb.state("example.com"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        // Two probes allowed, the third short-circuits.
        assert!(cb.preflight("example.com").is_ok());
        assert!(cb.preflight("example.com").is_ok());
        assert!(cb.preflight("example.com").is_err());
    }

    #[test]
    fn probe_success_closes() {
        let cb = breaker(1, 10, 3);
        cb.record_failure("example.com", "connect");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.preflight("example.com").is_ok());
        cb.record_success("example.com");
        assert_eq!(cb.state("example.com"), CircuitState::Closed);
        assert_eq!(cb.open_count(), 0);
    }

    #[test]
    fn probe_failure_reopens() {
        let cb = breaker(1, 10, 3);
        cb.record_failure("example.com", "connect");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.preflight("example.com").is_ok());
        cb.record_failure("example.com", "connect again");
        assert_eq!(cb.state("example.com"), CircuitState::Open);
        assert!(cb.preflight("example.com").is_err());
    }
}
