//! Per-domain circuit breaker
//!
//! One breaker exists per target, holding a record per domain:
//! - Closed: fetches proceed; transient failures accumulate
//! - Open: the scheduler leases nothing for the domain until the cooldown
//!   elapses; its items stay `pending`
//! - HalfOpen: exactly one probe fetch may run; its outcome closes or
//!   reopens the breaker
//!
//! Every method takes the current `Instant` so transitions are testable
//! without sleeping.

use crate::state::BreakerState;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the breaker
    pub failure_threshold: u32,
    /// A failure streak older than this restarts from one
    pub failure_window: Duration,
    /// Time an open breaker waits before allowing a probe
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Default)]
struct DomainHealth {
    state: BreakerState,
    consecutive_failures: u32,
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Read-only view of one domain's breaker record
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerView {
    pub state: BreakerState,
    pub opened_at: Option<Instant>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    domains: DashMap<String, DomainHealth>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            domains: DashMap::new(),
        }
    }

    /// Returns true if the scheduler may lease an item for `domain`
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open here;
    /// a half-open breaker admits only one probe at a time.
    pub fn may_dispatch(&self, domain: &str, now: Instant) -> bool {
        let mut health = match self.domains.get_mut(domain) {
            Some(health) => health,
            None => return true,
        };

        match health.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => !health.probe_in_flight,
            BreakerState::Open => {
                let cooled = health
                    .opened_at
                    .map_or(true, |opened| now.saturating_duration_since(opened) >= self.config.cooldown);
                if cooled {
                    health.state = BreakerState::HalfOpen;
                    health.probe_in_flight = false;
                    info!("Circuit breaker HALF-OPEN for domain: {}", domain);
                }
                cooled
            }
        }
    }

    /// Records that a fetch was dispatched; returns true if it is the half-open probe
    pub fn on_dispatch(&self, domain: &str) -> bool {
        match self.domains.get_mut(domain) {
            Some(mut health) if health.state == BreakerState::HalfOpen => {
                health.probe_in_flight = true;
                debug!("Sending probe to {}", domain);
                true
            }
            _ => false,
        }
    }

    /// Records a fetched page
    ///
    /// `probe` is the flag `on_dispatch` returned for this attempt. While
    /// half-open only the probe decides the breaker; a success of a fetch
    /// dispatched before the breaker opened changes nothing.
    pub fn record_success(&self, domain: &str, probe: bool) {
        let Some(mut health) = self.domains.get_mut(domain) else {
            return;
        };

        match health.state {
            BreakerState::Closed => {
                health.consecutive_failures = 0;
                health.streak_started = None;
            }
            BreakerState::HalfOpen if probe => {
                health.state = BreakerState::Closed;
                health.consecutive_failures = 0;
                health.streak_started = None;
                health.opened_at = None;
                health.probe_in_flight = false;
                info!("Circuit breaker CLOSED for domain: {}", domain);
            }
            BreakerState::HalfOpen | BreakerState::Open => {
                debug!("Ignoring late success on {} while {}", domain, health.state);
            }
        }
    }

    /// Counts a transient failure; returns true if this failure opened the breaker
    ///
    /// A half-open breaker reopens only on its probe's failure.
    pub fn record_failure(&self, domain: &str, now: Instant, error: &str, probe: bool) -> bool {
        let mut health = self.domains.entry(domain.to_string()).or_default();

        match health.state {
            BreakerState::Closed => {
                let stale = health.streak_started.map_or(true, |started| {
                    now.saturating_duration_since(started) > self.config.failure_window
                });
                if stale {
                    health.streak_started = Some(now);
                    health.consecutive_failures = 1;
                } else {
                    health.consecutive_failures += 1;
                }

                if health.consecutive_failures >= self.config.failure_threshold {
                    health.state = BreakerState::Open;
                    health.opened_at = Some(now);
                    warn!(
                        "Circuit breaker OPEN for domain {} after {} consecutive failures. Last error: {}",
                        domain, health.consecutive_failures, error
                    );
                    true
                } else {
                    debug!(
                        "Circuit breaker failure for domain: {} ({}/{}): {}",
                        domain, health.consecutive_failures, self.config.failure_threshold, error
                    );
                    false
                }
            }
            BreakerState::HalfOpen if probe => {
                health.state = BreakerState::Open;
                health.opened_at = Some(now);
                health.probe_in_flight = false;
                health.consecutive_failures += 1;
                warn!(
                    "Circuit breaker probe failed for domain {}, reopening: {}",
                    domain, error
                );
                true
            }
            BreakerState::HalfOpen | BreakerState::Open => {
                // a fetch dispatched before the breaker opened
                health.consecutive_failures += 1;
                false
            }
        }
    }

    /// Records an attempt that says nothing about domain health
    ///
    /// Permanent errors and crashed workers end this way. A half-open probe
    /// that ends this way frees the probe slot so another item can probe.
    pub fn record_neutral(&self, domain: &str, probe: bool) {
        if !probe {
            return;
        }
        if let Some(mut health) = self.domains.get_mut(domain) {
            health.probe_in_flight = false;
        }
    }

    pub fn state(&self, domain: &str) -> BreakerState {
        self.domains
            .get(domain)
            .map_or(BreakerState::Closed, |health| health.state)
    }

    /// True when the domain is open and its cooldown has not yet elapsed
    pub fn is_blocking(&self, domain: &str, now: Instant) -> bool {
        self.time_until_half_open(domain, now).is_some()
    }

    /// Remaining cooldown for an open breaker
    pub fn time_until_half_open(&self, domain: &str, now: Instant) -> Option<Duration> {
        let health = self.domains.get(domain)?;
        if health.state != BreakerState::Open {
            return None;
        }
        let reopen_at = health.opened_at? + self.config.cooldown;
        (reopen_at > now).then(|| reopen_at - now)
    }

    pub fn open_domains(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .domains
            .iter()
            .filter(|entry| entry.state == BreakerState::Open)
            .map(|entry| entry.key().clone())
            .collect();
        open.sort();
        open
    }

    pub fn view(&self, domain: &str) -> Option<BreakerView> {
        self.domains.get(domain).map(|health| BreakerView {
            state: health.state,
            opened_at: health.opened_at,
            consecutive_failures: health.consecutive_failures,
        })
    }

    pub fn domains(&self) -> Vec<String> {
        self.domains.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Seeds a domain's record from persisted state
    ///
    /// A persisted half-open breaker comes back without a probe in flight.
    pub fn restore(&self, domain: &str, view: BreakerView, now: Instant) {
        let opened_at = match view.state {
            BreakerState::Closed => None,
            _ => Some(view.opened_at.unwrap_or(now)),
        };
        self.domains.insert(
            domain.to_string(),
            DomainHealth {
                state: view.state,
                consecutive_failures: view.consecutive_failures,
                streak_started: None,
                opened_at,
                probe_in_flight: false,
            },
        );
    }
}
