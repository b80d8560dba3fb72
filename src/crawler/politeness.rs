//! Per-domain politeness and concurrency accounting
//!
//! Each domain gets its own lockable record (a `DashMap` entry) holding the
//! last fetch instant and its in-flight count; the global in-flight count is
//! a single atomic. Slots are handed out as [`SlotGuard`]s that release on
//! drop, so every acquire is balanced on every exit path of a worker.

use dashmap::DashMap;
use rand::{thread_rng, Rng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Politeness parameters for one target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolitenessConfig {
    pub base_delay: Duration,
    /// Upper bound of the extra random delay as a fraction of `base_delay`
    pub jitter_fraction: f64,
    pub per_domain_limit: usize,
    pub global_limit: usize,
}

#[derive(Debug, Default)]
struct DomainSlots {
    in_flight: usize,
    /// Latest fetch start or completion
    last_fetch: Option<Instant>,
}

/// A domain's live politeness record
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView {
    pub domain: String,
    pub in_flight: usize,
    pub last_fetch: Option<Instant>,
}

/// Tracks spacing and concurrency of fetches per domain and globally
#[derive(Debug)]
pub struct PolitenessTracker {
    config: PolitenessConfig,
    domains: DashMap<String, DomainSlots>,
    global_in_flight: AtomicUsize,
}

impl PolitenessTracker {
    pub fn new(config: PolitenessConfig) -> Self {
        Self {
            config,
            domains: DashMap::new(),
            global_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &PolitenessConfig {
        &self.config
    }

    /// Draws one required spacing: `base + uniform(0, jitter_fraction * base)`
    pub fn sample_delay(&self, rng: &mut impl Rng) -> Duration {
        let base = self.config.base_delay;
        let spread = base.as_secs_f64() * self.config.jitter_fraction.clamp(0.0, 1.0);
        if spread <= 0.0 {
            return base;
        }
        base + Duration::from_secs_f64(rng.gen_range(0.0..=spread))
    }

    /// Returns true if enough time has passed since the domain's last fetch
    ///
    /// The required spacing is re-drawn on every call.
    pub fn may_fetch_at(&self, domain: &str, now: Instant) -> bool {
        self.may_fetch_with(domain, now, &mut thread_rng())
    }

    pub fn may_fetch_now(&self, domain: &str) -> bool {
        self.may_fetch_at(domain, Instant::now())
    }

    fn may_fetch_with(&self, domain: &str, now: Instant, rng: &mut impl Rng) -> bool {
        let last = match self.domains.get(domain).and_then(|slots| slots.last_fetch) {
            Some(last) => last,
            None => return true,
        };

        let delay = self.sample_delay(rng);
        let ready = now.saturating_duration_since(last) >= delay;
        tracing::trace!(domain, ?delay, ready, "Politeness check");
        ready
    }

    /// Time until the domain's base delay has certainly elapsed
    ///
    /// Jitter may push the actual permission a little later; callers re-check.
    pub fn time_until_ready(&self, domain: &str, now: Instant) -> Option<Duration> {
        let last = self.domains.get(domain).and_then(|slots| slots.last_fetch)?;
        let ready_at = last + self.config.base_delay;
        (ready_at > now).then(|| ready_at - now)
    }

    /// Claims a per-domain and a global slot if both are free
    ///
    /// A successful acquire also stamps the domain's last fetch time, so two
    /// concurrent fetches to one domain still start at least one delay apart.
    pub fn acquire_slot(&self, domain: &str, now: Instant) -> bool {
        let mut slots = self.domains.entry(domain.to_string()).or_default();
        if slots.in_flight >= self.config.per_domain_limit {
            return false;
        }

        let limit = self.config.global_limit;
        let claimed = self
            .global_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok();
        if !claimed {
            return false;
        }

        slots.in_flight += 1;
        slots.last_fetch = Some(now);
        true
    }

    /// Returns a slot and records `now` as the domain's last fetch
    pub fn release_slot(&self, domain: &str, now: Instant) {
        let mut slots = self.domains.entry(domain.to_string()).or_default();
        if slots.in_flight == 0 {
            tracing::warn!(domain, "Slot released without a matching acquire");
            return;
        }
        slots.in_flight -= 1;
        slots.last_fetch = Some(slots.last_fetch.map_or(now, |last| last.max(now)));
        // the domain entry guard serializes this with acquire for the same domain
        let _ = self
            .global_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Scoped acquire: the returned guard releases the slot when dropped
    pub fn try_acquire(self: &Arc<Self>, domain: &str) -> Option<SlotGuard> {
        self.acquire_slot(domain, Instant::now())
            .then(|| SlotGuard {
                tracker: Arc::clone(self),
                domain: domain.to_string(),
            })
    }

    pub fn global_in_flight(&self) -> usize {
        self.global_in_flight.load(Ordering::Acquire)
    }

    pub fn domain_in_flight(&self, domain: &str) -> usize {
        self.domains.get(domain).map_or(0, |slots| slots.in_flight)
    }

    /// True when the global limit leaves no room for another fetch
    pub fn is_saturated(&self) -> bool {
        self.global_in_flight() >= self.config.global_limit
    }

    pub fn slots(&self) -> Vec<SlotView> {
        self.domains
            .iter()
            .map(|entry| SlotView {
                domain: entry.key().clone(),
                in_flight: entry.in_flight,
                last_fetch: entry.last_fetch,
            })
            .collect()
    }

    /// Seeds a domain's last fetch time from persisted state
    pub fn restore_last_fetch(&self, domain: &str, at: Instant) {
        let mut slots = self.domains.entry(domain.to_string()).or_default();
        slots.last_fetch = Some(slots.last_fetch.map_or(at, |last| last.max(at)));
    }
}

/// A held fetch slot; dropping it calls [`PolitenessTracker::release_slot`]
#[derive(Debug)]
pub struct SlotGuard {
    tracker: Arc<PolitenessTracker>,
    domain: String,
}

impl SlotGuard {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.tracker.release_slot(&self.domain, Instant::now());
    }
}
