//! Scheduler: picks the next item to fetch for one target
//!
//! The scheduler serializes dispatch decisions. On every call it walks the
//! domains that still have pending items, starting after the domain it served
//! last (round-robin), and hands out the first item whose domain passes:
//! 1. the circuit breaker (closed, or half-open without a probe)
//! 2. the politeness delay
//! 3. a free per-domain and global concurrency slot
//!
//! When nothing is eligible it reports how long to idle instead.

use crate::crawler::breaker::CircuitBreaker;
use crate::crawler::politeness::{PolitenessTracker, SlotGuard};
use crate::store::{CrawlItem, JobStore, StoreResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Re-check interval for a domain held back only by politeness jitter
const JITTER_RECHECK: Duration = Duration::from_millis(50);

/// An item leased for exclusive processing, with the slot it runs under
#[derive(Debug)]
pub struct Lease {
    pub item: CrawlItem,
    pub slot: SlotGuard,
    /// True when this fetch is a half-open breaker probe
    pub probe: bool,
}

/// What the scheduler wants the coordinator to do next
#[derive(Debug)]
pub enum Decision {
    Dispatch(Lease),
    /// Nothing eligible now; re-check after the hint, or sooner if a worker finishes
    Idle(Option<Duration>),
    /// No pending items and no fetch in flight
    Drained,
    /// Every domain with pending work has an open breaker cooling down
    AllOpen(Vec<String>),
}

pub struct Scheduler {
    target: String,
    store: Arc<dyn JobStore>,
    politeness: Arc<PolitenessTracker>,
    breaker: Arc<CircuitBreaker>,
    stop_when_all_open: bool,
    last_dispatched: Option<String>,
}

impl Scheduler {
    pub fn new(
        target: impl Into<String>,
        store: Arc<dyn JobStore>,
        politeness: Arc<PolitenessTracker>,
        breaker: Arc<CircuitBreaker>,
        stop_when_all_open: bool,
    ) -> Self {
        Self {
            target: target.into(),
            store,
            politeness,
            breaker,
            stop_when_all_open,
            last_dispatched: None,
        }
    }

    /// Decides the next step at `now`
    pub fn next(&mut self, now: Instant) -> StoreResult<Decision> {
        let domains = self.store.pending_domains(&self.target)?;
        if domains.is_empty() {
            return Ok(if self.politeness.global_in_flight() == 0 {
                Decision::Drained
            } else {
                Decision::Idle(None)
            });
        }

        if self.stop_when_all_open
            && self.politeness.global_in_flight() == 0
            && domains.iter().all(|d| self.breaker.is_blocking(d, now))
        {
            return Ok(Decision::AllOpen(domains));
        }

        if self.politeness.is_saturated() {
            return Ok(Decision::Idle(None));
        }

        let start = self
            .last_dispatched
            .as_ref()
            .and_then(|last| domains.iter().position(|d| d == last))
            .map_or(0, |pos| pos + 1);

        let mut hint: Option<Duration> = None;
        for offset in 0..domains.len() {
            let domain = &domains[(start + offset) % domains.len()];

            if !self.breaker.may_dispatch(domain, now) {
                merge_hint(&mut hint, self.breaker.time_until_half_open(domain, now));
                continue;
            }

            if !self.politeness.may_fetch_at(domain, now) {
                let wait = self
                    .politeness
                    .time_until_ready(domain, now)
                    .unwrap_or(JITTER_RECHECK);
                merge_hint(&mut hint, Some(wait));
                continue;
            }

            // a full domain frees up when one of its workers finishes
            let Some(slot) = self.politeness.try_acquire(domain) else {
                continue;
            };

            let Some(item) = self.store.lease_next(&self.target, Some(domain))? else {
                tracing::debug!("Domain {} had no pending item to lease", domain);
                continue;
            };

            let probe = self.breaker.on_dispatch(domain);
            tracing::debug!(
                "Dispatching {} (attempt {}{})",
                item.url,
                item.attempt_count,
                if probe { ", probe" } else { "" }
            );
            self.last_dispatched = Some(domain.clone());
            return Ok(Decision::Dispatch(Lease { item, slot, probe }));
        }

        Ok(Decision::Idle(hint))
    }
}

fn merge_hint(hint: &mut Option<Duration>, candidate: Option<Duration>) {
    if let Some(candidate) = candidate {
        *hint = Some(hint.map_or(candidate, |current| current.min(candidate)));
    }
}
