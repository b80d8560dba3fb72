//! Worker pool
//!
//! Each leased item runs as one task on a `JoinSet` bounded by the target's
//! global concurrency (the scheduler never hands out more slots than that).
//! A worker fetches under a timeout, classifies the result, records it in the
//! job store and the circuit breaker, enqueues pagination follow-ups, and
//! passes the page to the ingest sink. The lease's slot is released on every
//! path, including panics, because it is dropped with the task. A task that
//! panics or is cancelled still reports: the pool completes its item as a
//! transient failure so nothing stays in flight.

use crate::crawler::breaker::CircuitBreaker;
use crate::crawler::fetcher::{FetchError, FetchMode, Fetcher, Page};
use crate::crawler::pagination::PaginationDriver;
use crate::crawler::scheduler::Lease;
use crate::output::Ingest;
use crate::state::ItemStatus;
use crate::store::{CrawlItem, ItemOutcome, JobStore, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{Id, JoinError, JoinSet};

/// Everything a worker needs, shared by all workers of one target
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub sink: Arc<dyn Ingest>,
    pub breaker: Arc<CircuitBreaker>,
    pub pagination: PaginationDriver,
    pub retry: RetryPolicy,
    pub mode: FetchMode,
    pub timeout: Duration,
}

/// How one attempt ended, as recorded in the job store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Done,
    /// Transient failure; the item went back to `pending`
    Retrying,
    Dead,
    /// Permanent failure parked for an operator requeue
    Failed,
    /// The job store rejected the completion; the item stays in flight until recovery
    StoreFailure(String),
}

impl WorkOutcome {
    fn from_status(status: ItemStatus) -> Self {
        match status {
            ItemStatus::Done => Self::Done,
            ItemStatus::Pending => Self::Retrying,
            ItemStatus::Failed => Self::Failed,
            ItemStatus::Dead | ItemStatus::InFlight => Self::Dead,
        }
    }
}

/// Result of a breaker transition caused by one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTrip {
    pub consecutive_failures: u32,
    pub last_error: String,
}

/// What a finished worker reports back to the coordinator
#[derive(Debug, Clone)]
pub struct WorkReport {
    pub item_id: i64,
    pub url: String,
    pub domain: String,
    pub outcome: WorkOutcome,
    pub error: Option<FetchError>,
    pub probe: bool,
    /// Set when this attempt opened the domain's breaker
    pub breaker_opened: Option<BreakerTrip>,
    pub follow_ups: usize,
    /// Set when the ingest sink rejected the page
    pub ingest_error: Option<String>,
    /// Set when the worker task panicked or was cancelled
    pub crash: Option<String>,
}

impl WorkReport {
    pub fn fetched(&self) -> bool {
        self.error.is_none() && self.crash.is_none()
    }
}

/// The lease a running task was given, kept to settle it if the task dies
#[derive(Debug)]
struct Assignment {
    item_id: i64,
    url: String,
    domain: String,
    probe: bool,
}

/// Runs leased items concurrently
pub struct WorkerPool {
    context: Arc<WorkerContext>,
    tasks: JoinSet<WorkReport>,
    assignments: HashMap<Id, Assignment>,
}

impl WorkerPool {
    pub fn new(context: WorkerContext) -> Self {
        Self {
            context: Arc::new(context),
            tasks: JoinSet::new(),
            assignments: HashMap::new(),
        }
    }

    pub fn spawn(&mut self, lease: Lease) {
        let assignment = Assignment {
            item_id: lease.item.id,
            url: lease.item.url.clone(),
            domain: lease.item.domain.clone(),
            probe: lease.probe,
        };
        let context = Arc::clone(&self.context);
        let handle = self.tasks.spawn(run_job(context, lease));
        self.assignments.insert(handle.id(), assignment);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for the next worker to finish
    ///
    /// # Returns
    ///
    /// The finished worker's report, or `None` once the pool is empty. A
    /// worker that panicked yields a report too, after its item has been
    /// completed as a transient failure.
    pub async fn join_next(&mut self) -> Option<WorkReport> {
        loop {
            match self.tasks.join_next_with_id().await? {
                Ok((id, report)) => {
                    self.assignments.remove(&id);
                    return Some(report);
                }
                Err(e) => match self.assignments.remove(&e.id()) {
                    Some(assignment) => return Some(self.settle_crashed(assignment, &e)),
                    None => tracing::error!("Untracked worker task failed: {}", e),
                },
            }
        }
    }

    fn settle_crashed(&self, assignment: Assignment, error: &JoinError) -> WorkReport {
        let reason = if error.is_panic() {
            "worker panicked"
        } else {
            "worker cancelled"
        };
        tracing::error!("{} while fetching {}", reason, assignment.url);

        self.context
            .breaker
            .record_neutral(&assignment.domain, assignment.probe);
        let outcome = match self.context.store.complete(
            assignment.item_id,
            &ItemOutcome::Transient(reason.to_string()),
            &self.context.retry,
        ) {
            Ok(status) => WorkOutcome::from_status(status),
            Err(e) => {
                tracing::error!("Failed to record outcome of {}: {}", assignment.url, e);
                WorkOutcome::StoreFailure(e.to_string())
            }
        };

        WorkReport {
            item_id: assignment.item_id,
            url: assignment.url,
            domain: assignment.domain,
            outcome,
            error: None,
            probe: assignment.probe,
            breaker_opened: None,
            follow_ups: 0,
            ingest_error: None,
            crash: Some(reason.to_string()),
        }
    }
}

async fn run_job(context: Arc<WorkerContext>, lease: Lease) -> WorkReport {
    let Lease { item, slot, probe } = lease;

    let fetched = match tokio::time::timeout(
        context.timeout,
        context.fetcher.fetch(&item.url, context.mode),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(context.timeout)),
    };

    let (item_outcome, breaker_opened) = match &fetched {
        Ok(_) => {
            context.breaker.record_success(&item.domain, probe);
            (ItemOutcome::Success, None)
        }
        Err(e) if e.is_transient() => {
            let message = e.to_string();
            tracing::warn!("Transient error on {}: {}", item.url, message);
            let opened = context
                .breaker
                .record_failure(&item.domain, Instant::now(), &message, probe);
            let trip = opened.then(|| BreakerTrip {
                consecutive_failures: context
                    .breaker
                    .view(&item.domain)
                    .map_or(0, |view| view.consecutive_failures),
                last_error: message.clone(),
            });
            (ItemOutcome::Transient(message), trip)
        }
        Err(e) => {
            tracing::info!("Permanent error on {}: {}", item.url, e);
            context.breaker.record_neutral(&item.domain, probe);
            (ItemOutcome::Permanent(e.to_string()), None)
        }
    };

    let outcome = match context.store.complete(item.id, &item_outcome, &context.retry) {
        Ok(status) => WorkOutcome::from_status(status),
        Err(e) => {
            tracing::error!("Failed to record outcome of {}: {}", item.url, e);
            WorkOutcome::StoreFailure(e.to_string())
        }
    };

    let page = fetched.as_ref().ok();
    let follow_ups = match page {
        Some(page) => enqueue_follow_ups(&context, &item, page),
        None => 0,
    };

    // follow-ups are visible in the store before the slot frees up
    drop(slot);

    let ingest_error = match page {
        Some(page) => context.sink.ingest(page).await.err().map(|e| {
            tracing::warn!("Ingest failed for {}: {}", item.url, e);
            e.to_string()
        }),
        None => None,
    };

    WorkReport {
        item_id: item.id,
        url: item.url,
        domain: item.domain,
        outcome,
        error: fetched.err(),
        probe,
        breaker_opened,
        follow_ups,
        ingest_error,
        crash: None,
    }
}

fn enqueue_follow_ups(context: &WorkerContext, item: &CrawlItem, page: &Page) -> usize {
    match context
        .pagination
        .enqueue_follow_ups(context.store.as_ref(), item, page)
    {
        Ok(count) => {
            if count > 0 {
                tracing::debug!("Enqueued {} follow-ups from {}", count, item.url);
            }
            count
        }
        Err(e) => {
            tracing::error!("Failed to enqueue follow-ups of {}: {}", item.url, e);
            0
        }
    }
}
