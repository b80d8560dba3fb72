//! Crawler coordinator - one target's run from start to finish
//!
//! The coordinator owns a target's run loop:
//! - Opening or resuming the run and seeding its start paths
//! - Restoring politeness and breaker state persisted by earlier runs
//! - Alternating scheduler decisions with worker completions
//! - Persisting domain state periodically and on exit
//! - Graceful shutdown: stop leasing, drain workers, mark the run interrupted
//! - Reporting run-level events to the notifier

use crate::config::TargetConfig;
use crate::crawler::breaker::{BreakerView, CircuitBreaker};
use crate::crawler::fetcher::Fetcher;
use crate::crawler::politeness::PolitenessTracker;
use crate::crawler::scheduler::{Decision, Scheduler};
use crate::crawler::wait_for_shutdown;
use crate::crawler::worker::{WorkOutcome, WorkReport, WorkerContext, WorkerPool};
use crate::metrics::CrawlMetrics;
use crate::notify::{CrawlEvent, Notifier};
use crate::output::Ingest;
use crate::state::{instant_to_utc, utc_to_instant, BreakerState, DomainState};
use crate::store::{EnqueueOutcome, JobRun, JobStore, RunStatus, StatusCounts, StoreError};
use crate::ConfigError;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Sleep used when nothing is eligible and no worker is running
const IDLE_RECHECK: Duration = Duration::from_millis(250);

/// Completed attempts between domain state snapshots
const PERSIST_EVERY: u64 = 25;

/// How long a finished run waits for outstanding notifications
const NOTIFY_GRACE: Duration = Duration::from_secs(5);

/// Times a drained run may put stranded items back before giving up
const MAX_STRANDED_RELEASES: u32 = 3;

/// The external collaborators a run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub sink: Arc<dyn Ingest>,
    pub notifier: Arc<dyn Notifier>,
}

/// What an operator sees after a run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub target: String,
    pub run_id: i64,
    pub status: RunStatus,
    pub resumed: bool,
    pub counts: StatusCounts,
    pub pages_fetched: u64,
    /// Ingest failures plus failed store writes
    pub storage_warnings: u64,
    pub open_domains: Vec<String>,
    pub dead_heavy_domains: Vec<String>,
    pub elapsed: Duration,
}

pub struct Coordinator {
    target: TargetConfig,
    store: Arc<dyn JobStore>,
    collaborators: Collaborators,
    fresh: bool,
    config_hash: String,
    shutdown: Option<watch::Receiver<bool>>,
    metrics: Option<Arc<CrawlMetrics>>,
}

#[derive(Default)]
struct Progress {
    attempts: u64,
    pages_fetched: u64,
    storage_warnings: u64,
    stranded_releases: u32,
}

impl Coordinator {
    pub fn new(target: TargetConfig, store: Arc<dyn JobStore>, collaborators: Collaborators) -> Self {
        Self {
            target,
            store,
            collaborators,
            fresh: false,
            config_hash: String::new(),
            shutdown: None,
            metrics: None,
        }
    }

    /// Start a new run instead of resuming the target's unfinished one
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    /// Stops leasing once the channel carries `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Reports run progress into shared metrics
    pub fn with_metrics(mut self, metrics: Arc<CrawlMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs the target until its queue drains, every domain is open, or shutdown
    ///
    /// # Returns
    ///
    /// The run summary. The run itself is finished in the store as
    /// `completed`, `blocked` or `interrupted`; a store error marks it
    /// `failed` and is returned instead.
    pub async fn run(self) -> crate::Result<RunSummary> {
        let started = Instant::now();
        let name = self.target.name.clone();
        let mut notifications = JoinSet::new();

        let run = self
            .store
            .begin_run(&name, &self.config_hash, self.fresh)?;
        if let Some(metrics) = &self.metrics {
            metrics.run_started(&name, run.id);
        }
        let result = self.drive(run, started, &mut notifications).await;
        drain_notifications(notifications).await;

        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(summary) => metrics.run_finished(summary),
                Err(_) => metrics.run_failed(&name, started.elapsed()),
            }
        }
        result
    }

    async fn drive(
        &self,
        run: JobRun,
        started: Instant,
        notifications: &mut JoinSet<()>,
    ) -> crate::Result<RunSummary> {
        let name = self.target.name.clone();
        self.seed(&run)?;

        let politeness = Arc::new(PolitenessTracker::new(self.target.politeness_config()));
        let breaker = Arc::new(CircuitBreaker::new(self.target.breaker_config()));
        self.restore_domain_states(&politeness, &breaker)?;

        self.notify(
            notifications,
            CrawlEvent::RunStarted {
                target: name.clone(),
                run_id: run.id,
                resumed: run.resumed,
            },
        );

        let mut scheduler = Scheduler::new(
            name.clone(),
            Arc::clone(&self.store),
            Arc::clone(&politeness),
            Arc::clone(&breaker),
            self.target.breaker.stop_when_all_open,
        );
        let mut pool = WorkerPool::new(WorkerContext {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.collaborators.fetcher),
            sink: Arc::clone(&self.collaborators.sink),
            breaker: Arc::clone(&breaker),
            pagination: self.target.pagination_driver(),
            retry: self.target.retry_policy(),
            mode: self.target.mode,
            timeout: self.target.fetch_timeout(),
        });

        let mut progress = Progress::default();
        let loop_result = self
            .run_loop(
                &run,
                &mut scheduler,
                &mut pool,
                &politeness,
                &breaker,
                &mut progress,
                notifications,
            )
            .await;

        // workers still running after a store error are drained before the run is closed
        while let Some(report) = pool.join_next().await {
            self.handle_report(&report, run.id, &mut progress, notifications);
        }
        self.persist_domain_states(&politeness, &breaker, &mut progress);

        // no worker of this target runs any more; anything still in flight is stranded
        match self.store.release_in_flight(&name) {
            Ok(0) => {}
            Ok(n) => tracing::warn!("Returned {} stranded items of '{}' to pending", n, name),
            Err(e) => tracing::warn!("Could not release stranded items of '{}': {}", name, e),
        }

        let status = match loop_result {
            Ok(status) => status,
            Err(e) => {
                tracing::error!("Run {} of target '{}' failed: {}", run.id, name, e);
                if let Err(finish_err) = self.store.finish_run(run.id, RunStatus::Failed) {
                    tracing::error!("Could not mark run {} failed: {}", run.id, finish_err);
                }
                return Err(e.into());
            }
        };
        self.store.finish_run(run.id, status)?;

        let counts = self.store.snapshot_counts(&name)?;
        let dead_heavy_domains = self
            .store
            .domain_counts(&name)?
            .into_iter()
            .filter(|d| d.is_dead_heavy())
            .map(|d| d.domain)
            .collect();

        match status {
            RunStatus::Completed => self.notify(
                notifications,
                CrawlEvent::TargetExhausted {
                    target: name.clone(),
                    run_id: run.id,
                    done: counts.done,
                    failed: counts.failed,
                    dead: counts.dead,
                },
            ),
            RunStatus::Interrupted => self.notify(
                notifications,
                CrawlEvent::RunInterrupted {
                    target: name.clone(),
                    run_id: run.id,
                    pending: counts.pending,
                },
            ),
            _ => {}
        }

        let summary = RunSummary {
            target: name,
            run_id: run.id,
            status,
            resumed: run.resumed,
            counts,
            pages_fetched: progress.pages_fetched,
            storage_warnings: progress.storage_warnings,
            open_domains: breaker.open_domains(),
            dead_heavy_domains,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Run {} of target '{}' ended {}: {} done, {} dead, {} pending in {:?}",
            summary.run_id,
            summary.target,
            summary.status,
            summary.counts.done,
            summary.counts.dead,
            summary.counts.pending,
            summary.elapsed
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        run: &JobRun,
        scheduler: &mut Scheduler,
        pool: &mut WorkerPool,
        politeness: &Arc<PolitenessTracker>,
        breaker: &Arc<CircuitBreaker>,
        progress: &mut Progress,
        notifications: &mut JoinSet<()>,
    ) -> Result<RunStatus, StoreError> {
        loop {
            if self.shutdown_requested() {
                tracing::info!(
                    "Shutdown requested, waiting for {} in-flight fetches of '{}'",
                    pool.len(),
                    run.target_id
                );
                return Ok(RunStatus::Interrupted);
            }

            let decision = loop {
                match scheduler.next(Instant::now())? {
                    Decision::Dispatch(lease) => pool.spawn(lease),
                    other => break other,
                }
            };

            let hint = match decision {
                Decision::Drained if pool.is_empty() => {
                    let stranded = self.store.release_in_flight(&run.target_id)?;
                    if stranded == 0 {
                        tracing::info!("Target '{}' has no work left", run.target_id);
                        return Ok(RunStatus::Completed);
                    }
                    progress.stranded_releases += 1;
                    tracing::warn!(
                        "Returned {} items of '{}' left in flight to pending",
                        stranded,
                        run.target_id
                    );
                    if progress.stranded_releases > MAX_STRANDED_RELEASES {
                        tracing::error!(
                            "Job store keeps rejecting outcomes for '{}', stopping the run",
                            run.target_id
                        );
                        return Ok(RunStatus::Interrupted);
                    }
                    continue;
                }
                Decision::AllOpen(domains) if pool.is_empty() => {
                    tracing::warn!(
                        "Every domain of target '{}' has an open breaker: {}",
                        run.target_id,
                        domains.join(", ")
                    );
                    self.notify(
                        notifications,
                        CrawlEvent::AllDomainsOpen {
                            target: run.target_id.clone(),
                            run_id: run.id,
                            domains,
                        },
                    );
                    return Ok(RunStatus::Blocked);
                }
                Decision::Idle(hint) => hint,
                Decision::Drained | Decision::AllOpen(_) | Decision::Dispatch(_) => None,
            };

            let wait = match (hint, pool.is_empty()) {
                (Some(hint), _) => Some(hint),
                (None, true) => Some(IDLE_RECHECK),
                (None, false) => None,
            };
            let mut shutdown = self.shutdown.clone();

            tokio::select! {
                joined = pool.join_next(), if !pool.is_empty() => {
                    if let Some(report) = joined {
                        self.handle_report(&report, run.id, progress, notifications);
                        if progress.attempts % PERSIST_EVERY == 0 {
                            self.persist_domain_states(politeness, breaker, progress);
                        }
                    }
                }
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {}
                _ = wait_for_shutdown(&mut shutdown) => {}
            }
            reap_notifications(notifications);
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Enqueues the target's start URLs at depth zero
    fn seed(&self, run: &JobRun) -> crate::Result<()> {
        let urls = self.target.start_urls().map_err(|e| {
            ConfigError::InvalidUrl(format!("Target '{}' start path: {}", self.target.name, e))
        })?;

        let mut inserted = 0;
        for url in &urls {
            match self.store.enqueue(&self.target.name, url, 0) {
                Ok(EnqueueOutcome::Inserted(_)) => inserted += 1,
                Ok(EnqueueOutcome::AlreadyExists) => {}
                Err(StoreError::InvalidUrl { url, reason }) => {
                    tracing::warn!("Skipping start URL {}: {}", url, reason);
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(
            "Seeded run {} of '{}' with {} new of {} start URLs",
            run.id,
            self.target.name,
            inserted,
            urls.len()
        );
        Ok(())
    }

    fn restore_domain_states(
        &self,
        politeness: &PolitenessTracker,
        breaker: &CircuitBreaker,
    ) -> Result<(), StoreError> {
        let states = self.store.load_domain_states(&self.target.name)?;
        let now = Instant::now();
        let now_utc = Utc::now();

        for state in &states {
            if let Some(last) = state.last_fetch_at {
                politeness.restore_last_fetch(&state.domain, utc_to_instant(last, now, now_utc));
            }
            if state.breaker != BreakerState::Closed || state.consecutive_failures > 0 {
                breaker.restore(
                    &state.domain,
                    BreakerView {
                        state: state.breaker,
                        opened_at: state.opened_at.map(|at| utc_to_instant(at, now, now_utc)),
                        consecutive_failures: state.consecutive_failures,
                    },
                    now,
                );
            }
        }

        if !states.is_empty() {
            tracing::info!(
                "Restored state of {} domains for '{}'",
                states.len(),
                self.target.name
            );
        }
        Ok(())
    }

    fn persist_domain_states(
        &self,
        politeness: &PolitenessTracker,
        breaker: &CircuitBreaker,
        progress: &mut Progress,
    ) {
        let now = Instant::now();
        let now_utc = Utc::now();
        let mut states: BTreeMap<String, DomainState> = BTreeMap::new();

        for slot in politeness.slots() {
            let state = states
                .entry(slot.domain.clone())
                .or_insert_with(|| DomainState::new(slot.domain.clone()));
            state.in_flight = slot.in_flight as u32;
            state.last_fetch_at = slot.last_fetch.map(|at| instant_to_utc(at, now, now_utc));
        }
        for domain in breaker.domains() {
            let Some(view) = breaker.view(&domain) else {
                continue;
            };
            let state = states
                .entry(domain.clone())
                .or_insert_with(|| DomainState::new(domain));
            state.breaker = view.state;
            state.opened_at = view.opened_at.map(|at| instant_to_utc(at, now, now_utc));
            state.consecutive_failures = view.consecutive_failures;
        }

        let states: Vec<DomainState> = states.into_values().collect();
        if let Err(e) = self.store.save_domain_states(&self.target.name, &states) {
            tracing::warn!("Failed to persist domain states of '{}': {}", self.target.name, e);
            progress.storage_warnings += 1;
        }
    }

    fn handle_report(
        &self,
        report: &WorkReport,
        run_id: i64,
        progress: &mut Progress,
        notifications: &mut JoinSet<()>,
    ) {
        progress.attempts += 1;
        if report.fetched() {
            progress.pages_fetched += 1;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_report(&self.target.name, report);
        }
        if let Some(crash) = &report.crash {
            tracing::error!("Attempt on {} ended abnormally: {}", report.url, crash);
        }
        if report.ingest_error.is_some() {
            progress.storage_warnings += 1;
        }

        match &report.outcome {
            WorkOutcome::Done => tracing::debug!("Done: {}", report.url),
            WorkOutcome::Retrying => tracing::debug!("Will retry: {}", report.url),
            WorkOutcome::Dead => tracing::info!("Dead-lettered: {}", report.url),
            WorkOutcome::Failed => tracing::info!("Parked as failed: {}", report.url),
            WorkOutcome::StoreFailure(e) => {
                progress.storage_warnings += 1;
                tracing::error!("Item {} left in flight: {}", report.item_id, e);
            }
        }

        if let Some(trip) = &report.breaker_opened {
            self.notify(
                notifications,
                CrawlEvent::BreakerOpened {
                    target: self.target.name.clone(),
                    domain: report.domain.clone(),
                    consecutive_failures: trip.consecutive_failures,
                    last_error: trip.last_error.clone(),
                },
            );
        }

        if progress.attempts % 50 == 0 {
            tracing::info!(
                "Progress on '{}' (run {}): {} attempts, {} pages fetched",
                self.target.name,
                run_id,
                progress.attempts,
                progress.pages_fetched
            );
        }
    }

    /// Hands an event to the notifier without waiting for delivery
    fn notify(&self, notifications: &mut JoinSet<()>, event: CrawlEvent) {
        let notifier = Arc::clone(&self.collaborators.notifier);
        notifications.spawn(async move {
            if let Err(e) = notifier.notify(&event).await {
                tracing::warn!("Notification failed for {}: {}", event.target(), e);
            }
        });
    }
}

/// Collects notification tasks that already finished
fn reap_notifications(notifications: &mut JoinSet<()>) {
    while let Some(joined) = notifications.try_join_next() {
        if let Err(e) = joined {
            tracing::warn!("Notification task failed: {}", e);
        }
    }
}

async fn drain_notifications(mut notifications: JoinSet<()>) {
    let drained = tokio::time::timeout(NOTIFY_GRACE, async {
        while notifications.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Gave up waiting for {} notifications", notifications.len());
    }
}
