//! Running configured targets, once or on an interval
//!
//! A cycle starts one coordinator per selected target and waits for all of
//! them. Recurring mode repeats cycles on a fixed interval: a completed run
//! is followed by a new run of the same target, an interrupted or blocked
//! one is resumed.

use crate::config::Config;
use crate::crawler::coordinator::RunSummary;
use crate::crawler::{coordinator_for, wait_for_shutdown};
use crate::metrics::CrawlMetrics;
use crate::notify::Notifier;
use crate::store::JobStore;
use crate::CrawlError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// How one target's run ended within a cycle
pub type TargetOutcome = (String, crate::Result<RunSummary>);

pub struct Runner {
    config: Config,
    config_hash: String,
    targets: Vec<String>,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    metrics: Option<Arc<CrawlMetrics>>,
    shutdown: watch::Receiver<bool>,
}

impl Runner {
    /// Creates a runner over every target of `config`
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let targets = config.targets.iter().map(|t| t.name.clone()).collect();
        Self {
            config,
            config_hash: String::new(),
            targets,
            store,
            notifier,
            metrics: None,
            shutdown,
        }
    }

    /// Restricts the runner to these target names
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CrawlMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs every selected target concurrently until each run ends
    ///
    /// # Arguments
    ///
    /// * `fresh` - Start new runs instead of resuming unfinished ones
    ///
    /// # Returns
    ///
    /// One outcome per selected target, sorted by target name
    pub async fn run_once(&self, fresh: bool) -> Vec<TargetOutcome> {
        let mut outcomes = Vec::new();
        let mut runs = JoinSet::new();
        let mut names = HashMap::new();

        for name in &self.targets {
            let coordinator = match coordinator_for(
                &self.config,
                name,
                Arc::clone(&self.store),
                Arc::clone(&self.notifier),
            ) {
                Ok(coordinator) => coordinator,
                Err(e) => {
                    outcomes.push((name.clone(), Err(e)));
                    continue;
                }
            };
            let mut coordinator = coordinator
                .fresh(fresh)
                .with_config_hash(self.config_hash.clone())
                .with_shutdown(self.shutdown.clone());
            if let Some(metrics) = &self.metrics {
                coordinator = coordinator.with_metrics(Arc::clone(metrics));
            }
            let handle = runs.spawn(coordinator.run());
            names.insert(handle.id(), name.clone());
        }

        while let Some(joined) = runs.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    if let Some(name) = names.remove(&id) {
                        outcomes.push((name, result));
                    }
                }
                Err(e) => {
                    let name = names.remove(&e.id()).unwrap_or_default();
                    tracing::error!("Target '{}' task failed: {}", name, e);
                    outcomes.push((name, Err(CrawlError::TaskFailed(e.to_string()))));
                }
            }
        }

        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// Repeats [`Runner::run_once`] every `every` until shutdown
    ///
    /// The first cycle starts immediately. A cycle that overruns the
    /// interval delays the next one instead of stacking cycles.
    ///
    /// # Arguments
    ///
    /// * `every` - Interval between cycle starts
    /// * `fresh` - Applies to the first cycle only
    /// * `max_cycles` - Stop after this many cycles; `None` runs until shutdown
    /// * `on_cycle` - Called with the cycle number and its outcomes
    ///
    /// # Returns
    ///
    /// The number of cycles that ran
    pub async fn run_every(
        &self,
        every: Duration,
        fresh: bool,
        max_cycles: Option<u32>,
        mut on_cycle: impl FnMut(u32, &[TargetOutcome]),
    ) -> u32 {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = Some(self.shutdown.clone());
        let mut cycles = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
            if *self.shutdown.borrow() {
                break;
            }

            cycles += 1;
            tracing::info!("Starting crawl cycle {}", cycles);
            let outcomes = self.run_once(fresh && cycles == 1).await;
            on_cycle(cycles, &outcomes);

            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            tracing::info!("Next crawl cycle in {:?}", every);
        }
        cycles
    }
}
