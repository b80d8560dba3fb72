//! Crawler module: the orchestration core
//!
//! This module contains the crawl orchestration logic, including:
//! - Per-domain politeness and concurrency slots
//! - Per-domain circuit breakers
//! - The scheduler that picks the next item to lease
//! - The worker pool that fetches, classifies and records attempts
//! - The pagination driver that enqueues follow-up pages
//! - The coordinator running one target from start to finish
//! - The runner repeating crawl cycles on an interval

mod breaker;
mod coordinator;
mod fetcher;
mod pagination;
mod politeness;
mod runner;
mod scheduler;
mod worker;

pub use breaker::{BreakerConfig, BreakerView, CircuitBreaker};
pub use coordinator::{Collaborators, Coordinator, RunSummary};
pub use fetcher::{build_http_client, ErrorClass, FetchError, FetchMode, Fetcher, HttpFetcher, Page};
pub use pagination::{PaginationDriver, PaginationRule};
pub use politeness::{PolitenessConfig, PolitenessTracker, SlotGuard, SlotView};
pub use runner::{Runner, TargetOutcome};
pub use scheduler::{Decision, Lease, Scheduler};
pub use worker::{BreakerTrip, WorkOutcome, WorkReport, WorkerContext, WorkerPool};

use crate::config::{Config, TargetConfig};
use crate::notify::Notifier;
use crate::output::build_sink;
use crate::store::JobStore;
use std::sync::Arc;
use tokio::sync::watch;

/// Builds the HTTP fetcher and output sink a target's configuration asks for
pub fn collaborators_for(
    target: &TargetConfig,
    notifier: Arc<dyn Notifier>,
) -> crate::Result<Collaborators> {
    let fetcher = HttpFetcher::new(
        &target.user_agent,
        target.fetch_timeout(),
        target.fetch.respect_robots,
    )?;
    Ok(Collaborators {
        fetcher: Arc::new(fetcher),
        sink: build_sink(&target.output)?,
        notifier,
    })
}

/// Builds the coordinator for one configured target
///
/// # Arguments
///
/// * `config` - The loaded configuration
/// * `target_name` - Name of a `[[target]]` in `config`
/// * `store` - Job store shared by all targets
/// * `notifier` - Channel for run and breaker events
///
/// # Returns
///
/// A coordinator with default options, or `CrawlError::UnknownTarget`
pub fn coordinator_for(
    config: &Config,
    target_name: &str,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
) -> crate::Result<Coordinator> {
    let target = config
        .target(target_name)
        .ok_or_else(|| crate::CrawlError::UnknownTarget(target_name.to_string()))?;
    let collaborators = collaborators_for(target, notifier)?;
    Ok(Coordinator::new(target.clone(), store, collaborators))
}

/// Resolves once `shutdown` carries `true`; never resolves without a receiver
pub(crate) async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            let stopped = rx.wait_for(|stop| *stop).await.is_ok();
            if !stopped {
                // sender gone, nobody can ask for a stop any more
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}
