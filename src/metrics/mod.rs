//! Crawl metrics
//!
//! Counters shared by every coordinator of one process, plus a small HTTP
//! endpoint exposing them (`/metrics`) and a liveness check (`/health`).

mod server;

pub use server::{router, serve, MetricsState};

use crate::crawler::{RunSummary, WorkReport};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Counters of one target, accumulated over every run of this process
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TargetMetrics {
    pub running: bool,
    pub runs: u64,
    pub pages_fetched: u64,
    /// Failed attempts, transient or permanent
    pub errors: u64,
    pub last_run_id: Option<i64>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_runtime_secs: Option<f64>,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub items_scraped: u64,
    pub errors: u64,
    /// Start of the most recent run of any target
    pub last_run: Option<DateTime<Utc>>,
    /// Duration of the most recently finished run
    pub runtime_secs: f64,
    pub targets: BTreeMap<String, TargetMetrics>,
}

#[derive(Debug)]
pub struct CrawlMetrics {
    started: Instant,
    targets: DashMap<String, TargetMetrics>,
}

impl Default for CrawlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            targets: DashMap::new(),
        }
    }

    pub fn run_started(&self, target: &str, run_id: i64) {
        let mut entry = self.targets.entry(target.to_string()).or_default();
        entry.running = true;
        entry.runs += 1;
        entry.last_run_id = Some(run_id);
        entry.last_started = Some(Utc::now());
    }

    pub fn record_report(&self, target: &str, report: &WorkReport) {
        let mut entry = self.targets.entry(target.to_string()).or_default();
        if report.fetched() {
            entry.pages_fetched += 1;
        } else {
            entry.errors += 1;
        }
    }

    pub fn run_finished(&self, summary: &RunSummary) {
        self.close_run(&summary.target, &summary.status.to_string(), summary.elapsed);
    }

    /// A run that ended on a store error
    pub fn run_failed(&self, target: &str, elapsed: Duration) {
        self.close_run(target, "failed", elapsed);
    }

    fn close_run(&self, target: &str, status: &str, elapsed: Duration) {
        let mut entry = self.targets.entry(target.to_string()).or_default();
        entry.running = false;
        entry.last_finished = Some(Utc::now());
        entry.last_status = Some(status.to_string());
        entry.last_runtime_secs = Some(elapsed.as_secs_f64());
    }

    pub fn target(&self, target: &str) -> Option<TargetMetrics> {
        self.targets.get(target).map(|entry| entry.value().clone())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let targets: BTreeMap<String, TargetMetrics> = self
            .targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let latest_finished = targets
            .values()
            .filter(|t| t.last_finished.is_some())
            .max_by_key(|t| t.last_finished);

        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            items_scraped: targets.values().map(|t| t.pages_fetched).sum(),
            errors: targets.values().map(|t| t.errors).sum(),
            last_run: targets.values().filter_map(|t| t.last_started).max(),
            runtime_secs: latest_finished
                .and_then(|t| t.last_runtime_secs)
                .unwrap_or(0.0),
            targets,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{FetchError, WorkOutcome};
    use crate::store::{RunStatus, StatusCounts};

    fn report(error: Option<FetchError>) -> WorkReport {
        WorkReport {
            item_id: 1,
            url: "https://a.test/1".into(),
            domain: "a.test".into(),
            outcome: WorkOutcome::Done,
            error,
            probe: false,
            breaker_opened: None,
            follow_ups: 0,
            ingest_error: None,
            crash: None,
        }
    }

    fn summary(target: &str, elapsed: Duration) -> RunSummary {
        RunSummary {
            target: target.into(),
            run_id: 7,
            status: RunStatus::Completed,
            resumed: false,
            counts: StatusCounts::default(),
            pages_fetched: 2,
            storage_warnings: 0,
            open_domains: vec![],
            dead_heavy_domains: vec![],
            elapsed,
        }
    }

    #[test]
    fn test_run_lifecycle() {
        let metrics = CrawlMetrics::new();
        metrics.run_started("shop", 7);
        assert!(metrics.target("shop").unwrap().running);

        metrics.record_report("shop", &report(None));
        metrics.record_report("shop", &report(None));
        metrics.record_report("shop", &report(Some(FetchError::ServerError(503))));
        metrics.run_finished(&summary("shop", Duration::from_millis(1500)));

        let shop = metrics.target("shop").unwrap();
        assert!(!shop.running);
        assert_eq!(shop.runs, 1);
        assert_eq!(shop.pages_fetched, 2);
        assert_eq!(shop.errors, 1);
        assert_eq!(shop.last_run_id, Some(7));
        assert_eq!(shop.last_status.as_deref(), Some("completed"));
        assert_eq!(shop.last_runtime_secs, Some(1.5));
    }

    #[test]
    fn test_snapshot_totals() {
        let metrics = CrawlMetrics::new();
        metrics.run_started("shop", 1);
        metrics.run_started("news", 2);
        metrics.record_report("shop", &report(None));
        metrics.record_report("news", &report(None));
        metrics.record_report("news", &report(Some(FetchError::ClientError(404))));
        metrics.run_failed("news", Duration::from_secs(3));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_scraped, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.runtime_secs, 3.0);
        assert!(snapshot.last_run.is_some());
        assert_eq!(
            snapshot.targets.keys().collect::<Vec<_>>(),
            vec!["news", "shop"]
        );
        assert_eq!(snapshot.targets["news"].last_status.as_deref(), Some("failed"));
    }
}
