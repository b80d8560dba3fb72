//! Job state store
//!
//! Durable record of discovered, queued, in-flight and finished URLs per
//! target. This module handles:
//! - Run tracking and resumption
//! - Idempotent discovery (dedup on normalized URL)
//! - Atomic leasing of pending items
//! - Retry and dead-letter transitions
//! - Crash recovery of items left in flight
//! - Domain state persistence

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteJobStore;
pub use traits::{JobStore, StoreError, StoreResult};

use crate::state::ItemStatus;
use serde::{Deserialize, Serialize};

/// Outcome of `enqueue`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted(i64),
    AlreadyExists,
}

impl EnqueueOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Represents a crawl item in the database
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlItem {
    pub id: i64,
    pub run_id: i64,
    pub target_id: String,
    pub url: String,
    pub domain: String,
    pub depth: u32,
    pub status: ItemStatus,
    pub attempt_count: u32,
    pub discovered_at: String,
    pub last_attempt_at: Option<String>,
    pub last_error: Option<String>,
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: i64,
    pub target_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
    /// True when `begin_run` picked up an existing run
    pub resumed: bool,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    /// Every remaining domain had its breaker open
    Blocked,
    /// Superseded by a fresh run
    Abandoned,
    Failed,
}

impl RunStatus {
    /// Returns true if a later invocation should continue this run
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Running | Self::Interrupted | Self::Blocked)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Blocked => "blocked",
            Self::Abandoned => "abandoned",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "blocked" => Some(Self::Blocked),
            "abandoned" => Some(Self::Abandoned),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// What happened to one fetch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Transient(String),
    Permanent(String),
}

impl ItemOutcome {
    fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::Transient(msg) | Self::Permanent(msg) => Some(msg),
        }
    }
}

/// Where permanently failing items go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermanentPolicy {
    /// Dead-letter immediately
    #[default]
    Dead,
    /// Park as `failed` so `requeue_failed` can retry later
    Failed,
}

/// Retry budget applied when an attempt completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub ceiling: u32,
    pub on_permanent: PermanentPolicy,
}

impl RetryPolicy {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            on_permanent: PermanentPolicy::Dead,
        }
    }

    /// Status an item takes after its `attempt_count`-th attempt ended with `outcome`
    pub fn next_status(&self, attempt_count: u32, outcome: &ItemOutcome) -> ItemStatus {
        match outcome {
            ItemOutcome::Success => ItemStatus::Done,
            ItemOutcome::Transient(_) if attempt_count <= self.ceiling => ItemStatus::Pending,
            ItemOutcome::Transient(_) => ItemStatus::Dead,
            ItemOutcome::Permanent(_) => match self.on_permanent {
                PermanentPolicy::Dead => ItemStatus::Dead,
                PermanentPolicy::Failed => ItemStatus::Failed,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Item counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed: u64,
    pub dead: u64,
}

impl StatusCounts {
    pub fn get(&self, status: ItemStatus) -> u64 {
        match status {
            ItemStatus::Pending => self.pending,
            ItemStatus::InFlight => self.in_flight,
            ItemStatus::Done => self.done,
            ItemStatus::Failed => self.failed,
            ItemStatus::Dead => self.dead,
        }
    }

    pub(crate) fn add(&mut self, status: ItemStatus, count: u64) {
        match status {
            ItemStatus::Pending => self.pending += count,
            ItemStatus::InFlight => self.in_flight += count,
            ItemStatus::Done => self.done += count,
            ItemStatus::Failed => self.failed += count,
            ItemStatus::Dead => self.dead += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.done + self.failed + self.dead
    }

    /// Returns true if nothing is left to lease or waiting on a worker
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

/// Item counts for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainCounts {
    pub domain: String,
    pub counts: StatusCounts,
}

impl DomainCounts {
    /// Dead items dominate successful ones
    pub fn is_dead_heavy(&self) -> bool {
        self.counts.dead > 0 && self.counts.dead >= self.counts.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Interrupted,
            RunStatus::Blocked,
            RunStatus::Abandoned,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::from_db_string(status.to_db_string()), Some(status));
        }
        assert_eq!(RunStatus::from_db_string("invalid"), None);
    }

    #[test]
    fn test_retry_ceiling_counts_retries() {
        let policy = RetryPolicy::new(2);
        let err = ItemOutcome::Transient("503".into());
        assert_eq!(policy.next_status(1, &err), ItemStatus::Pending);
        assert_eq!(policy.next_status(2, &err), ItemStatus::Pending);
        assert_eq!(policy.next_status(3, &err), ItemStatus::Dead);
    }

    #[test]
    fn test_zero_ceiling_dead_letters_first_failure() {
        let policy = RetryPolicy::new(0);
        let err = ItemOutcome::Transient("timeout".into());
        assert_eq!(policy.next_status(1, &err), ItemStatus::Dead);
    }

    #[test]
    fn test_permanent_policy() {
        let err = ItemOutcome::Permanent("404".into());
        assert_eq!(RetryPolicy::new(5).next_status(1, &err), ItemStatus::Dead);

        let parked = RetryPolicy {
            ceiling: 5,
            on_permanent: PermanentPolicy::Failed,
        };
        assert_eq!(parked.next_status(1, &err), ItemStatus::Failed);
        assert_eq!(parked.next_status(1, &ItemOutcome::Success), ItemStatus::Done);
    }

    #[test]
    fn test_dead_heavy() {
        let mut counts = StatusCounts::default();
        counts.add(ItemStatus::Done, 3);
        counts.add(ItemStatus::Dead, 3);
        let domain = DomainCounts {
            domain: "x.test".into(),
            counts,
        };
        assert!(domain.is_dead_heavy());
        assert_eq!(domain.counts.total(), 6);
    }
}
