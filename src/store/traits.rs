//! Job store trait and error types

use crate::state::{DomainState, ItemStatus};
use crate::store::{
    CrawlItem, DomainCounts, EnqueueOutcome, ItemOutcome, JobRun, RetryPolicy, RunStatus,
    StatusCounts,
};
use thiserror::Error;

/// Errors that can occur during job store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("No active run for target {0}")]
    NoActiveRun(String),

    #[error("Item not found: {0}")]
    ItemNotFound(i64),

    #[error("Invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Result type for job store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable, crash-recoverable record of every crawl item per target
///
/// Implementations own CrawlItem and DomainState persistence. Every method
/// takes `&self`; implementations serialize mutations internally so one
/// store can be shared across all workers of all targets.
pub trait JobStore: Send + Sync {
    // ===== Run Management =====

    /// Resumes or opens the target's run
    ///
    /// The latest run is resumed when it is still `running`, `interrupted`
    /// or `blocked` and `fresh` is false. Otherwise a new run is opened and a
    /// superseded unfinished run is marked `abandoned`.
    fn begin_run(&self, target_id: &str, config_hash: &str, fresh: bool) -> StoreResult<JobRun>;

    /// The target's latest run, if any
    fn active_run(&self, target_id: &str) -> StoreResult<Option<JobRun>>;

    /// Records the run's final status and finish time
    fn finish_run(&self, run_id: i64, status: RunStatus) -> StoreResult<()>;

    // ===== Items =====

    /// Inserts a `pending` item keyed by (target, normalized URL)
    ///
    /// Returns `AlreadyExists` without mutation when the key is present.
    fn enqueue(&self, target_id: &str, url: &str, depth: u32) -> StoreResult<EnqueueOutcome>;

    /// Atomically claims the oldest `pending` item, optionally restricted to
    /// one domain, moving it to `in_flight`
    ///
    /// # Arguments
    ///
    /// * `target_id` - Target whose active run is leased from
    /// * `domain` - Only lease items of this domain when set
    ///
    /// # Returns
    ///
    /// The claimed item with its attempt count already incremented, or
    /// `None` when nothing matching is pending
    fn lease_next(&self, target_id: &str, domain: Option<&str>) -> StoreResult<Option<CrawlItem>>;

    /// Moves an `in_flight` item to its post-attempt status and returns it
    fn complete(
        &self,
        item_id: i64,
        outcome: &ItemOutcome,
        policy: &RetryPolicy,
    ) -> StoreResult<ItemStatus>;

    fn get_item(&self, item_id: i64) -> StoreResult<CrawlItem>;

    /// Per-status item counts for the target's active run
    fn snapshot_counts(&self, target_id: &str) -> StoreResult<StatusCounts>;

    /// Per-domain item counts for the target's active run
    fn domain_counts(&self, target_id: &str) -> StoreResult<Vec<DomainCounts>>;

    /// Domains with pending work, in order of their oldest pending item
    fn pending_domains(&self, target_id: &str) -> StoreResult<Vec<String>>;

    /// Resets every `in_flight` item to `pending`; returns how many moved
    fn recover_in_flight(&self) -> StoreResult<usize>;

    /// Resets the `in_flight` items of the target's active run to `pending`
    ///
    /// Only safe once no worker of the target is running; the attempt that
    /// stranded an item stays counted.
    fn release_in_flight(&self, target_id: &str) -> StoreResult<usize>;

    /// Moves the target's `failed` items back to `pending`
    fn requeue_failed(&self, target_id: &str) -> StoreResult<usize>;

    // ===== Domain State Persistence =====

    fn save_domain_states(&self, target_id: &str, states: &[DomainState]) -> StoreResult<()>;

    fn load_domain_states(&self, target_id: &str) -> StoreResult<Vec<DomainState>>;
}
