//! SQLite job store
//!
//! All access goes through one connection behind a mutex, so every store
//! operation is a serialized transaction. Leasing is a single
//! `UPDATE ... RETURNING` that only matches `pending` rows, which makes it a
//! compare-and-transition on the item's status.

use crate::state::{BreakerState, DomainState, ItemStatus};
use crate::store::schema::initialize_schema;
use crate::store::traits::{JobStore, StoreError, StoreResult};
use crate::store::{
    CrawlItem, DomainCounts, EnqueueOutcome, ItemOutcome, JobRun, RetryPolicy, RunStatus,
    StatusCounts,
};
use crate::url::normalize_with_domain;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const ACTIVE_RUN: &str = "(SELECT MAX(id) FROM runs WHERE target_id = ?1)";

const ITEM_COLUMNS: &str = "id, run_id, target_id, url, domain, depth, status, attempt_count, \
                            discovered_at, last_attempt_at, last_error";

/// SQLite-backed [`JobStore`]
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Opens or creates the store at `path`
    ///
    /// Opening a store is the restart point: any item a previous process
    /// left `in_flight` is reset to `pending` before this returns.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        Self::from_connection(conn)
    }

    /// Creates a store backed by an in-memory database
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        initialize_schema(&conn)?;
        let store = Self {
            conn: Mutex::new(conn),
        };

        let recovered = store.recover_in_flight()?;
        if recovered > 0 {
            tracing::warn!(
                "Recovered {} in-flight items from an unclean shutdown",
                recovered
            );
        }

        Ok(store)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<CrawlItem> {
    Ok(CrawlItem {
        id: row.get(0)?,
        run_id: row.get(1)?,
        target_id: row.get(2)?,
        url: row.get(3)?,
        domain: row.get(4)?,
        depth: row.get(5)?,
        status: row.get(6)?,
        attempt_count: row.get(7)?,
        discovered_at: row.get(8)?,
        last_attempt_at: row.get(9)?,
        last_error: row.get(10)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        id: row.get(0)?,
        target_id: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        config_hash: row.get(4)?,
        status: row.get(5)?,
        resumed: false,
    })
}

fn latest_run(conn: &Connection, target_id: &str) -> StoreResult<Option<JobRun>> {
    let run = conn
        .query_row(
            "SELECT id, target_id, started_at, finished_at, config_hash, status
             FROM runs WHERE target_id = ?1 ORDER BY id DESC LIMIT 1",
            params![target_id],
            row_to_run,
        )
        .optional()?;
    Ok(run)
}

fn parse_timestamp(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
    })
    .transpose()
}

impl JobStore for SqliteJobStore {
    // ===== Run Management =====

    fn begin_run(&self, target_id: &str, config_hash: &str, fresh: bool) -> StoreResult<JobRun> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let latest = latest_run(&tx, target_id)?;

        if let Some(mut run) = latest.clone().filter(|r| !fresh && r.status.is_resumable()) {
            if run.config_hash != config_hash {
                tracing::warn!(
                    "Configuration changed since run {} of target '{}' started",
                    run.id,
                    target_id
                );
            }
            tx.execute(
                "UPDATE runs SET status = ?1, finished_at = NULL WHERE id = ?2",
                params![RunStatus::Running, run.id],
            )?;
            tx.commit()?;

            tracing::info!("Resuming run {} of target '{}'", run.id, target_id);
            run.status = RunStatus::Running;
            run.finished_at = None;
            run.resumed = true;
            return Ok(run);
        }

        let started_at = now();
        if let Some(previous) = latest.filter(|r| r.status.is_resumable()) {
            tracing::info!(
                "Abandoning unfinished run {} of target '{}'",
                previous.id,
                target_id
            );
            tx.execute(
                "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
                params![RunStatus::Abandoned, started_at, previous.id],
            )?;
        }

        tx.execute(
            "INSERT INTO runs (target_id, started_at, config_hash, status) VALUES (?1, ?2, ?3, ?4)",
            params![target_id, started_at, config_hash, RunStatus::Running],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::info!("Started run {} of target '{}'", id, target_id);
        Ok(JobRun {
            id,
            target_id: target_id.to_string(),
            started_at,
            finished_at: None,
            config_hash: config_hash.to_string(),
            status: RunStatus::Running,
            resumed: false,
        })
    }

    fn active_run(&self, target_id: &str) -> StoreResult<Option<JobRun>> {
        let conn = self.conn()?;
        latest_run(&conn, target_id)
    }

    fn finish_run(&self, run_id: i64, status: RunStatus) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status, now(), run_id],
        )?;
        Ok(())
    }

    // ===== Items =====

    fn enqueue(&self, target_id: &str, url: &str, depth: u32) -> StoreResult<EnqueueOutcome> {
        let (normalized, domain) =
            normalize_with_domain(url).map_err(|e| StoreError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let conn = self.conn()?;
        let run_id: Option<i64> = conn.query_row(
            "SELECT MAX(id) FROM runs WHERE target_id = ?1",
            params![target_id],
            |row| row.get(0),
        )?;
        let run_id = run_id.ok_or_else(|| StoreError::NoActiveRun(target_id.to_string()))?;

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO crawl_items
             (run_id, target_id, url, domain, depth, status, attempt_count, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                run_id,
                target_id,
                normalized.as_str(),
                domain,
                depth,
                ItemStatus::Pending,
                now()
            ],
        )?;

        if inserted == 0 {
            tracing::trace!("Already known: {}", normalized);
            Ok(EnqueueOutcome::AlreadyExists)
        } else {
            Ok(EnqueueOutcome::Inserted(conn.last_insert_rowid()))
        }
    }

    fn lease_next(&self, target_id: &str, domain: Option<&str>) -> StoreResult<Option<CrawlItem>> {
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE crawl_items
             SET status = ?3, attempt_count = attempt_count + 1, last_attempt_at = ?4
             WHERE id = (
                 SELECT id FROM crawl_items
                 WHERE run_id = {ACTIVE_RUN} AND status = ?5 AND (?2 IS NULL OR domain = ?2)
                 ORDER BY id LIMIT 1
             )
             RETURNING {ITEM_COLUMNS}"
        );

        let item = conn
            .query_row(
                &sql,
                params![
                    target_id,
                    domain,
                    ItemStatus::InFlight,
                    now(),
                    ItemStatus::Pending
                ],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }

    fn complete(
        &self,
        item_id: i64,
        outcome: &ItemOutcome,
        policy: &RetryPolicy,
    ) -> StoreResult<ItemStatus> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let (status, attempts): (ItemStatus, u32) = tx
            .query_row(
                "SELECT status, attempt_count FROM crawl_items WHERE id = ?1",
                params![item_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(StoreError::ItemNotFound(item_id))?;

        let next = policy.next_status(attempts, outcome);
        if status != ItemStatus::InFlight {
            return Err(StoreError::InvalidTransition {
                id: item_id,
                from: status,
                to: next,
            });
        }

        tx.execute(
            "UPDATE crawl_items SET status = ?1, last_error = ?2 WHERE id = ?3",
            params![next, outcome.error_message(), item_id],
        )?;
        tx.commit()?;

        Ok(next)
    }

    fn get_item(&self, item_id: i64) -> StoreResult<CrawlItem> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM crawl_items WHERE id = ?1"),
            params![item_id],
            row_to_item,
        )
        .optional()?
        .ok_or(StoreError::ItemNotFound(item_id))
    }

    fn snapshot_counts(&self, target_id: &str) -> StoreResult<StatusCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM crawl_items WHERE run_id = {ACTIVE_RUN} GROUP BY status"
        ))?;

        let mut counts = StatusCounts::default();
        let rows = stmt.query_map(params![target_id], |row| {
            Ok((row.get::<_, ItemStatus>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            counts.add(status, count);
        }
        Ok(counts)
    }

    fn domain_counts(&self, target_id: &str) -> StoreResult<Vec<DomainCounts>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT domain, status, COUNT(*) FROM crawl_items WHERE run_id = {ACTIVE_RUN}
             GROUP BY domain, status ORDER BY domain"
        ))?;

        let rows = stmt.query_map(params![target_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, ItemStatus>(1)?,
                row.get::<_, u64>(2)?,
            ))
        })?;

        let mut result: Vec<DomainCounts> = Vec::new();
        for row in rows {
            let (domain, status, count) = row?;
            match result.last_mut() {
                Some(last) if last.domain == domain => last.counts.add(status, count),
                _ => {
                    let mut counts = StatusCounts::default();
                    counts.add(status, count);
                    result.push(DomainCounts { domain, counts });
                }
            }
        }
        Ok(result)
    }

    fn pending_domains(&self, target_id: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT domain, MIN(id) AS first_id FROM crawl_items
             WHERE run_id = {ACTIVE_RUN} AND status = ?2
             GROUP BY domain ORDER BY first_id"
        ))?;

        let domains = stmt
            .query_map(params![target_id, ItemStatus::Pending], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(domains)
    }

    fn recover_in_flight(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let moved = conn.execute(
            "UPDATE crawl_items SET status = ?1 WHERE status = ?2",
            params![ItemStatus::Pending, ItemStatus::InFlight],
        )?;
        Ok(moved)
    }

    fn release_in_flight(&self, target_id: &str) -> StoreResult<usize> {
        let conn = self.conn()?;
        let moved = conn.execute(
            &format!("UPDATE crawl_items SET status = ?2 WHERE run_id = {ACTIVE_RUN} AND status = ?3"),
            params![target_id, ItemStatus::Pending, ItemStatus::InFlight],
        )?;
        Ok(moved)
    }

    fn requeue_failed(&self, target_id: &str) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let moved = tx.execute(
            &format!(
                "UPDATE crawl_items SET status = ?2, attempt_count = 0
                 WHERE run_id = {ACTIVE_RUN} AND status = ?3"
            ),
            params![target_id, ItemStatus::Pending, ItemStatus::Failed],
        )?;

        // a finished run with work put back becomes resumable again
        if moved > 0 {
            tx.execute(
                &format!("UPDATE runs SET status = ?2 WHERE id = {ACTIVE_RUN} AND status = ?3"),
                params![target_id, RunStatus::Interrupted, RunStatus::Completed],
            )?;
        }
        tx.commit()?;
        Ok(moved)
    }

    // ===== Domain State Persistence =====

    fn save_domain_states(&self, target_id: &str, states: &[DomainState]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO domain_states
                 (target_id, domain, last_fetch_at, in_flight, breaker_state, opened_at, consecutive_failures)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(target_id, domain) DO UPDATE SET
                     last_fetch_at = excluded.last_fetch_at,
                     in_flight = excluded.in_flight,
                     breaker_state = excluded.breaker_state,
                     opened_at = excluded.opened_at,
                     consecutive_failures = excluded.consecutive_failures",
            )?;

            for state in states {
                stmt.execute(params![
                    target_id,
                    state.domain,
                    state.last_fetch_at.map(|t| t.to_rfc3339()),
                    state.in_flight,
                    state.breaker,
                    state.opened_at.map(|t| t.to_rfc3339()),
                    state.consecutive_failures,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_domain_states(&self, target_id: &str) -> StoreResult<Vec<DomainState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT domain, last_fetch_at, in_flight, breaker_state, opened_at, consecutive_failures
             FROM domain_states WHERE target_id = ?1 ORDER BY domain",
        )?;

        let rows = stmt.query_map(params![target_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, BreakerState>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, u32>(5)?,
            ))
        })?;

        let mut states = Vec::new();
        for row in rows {
            let (domain, last_fetch_at, in_flight, breaker, opened_at, consecutive_failures) = row?;
            states.push(DomainState {
                domain,
                last_fetch_at: parse_timestamp(last_fetch_at)?,
                in_flight,
                breaker,
                opened_at: parse_timestamp(opened_at)?,
                consecutive_failures,
            });
        }
        Ok(states)
    }
}

// ===== Column conversions =====

fn unknown(kind: &str, raw: &str) -> FromSqlError {
    FromSqlError::Other(format!("unknown {} {:?}", kind, raw).into())
}

impl FromSql for ItemStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        ItemStatus::from_db_string(raw).ok_or_else(|| unknown("item status", raw))
    }
}

impl ToSql for ItemStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_db_string()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        RunStatus::from_db_string(raw).ok_or_else(|| unknown("run status", raw))
    }
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_db_string()))
    }
}

impl FromSql for BreakerState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        BreakerState::from_db_string(raw).ok_or_else(|| unknown("breaker state", raw))
    }
}

impl ToSql for BreakerState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_db_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PermanentPolicy;
    use std::collections::HashSet;
    use std::sync::Arc;

    const TARGET: &str = "shop";

    fn store_with_run() -> SqliteJobStore {
        let store = SqliteJobStore::new_in_memory().unwrap();
        store.begin_run(TARGET, "hash", false).unwrap();
        store
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let store = store_with_run();

        let first = store.enqueue(TARGET, "https://a.test/list?page=2", 0).unwrap();
        let second = store.enqueue(TARGET, "https://a.test/list?page=2", 1).unwrap();
        let variant = store
            .enqueue(TARGET, "https://A.TEST/list/?page=2#top", 1)
            .unwrap();

        assert!(first.is_inserted());
        assert_eq!(second, EnqueueOutcome::AlreadyExists);
        assert_eq!(variant, EnqueueOutcome::AlreadyExists);
        assert_eq!(store.snapshot_counts(TARGET).unwrap().pending, 1);
    }

    #[test]
    fn test_same_url_distinct_per_target() {
        let store = store_with_run();
        store.begin_run("other", "hash", false).unwrap();

        assert!(store.enqueue(TARGET, "https://a.test/", 0).unwrap().is_inserted());
        assert!(store.enqueue("other", "https://a.test/", 0).unwrap().is_inserted());
    }

    #[test]
    fn test_enqueue_requires_run() {
        let store = SqliteJobStore::new_in_memory().unwrap();
        let result = store.enqueue(TARGET, "https://a.test/", 0);
        assert!(matches!(result, Err(StoreError::NoActiveRun(_))));
    }

    #[test]
    fn test_enqueue_rejects_bad_url() {
        let store = store_with_run();
        let result = store.enqueue(TARGET, "mailto:someone@a.test", 0);
        assert!(matches!(result, Err(StoreError::InvalidUrl { .. })));
    }

    #[test]
    fn test_lease_is_fifo_and_marks_in_flight() {
        let store = store_with_run();
        for n in 1..=3 {
            store
                .enqueue(TARGET, &format!("https://a.test/{}", n), 0)
                .unwrap();
        }

        let item = store.lease_next(TARGET, None).unwrap().unwrap();
        assert_eq!(item.url, "https://a.test/1");
        assert_eq!(item.status, ItemStatus::InFlight);
        assert_eq!(item.attempt_count, 1);
        assert!(item.last_attempt_at.is_some());

        let item = store.lease_next(TARGET, None).unwrap().unwrap();
        assert_eq!(item.url, "https://a.test/2");

        let counts = store.snapshot_counts(TARGET).unwrap();
        assert_eq!(counts.in_flight, 2);
        assert_eq!(counts.pending, 1);
    }

    #[test]
    fn test_lease_domain_filter() {
        let store = store_with_run();
        store.enqueue(TARGET, "https://a.test/1", 0).unwrap();
        store.enqueue(TARGET, "https://b.test/1", 0).unwrap();

        let item = store.lease_next(TARGET, Some("b.test")).unwrap().unwrap();
        assert_eq!(item.domain, "b.test");
        assert!(store.lease_next(TARGET, Some("b.test")).unwrap().is_none());
        assert!(store.lease_next(TARGET, Some("c.test")).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_leases_are_unique() {
        let store = Arc::new(store_with_run());
        for n in 0..200 {
            store
                .enqueue(TARGET, &format!("https://d{}.test/{}", n % 4, n), 0)
                .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut leased = Vec::new();
                    while let Some(item) = store.lease_next(TARGET, None).unwrap() {
                        leased.push(item.id);
                    }
                    leased
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "item {} leased twice", id);
            }
        }
        assert_eq!(total, 200);
        assert_eq!(store.snapshot_counts(TARGET).unwrap().in_flight, 200);
    }

    #[test]
    fn test_complete_success() {
        let store = store_with_run();
        store.enqueue(TARGET, "https://a.test/", 0).unwrap();
        let item = store.lease_next(TARGET, None).unwrap().unwrap();

        let status = store
            .complete(item.id, &ItemOutcome::Success, &RetryPolicy::default())
            .unwrap();
        assert_eq!(status, ItemStatus::Done);
        assert_eq!(store.get_item(item.id).unwrap().status, ItemStatus::Done);
    }

    #[test]
    fn test_complete_requires_in_flight() {
        let store = store_with_run();
        let id = match store.enqueue(TARGET, "https://a.test/", 0).unwrap() {
            EnqueueOutcome::Inserted(id) => id,
            EnqueueOutcome::AlreadyExists => panic!("fresh url"),
        };

        let result = store.complete(id, &ItemOutcome::Success, &RetryPolicy::default());
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition {
                from: ItemStatus::Pending,
                ..
            })
        ));

        let missing = store.complete(9999, &ItemOutcome::Success, &RetryPolicy::default());
        assert!(matches!(missing, Err(StoreError::ItemNotFound(9999))));
    }

    #[test]
    fn test_retry_ceiling_then_dead() {
        let store = store_with_run();
        store.enqueue(TARGET, "https://a.test/", 0).unwrap();
        let policy = RetryPolicy::new(2);
        let failure = ItemOutcome::Transient("HTTP 503".into());

        let mut statuses = Vec::new();
        while let Some(item) = store.lease_next(TARGET, None).unwrap() {
            statuses.push(store.complete(item.id, &failure, &policy).unwrap());
        }

        assert_eq!(
            statuses,
            vec![ItemStatus::Pending, ItemStatus::Pending, ItemStatus::Dead]
        );
        let counts = store.snapshot_counts(TARGET).unwrap();
        assert_eq!(counts.dead, 1);
        assert_eq!(counts.pending, 0);
    }

    #[test]
    fn test_failed_items_can_be_requeued() {
        let store = store_with_run();
        store.enqueue(TARGET, "https://a.test/gone", 0).unwrap();
        let policy = RetryPolicy {
            ceiling: 0,
            on_permanent: PermanentPolicy::Failed,
        };

        let item = store.lease_next(TARGET, None).unwrap().unwrap();
        let status = store
            .complete(item.id, &ItemOutcome::Permanent("HTTP 404".into()), &policy)
            .unwrap();
        assert_eq!(status, ItemStatus::Failed);
        assert_eq!(
            store.get_item(item.id).unwrap().last_error.as_deref(),
            Some("HTTP 404")
        );

        assert_eq!(store.requeue_failed(TARGET).unwrap(), 1);
        let item = store.get_item(item.id).unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempt_count, 0);
    }

    #[test]
    fn test_requeue_reopens_completed_run() {
        let store = store_with_run();
        store.enqueue(TARGET, "https://a.test/gone", 0).unwrap();
        let policy = RetryPolicy {
            ceiling: 0,
            on_permanent: PermanentPolicy::Failed,
        };
        let item = store.lease_next(TARGET, None).unwrap().unwrap();
        store
            .complete(item.id, &ItemOutcome::Permanent("HTTP 410".into()), &policy)
            .unwrap();
        let run = store.active_run(TARGET).unwrap().unwrap();
        store.finish_run(run.id, RunStatus::Completed).unwrap();

        assert_eq!(store.requeue_failed(TARGET).unwrap(), 1);
        let reopened = store.active_run(TARGET).unwrap().unwrap();
        assert_eq!(reopened.status, RunStatus::Interrupted);

        let resumed = store.begin_run(TARGET, "hash", false).unwrap();
        assert_eq!(resumed.id, run.id);
        assert!(resumed.resumed);
    }

    #[test]
    fn test_release_in_flight_is_scoped_to_target() {
        let store = store_with_run();
        store.begin_run("other", "hash", false).unwrap();
        store.enqueue(TARGET, "https://a.test/1", 0).unwrap();
        store.enqueue("other", "https://b.test/1", 0).unwrap();
        let mine = store.lease_next(TARGET, None).unwrap().unwrap();
        store.lease_next("other", None).unwrap().unwrap();

        assert_eq!(store.release_in_flight(TARGET).unwrap(), 1);

        let item = store.get_item(mine.id).unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(store.snapshot_counts("other").unwrap().in_flight, 1);
        assert_eq!(store.release_in_flight(TARGET).unwrap(), 0);
    }

    #[test]
    fn test_recovery_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        {
            let store = SqliteJobStore::open(&path).unwrap();
            store.begin_run(TARGET, "hash", false).unwrap();
            for n in 0..3 {
                store
                    .enqueue(TARGET, &format!("https://a.test/{}", n), 0)
                    .unwrap();
            }
            store.lease_next(TARGET, None).unwrap().unwrap();
            store.lease_next(TARGET, None).unwrap().unwrap();
            // dropped without completing: simulated crash
        }

        let store = SqliteJobStore::open(&path).unwrap();
        let run = store.begin_run(TARGET, "hash", false).unwrap();
        assert!(run.resumed);

        let counts = store.snapshot_counts(TARGET).unwrap();
        assert_eq!(counts.in_flight, 0);
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_begin_run_resume_and_fresh() {
        let store = SqliteJobStore::new_in_memory().unwrap();
        let first = store.begin_run(TARGET, "h1", false).unwrap();
        assert!(!first.resumed);
        store.enqueue(TARGET, "https://a.test/", 0).unwrap();

        let resumed = store.begin_run(TARGET, "h1", false).unwrap();
        assert_eq!(resumed.id, first.id);
        assert!(resumed.resumed);

        let fresh = store.begin_run(TARGET, "h1", true).unwrap();
        assert_ne!(fresh.id, first.id);
        assert_eq!(store.snapshot_counts(TARGET).unwrap().total(), 0);
        assert!(store.enqueue(TARGET, "https://a.test/", 0).unwrap().is_inserted());

        let conn = store.conn().unwrap();
        let old_status: RunStatus = conn
            .query_row(
                "SELECT status FROM runs WHERE id = ?1",
                params![first.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(old_status, RunStatus::Abandoned);
    }

    #[test]
    fn test_completed_run_is_not_resumed() {
        let store = SqliteJobStore::new_in_memory().unwrap();
        let first = store.begin_run(TARGET, "h", false).unwrap();
        store.finish_run(first.id, RunStatus::Completed).unwrap();

        let next = store.begin_run(TARGET, "h", false).unwrap();
        assert_ne!(next.id, first.id);
        assert!(!next.resumed);

        let active = store.active_run(TARGET).unwrap().unwrap();
        assert_eq!(active.id, next.id);
    }

    #[test]
    fn test_pending_domains_in_discovery_order() {
        let store = store_with_run();
        store.enqueue(TARGET, "https://b.test/1", 0).unwrap();
        store.enqueue(TARGET, "https://a.test/1", 0).unwrap();
        store.enqueue(TARGET, "https://b.test/2", 0).unwrap();

        assert_eq!(
            store.pending_domains(TARGET).unwrap(),
            vec!["b.test".to_string(), "a.test".to_string()]
        );

        let counts = store.domain_counts(TARGET).unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].domain, "a.test");
        assert_eq!(counts[1].counts.pending, 2);
    }

    #[test]
    fn test_domain_states_roundtrip() {
        let store = store_with_run();
        let opened = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut state = DomainState::new("a.test");
        state.breaker = BreakerState::Open;
        state.opened_at = Some(opened);
        state.last_fetch_at = Some(opened);
        state.consecutive_failures = 4;

        store.save_domain_states(TARGET, &[state.clone()]).unwrap();
        state.consecutive_failures = 5;
        store.save_domain_states(TARGET, &[state.clone()]).unwrap();

        let loaded = store.load_domain_states(TARGET).unwrap();
        assert_eq!(loaded, vec![state]);
        assert!(store.load_domain_states("other").unwrap().is_empty());
    }
}
