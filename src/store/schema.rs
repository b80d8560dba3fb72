//! Database schema for the job store

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- One row per crawl session of a target
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target_id, id);

-- Every discovered URL; rows are never deleted
CREATE TABLE IF NOT EXISTS crawl_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    target_id TEXT NOT NULL,
    url TEXT NOT NULL,
    domain TEXT NOT NULL,
    depth INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    discovered_at TEXT NOT NULL,
    last_attempt_at TEXT,
    last_error TEXT,
    UNIQUE(run_id, url)
);

CREATE INDEX IF NOT EXISTS idx_items_lease ON crawl_items(run_id, status, domain, id);
CREATE INDEX IF NOT EXISTS idx_items_status ON crawl_items(status);

-- Politeness and breaker state per (target, domain) for resumption
CREATE TABLE IF NOT EXISTS domain_states (
    target_id TEXT NOT NULL,
    domain TEXT NOT NULL,
    last_fetch_at TEXT,
    in_flight INTEGER NOT NULL DEFAULT 0,
    breaker_state TEXT NOT NULL DEFAULT 'closed',
    opened_at TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (target_id, domain)
);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)
}
