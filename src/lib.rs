//! Hexcrawl: a polite, resumable crawl orchestrator
//!
//! This crate decides which URL of a configured target is fetched next, how
//! fast, under what per-domain and global concurrency, and when a failing
//! domain is backed off. Progress lives in a durable SQLite job store so an
//! interrupted crawl resumes where it stopped.

pub mod config;
pub mod crawler;
pub mod metrics;
pub mod notify;
pub mod output;
pub mod robots;
pub mod state;
pub mod store;
pub mod url;

use thiserror::Error;

/// Main error type for Hexcrawl operations
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Output error: {0}")]
    Ingest(#[from] output::IngestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Crawl task failed: {0}")]
    TaskFailed(String),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid domain pattern: {0}")]
    InvalidPattern(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for Hexcrawl operations
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::{Config, TargetConfig};
pub use crawler::{Coordinator, RunSummary, Runner};
pub use state::{BreakerState, DomainState, ItemStatus};
pub use store::{JobStore, SqliteJobStore};
pub use url::{extract_domain, normalize_url};
