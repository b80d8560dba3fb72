//! Configuration module for Hexcrawl
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! A file declares the job store, notification channels, the optional metrics
//! endpoint and schedule, and one `[[target]]` table per crawl definition.
//!
//! # Example
//!
//! ```no_run
//! use hexcrawl::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("crawl.toml")).unwrap();
//! for target in &config.targets {
//!     println!("{}: {} start paths", target.name, target.start_paths.len());
//! }
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BreakerSettings, ConcurrencyConfig, Config, FetchConfig, MetricsConfig, NotifyConfig,
    OutputConfig, OutputKind, PaginationConfig, RateLimitConfig, RetryConfig, ScheduleConfig,
    StoreConfig, TargetConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
