use crate::crawler::{
    BreakerConfig, FetchMode, PaginationDriver, PaginationRule, PolitenessConfig,
};
use crate::store::{PermanentPolicy, RetryPolicy};
use crate::url::DomainScope;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Main configuration structure for Hexcrawl
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(rename = "target", default)]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }
}

/// Job store location
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// Operator notification channels
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Write events to the log
    #[serde(default = "default_true")]
    pub log: bool,

    /// POST every event as JSON to this URL
    #[serde(rename = "webhook-url", default)]
    pub webhook_url: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: true,
            webhook_url: None,
        }
    }
}

/// Metrics endpoint; disabled unless `bind` is set
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Socket address to serve `/metrics` and `/health` on, e.g. `127.0.0.1:9100`
    #[serde(default)]
    pub bind: Option<String>,
}

/// Recurring runs (`--daemon`)
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ScheduleConfig {
    #[serde(rename = "interval-minutes", default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
        }
    }
}

/// One crawl definition
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,

    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Paths (or absolute URLs) joined onto `base-url` to form the seeds
    #[serde(rename = "start-paths")]
    pub start_paths: Vec<String>,

    #[serde(default)]
    pub mode: FetchMode,

    /// Wildcard domain patterns follow-ups must stay inside; defaults to the base URL's host
    #[serde(rename = "allowed-domains", default)]
    pub allowed_domains: Vec<String>,

    #[serde(rename = "user-agent", default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(rename = "rate-limit", default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub pagination: PaginationConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_global_concurrency")]
    pub global: u32,

    #[serde(rename = "per-domain", default = "default_per_domain_concurrency")]
    pub per_domain: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global: default_global_concurrency(),
            per_domain: default_per_domain_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum time between fetch starts on one domain (milliseconds)
    #[serde(rename = "base-delay-ms", default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Extra random delay, as a fraction of the base delay
    #[serde(rename = "jitter-fraction", default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt for transient failures
    #[serde(default = "default_retry_ceiling")]
    pub ceiling: u32,

    /// Where items with a permanent error end up
    #[serde(rename = "permanent-errors", default)]
    pub permanent_errors: PermanentPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ceiling: default_retry_ceiling(),
            permanent_errors: PermanentPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BreakerSettings {
    #[serde(rename = "failure-threshold", default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(rename = "failure-window-seconds", default = "default_failure_window")]
    pub failure_window_seconds: u64,

    #[serde(rename = "cooldown-seconds", default = "default_cooldown")]
    pub cooldown_seconds: u64,

    /// End the run as blocked once every domain with pending work is open
    #[serde(rename = "stop-when-all-open", default = "default_true")]
    pub stop_when_all_open: bool,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_seconds: default_failure_window(),
            cooldown_seconds: default_cooldown(),
            stop_when_all_open: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FetchConfig {
    /// Per-attempt timeout (milliseconds)
    #[serde(rename = "timeout-ms", default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(rename = "respect-robots", default = "default_true")]
    pub respect_robots: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            respect_robots: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    /// CSS selector of "next page" links
    #[serde(rename = "next-selector", default)]
    pub next_selector: Option<String>,

    /// URL (relative or absolute) containing a `{page}` placeholder
    #[serde(rename = "url-template", default)]
    pub url_template: Option<String>,

    #[serde(rename = "start-page", default = "default_start_page")]
    pub start_page: u32,

    /// Longest chain of pages followed from one start path
    #[serde(rename = "max-pages", default = "default_max_pages")]
    pub max_pages: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            next_selector: None,
            url_template: None,
            start_page: default_start_page(),
            max_pages: default_max_pages(),
        }
    }
}

impl PaginationConfig {
    pub fn rule(&self) -> PaginationRule {
        match (&self.next_selector, &self.url_template) {
            (Some(selector), _) => PaginationRule::NextLink {
                selector: selector.clone(),
            },
            (None, Some(template)) => PaginationRule::UrlTemplate {
                template: template.clone(),
                start_page: self.start_page,
            },
            (None, None) => PaginationRule::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Jsonl,
    Csv,
    #[default]
    None,
}

/// Where fetched pages are written
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub kind: OutputKind,

    #[serde(default)]
    pub path: Option<String>,
}

impl TargetConfig {
    /// Seed URLs: every start path joined onto the base URL
    pub fn start_urls(&self) -> Result<Vec<String>, url::ParseError> {
        let base = Url::parse(&self.base_url)?;
        self.start_paths
            .iter()
            .map(|path| base.join(path).map(String::from))
            .collect()
    }

    /// Allowed domains, falling back to the base URL's host
    pub fn scope(&self) -> DomainScope {
        if !self.allowed_domains.is_empty() {
            return DomainScope::new(&self.allowed_domains);
        }
        let host = Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase));
        DomainScope::new(host)
    }

    pub fn politeness_config(&self) -> PolitenessConfig {
        PolitenessConfig {
            base_delay: Duration::from_millis(self.rate_limit.base_delay_ms),
            jitter_fraction: self.rate_limit.jitter_fraction,
            per_domain_limit: self.concurrency.per_domain as usize,
            global_limit: self.concurrency.global as usize,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            failure_window: Duration::from_secs(self.breaker.failure_window_seconds),
            cooldown: Duration::from_secs(self.breaker.cooldown_seconds),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ceiling: self.retry.ceiling,
            on_permanent: self.retry.permanent_errors,
        }
    }

    pub fn pagination_driver(&self) -> PaginationDriver {
        PaginationDriver::new(
            self.pagination.rule(),
            self.pagination.max_pages,
            self.scope(),
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch.timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_minutes() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("hexcrawl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_global_concurrency() -> u32 {
    5
}

fn default_per_domain_concurrency() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_jitter_fraction() -> f64 {
    0.5
}

fn default_retry_ceiling() -> u32 {
    2
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    30
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_start_page() -> u32 {
    1
}

fn default_max_pages() -> u32 {
    100
}
