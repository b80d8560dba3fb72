//! Fetcher capability and its HTTP implementation
//!
//! The orchestrator only sees the [`Fetcher`] trait: a URL and a mode go in,
//! a [`Page`] or a classified [`FetchError`] comes out. [`HttpFetcher`] is
//! the reqwest-backed implementation used by the binary:
//! - Builds one HTTP client per target with its user agent
//! - Consults robots.txt per origin when configured
//! - Classifies status codes and network errors as transient or permanent

use crate::robots::RobotsCache;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{redirect::Policy, Client, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// How a page must be retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Plain HTTP GET
    #[default]
    Static,
    /// Needs a JavaScript-capable browser
    Rendered,
    /// Plain HTTP GET issued from an async-heavy target (no throttling difference)
    Async,
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Static => "static",
            Self::Rendered => "rendered",
            Self::Async => "async",
        })
    }
}

/// A successfully fetched page
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// URL that was requested
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl Page {
    /// Builds a 200 text/html page, mostly useful for scripted fetchers
    pub fn html(url: &str, body: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 200,
            content_type: Some("text/html".to_string()),
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }
}

/// Whether an error is worth retrying and counts against the domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Errors a fetch attempt can end with
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server error: HTTP {0}")]
    ServerError(u16),

    #[error("throttled: HTTP {0}")]
    RateLimited(u16),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("client error: HTTP {0}")]
    ClientError(u16),

    #[error("disallowed by robots.txt: {0}")]
    RobotsDisallowed(String),

    #[error("fetch mode {0} is not supported by this fetcher")]
    UnsupportedMode(FetchMode),
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_)
            | Self::Connection(_)
            | Self::ServerError(_)
            | Self::RateLimited(_)
            | Self::Body(_) => ErrorClass::Transient,
            Self::ClientError(_) | Self::RobotsDisallowed(_) | Self::UnsupportedMode(_) => {
                ErrorClass::Permanent
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Maps a non-success HTTP status onto the taxonomy
    pub fn from_status(status: StatusCode) -> Self {
        let code = status.as_u16();
        match status {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Self::RateLimited(code),
            s if s.is_server_error() => Self::ServerError(code),
            _ => Self::ClientError(code),
        }
    }
}

/// Retrieves pages for the orchestrator
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, mode: FetchMode) -> Result<Page, FetchError>;
}

/// Builds an HTTP client for one target
///
/// The client timeout is a backstop; the worker pool applies the configured
/// per-attempt timeout around every fetch.
pub fn build_http_client(user_agent: &str, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout + Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// reqwest-backed [`Fetcher`]
pub struct HttpFetcher {
    client: Client,
    user_agent: String,
    respect_robots: bool,
    robots: RobotsCache,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration, respect_robots: bool) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(user_agent, timeout)?,
            user_agent: user_agent.to_string(),
            respect_robots,
            robots: RobotsCache::new(),
        })
    }

    async fn check_robots(&self, url: &Url) -> Result<(), FetchError> {
        if !self.respect_robots {
            return Ok(());
        }
        let rules = self.robots.rules_for(&self.client, url).await;
        if rules.is_allowed(url.as_str(), &self.user_agent) {
            Ok(())
        } else {
            Err(FetchError::RobotsDisallowed(url.to_string()))
        }
    }
}

fn classify_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(Duration::ZERO)
    } else if e.is_connect() || e.is_request() {
        FetchError::Connection(e.to_string())
    } else if e.is_body() || e.is_decode() {
        FetchError::Body(e.to_string())
    } else {
        FetchError::Connection(e.to_string())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, mode: FetchMode) -> Result<Page, FetchError> {
        if mode == FetchMode::Rendered {
            return Err(FetchError::UnsupportedMode(mode));
        }

        let parsed = Url::parse(url).map_err(|e| FetchError::Connection(e.to_string()))?;
        self.check_robots(&parsed).await?;

        let response = self
            .client
            .get(parsed.as_str())
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status));
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(classify_reqwest)?;

        Ok(Page {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            content_type,
            body,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            FetchError::from_status(StatusCode::SERVICE_UNAVAILABLE),
            FetchError::ServerError(503)
        );
        assert_eq!(
            FetchError::from_status(StatusCode::TOO_MANY_REQUESTS),
            FetchError::RateLimited(429)
        );
        assert_eq!(
            FetchError::from_status(StatusCode::NOT_FOUND),
            FetchError::ClientError(404)
        );
    }

    #[test]
    fn test_error_classes() {
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(FetchError::ServerError(502).is_transient());
        assert!(FetchError::RateLimited(429).is_transient());
        assert!(!FetchError::ClientError(404).is_transient());
        assert!(!FetchError::RobotsDisallowed("https://a.test/x".into()).is_transient());
        assert_eq!(
            FetchError::UnsupportedMode(FetchMode::Rendered).class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_build_http_client() {
        assert!(build_http_client("hexcrawl/0.3", Duration::from_secs(10)).is_ok());
    }

    #[tokio::test]
    async fn test_rendered_mode_unsupported() {
        let fetcher = HttpFetcher::new("hexcrawl/0.3", Duration::from_secs(1), false).unwrap();
        let result = fetcher.fetch("https://a.test/", FetchMode::Rendered).await;
        assert_eq!(result, Err(FetchError::UnsupportedMode(FetchMode::Rendered)));
    }
}
