//! Operator notifications
//!
//! The coordinator reports a handful of run-level events through a
//! [`Notifier`]. Delivery never blocks or fails a crawl: the coordinator
//! spawns each notification and only logs delivery errors.

mod webhook;

pub use webhook::WebhookNotifier;

use crate::config::NotifyConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while delivering a notification
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint answered with HTTP {0}")]
    Status(u16),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Run-level events worth telling an operator about
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CrawlEvent {
    RunStarted {
        target: String,
        run_id: i64,
        resumed: bool,
    },
    BreakerOpened {
        target: String,
        domain: String,
        consecutive_failures: u32,
        last_error: String,
    },
    TargetExhausted {
        target: String,
        run_id: i64,
        done: u64,
        failed: u64,
        dead: u64,
    },
    AllDomainsOpen {
        target: String,
        run_id: i64,
        domains: Vec<String>,
    },
    RunInterrupted {
        target: String,
        run_id: i64,
        pending: u64,
    },
}

impl CrawlEvent {
    pub fn target(&self) -> &str {
        match self {
            Self::RunStarted { target, .. }
            | Self::BreakerOpened { target, .. }
            | Self::TargetExhausted { target, .. }
            | Self::AllDomainsOpen { target, .. }
            | Self::RunInterrupted { target, .. } => target,
        }
    }
}

impl fmt::Display for CrawlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunStarted {
                target,
                run_id,
                resumed,
            } => {
                let verb = if *resumed { "resumed" } else { "started" };
                write!(f, "[{}] run #{} {}", target, run_id, verb)
            }
            Self::BreakerOpened {
                target,
                domain,
                consecutive_failures,
                last_error,
            } => write!(
                f,
                "[{}] circuit breaker opened for {} after {} failures ({})",
                target, domain, consecutive_failures, last_error
            ),
            Self::TargetExhausted {
                target,
                run_id,
                done,
                failed,
                dead,
            } => write!(
                f,
                "[{}] run #{} finished: {} done, {} failed, {} dead",
                target, run_id, done, failed, dead
            ),
            Self::AllDomainsOpen {
                target,
                run_id,
                domains,
            } => write!(
                f,
                "[{}] run #{} blocked, every domain is open: {}",
                target,
                run_id,
                domains.join(", ")
            ),
            Self::RunInterrupted {
                target,
                run_id,
                pending,
            } => write!(
                f,
                "[{}] run #{} interrupted with {} items pending",
                target, run_id, pending
            ),
        }
    }
}

/// Delivers crawl events somewhere an operator will see them
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &CrawlEvent) -> Result<(), NotifyError>;
}

/// Writes events to the tracing log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &CrawlEvent) -> Result<(), NotifyError> {
        match event {
            CrawlEvent::BreakerOpened { .. }
            | CrawlEvent::AllDomainsOpen { .. }
            | CrawlEvent::RunInterrupted { .. } => tracing::warn!("{}", event),
            _ => tracing::info!("{}", event),
        }
        Ok(())
    }
}

/// Drops every event
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _event: &CrawlEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Fans an event out to several notifiers
///
/// Every notifier is tried; the first error is returned after all ran.
#[derive(Default)]
pub struct CompositeNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl CompositeNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn notify(&self, event: &CrawlEvent) -> Result<(), NotifyError> {
        let mut first_error = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(event).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builds the notifier described by the `[notify]` table
pub fn build_notifier(config: &NotifyConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if config.log {
        notifiers.push(Arc::new(LogNotifier));
    }
    if let Some(url) = &config.webhook_url {
        notifiers.push(Arc::new(WebhookNotifier::new(url)?));
    }

    Ok(match notifiers.len() {
        0 => Arc::new(NoopNotifier),
        1 => notifiers.remove(0),
        _ => Arc::new(CompositeNotifier::new(notifiers)),
    })
}
