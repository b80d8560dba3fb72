//! Output module: where fetched pages go, and how progress is reported
//!
//! This module handles:
//! - The `Ingest` capability invoked once per fetched page
//! - JSONL, CSV and discard sinks selected by configuration
//! - Printing store statistics and end-of-run summaries

mod sinks;
pub mod stats;

pub use sinks::{CsvSink, JsonlSink, NullSink};
pub use stats::{load_statistics, print_run_summary, print_statistics, TargetStatistics};

use crate::config::{OutputConfig, OutputKind};
use crate::crawler::Page;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by ingest sinks
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Sink write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Sink lock poisoned")]
    LockPoisoned,

    #[error("Output path missing for {0} sink")]
    MissingPath(&'static str),
}

/// Receives every successfully fetched page
///
/// The orchestrator only looks at success or failure; a failure is logged as
/// a run warning and never fails the item.
#[async_trait]
pub trait Ingest: Send + Sync {
    async fn ingest(&self, page: &Page) -> Result<(), IngestError>;
}

/// Builds the sink a target's `[output]` table asks for
///
/// # Arguments
///
/// * `config` - The target's output settings
///
/// # Returns
///
/// The sink shared by every worker of the target. File sinks create their
/// file (and parent directories) here, so a bad path fails before the run.
pub fn build_sink(config: &OutputConfig) -> Result<Arc<dyn Ingest>, IngestError> {
    let path = config.path.as_deref().map(Path::new);
    let sink: Arc<dyn Ingest> = match config.kind {
        OutputKind::None => Arc::new(NullSink),
        OutputKind::Jsonl => Arc::new(JsonlSink::create(
            path.ok_or(IngestError::MissingPath("jsonl"))?,
        )?),
        OutputKind::Csv => Arc::new(CsvSink::create(
            path.ok_or(IngestError::MissingPath("csv"))?,
        )?),
    };
    Ok(sink)
}
