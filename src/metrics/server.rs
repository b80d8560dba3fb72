//! HTTP endpoint for crawl metrics
//!
//! - `GET /metrics`: process counters plus live item counts per target
//! - `GET /health`: liveness, version and uptime

use crate::metrics::{CrawlMetrics, MetricsSnapshot};
use crate::store::{JobStore, StatusCounts, StoreResult};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Shared state of the metrics endpoint
#[derive(Clone)]
pub struct MetricsState {
    pub metrics: Arc<CrawlMetrics>,
    pub store: Arc<dyn JobStore>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    snapshot: MetricsSnapshot,
    /// Item counts of each target's active run, read from the job store
    items: BTreeMap<String, StatusCounts>,
}

pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<MetricsState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.metrics.uptime().as_secs(),
    })
}

async fn metrics(
    State(state): State<MetricsState>,
) -> Result<Json<MetricsResponse>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    let targets: Vec<String> = snapshot.targets.keys().cloned().collect();
    let store = Arc::clone(&state.store);

    let items = tokio::task::spawn_blocking(move || -> StoreResult<BTreeMap<String, StatusCounts>> {
        targets
            .into_iter()
            .map(|target| store.snapshot_counts(&target).map(|counts| (target, counts)))
            .collect()
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| {
        tracing::warn!("Metrics could not read the job store: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;

    Ok(Json(MetricsResponse { snapshot, items }))
}

/// Serves the endpoint on `listener` until `shutdown` carries `true`
///
/// # Arguments
///
/// * `listener` - An already bound listener; bind to port 0 to let the OS pick
/// * `state` - Metrics and job store to report on
/// * `shutdown` - Stops the server gracefully once it carries `true`
pub async fn serve(
    listener: TcpListener,
    state: MetricsState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    tracing::info!("Metrics endpoint listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            // a dropped sender also ends the server
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteJobStore;
    use std::time::Duration;

    async fn start(state: MetricsState) -> (String, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(listener, state, rx));
        (base, tx)
    }

    fn state() -> MetricsState {
        let store = Arc::new(SqliteJobStore::new_in_memory().unwrap());
        store.begin_run("shop", "h", false).unwrap();
        store.enqueue("shop", "https://a.test/1", 0).unwrap();
        store.enqueue("shop", "https://a.test/2", 0).unwrap();
        MetricsState {
            metrics: Arc::new(CrawlMetrics::new()),
            store,
        }
    }

    #[tokio::test]
    async fn test_health() {
        let (base, _tx) = start(state()).await;

        let response = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_metrics_include_store_counts() {
        let state = state();
        state.metrics.run_started("shop", 1);
        let (base, _tx) = start(state).await;

        let body: serde_json::Value = reqwest::get(format!("{}/metrics", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["items_scraped"], 0);
        assert_eq!(body["targets"]["shop"]["running"], true);
        assert_eq!(body["items"]["shop"]["pending"], 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, state(), rx));

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
