//! Live pool metrics over HTTP while a batch runs.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use offload_pool::{PoolSnapshot, Scheduler};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    running: bool,
}

pub async fn health(State(pool): State<Scheduler>) -> Json<HealthResponse> {
    let running = pool.is_running();
    Json(HealthResponse {
        status: if running { "ok" } else { "stopped" },
        running,
    })
}

pub async fn metrics(State(pool): State<Scheduler>) -> Result<Json<PoolSnapshot>, StatusCode> {
    pool.snapshot()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

pub fn router(pool: Scheduler) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(pool)
}

/// Bind `0.0.0.0:port` and serve in the background.
pub async fn spawn(pool: Scheduler, port: u16) -> Result<JoinHandle<()>> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    info!("Metrics listening on http://localhost:{port}/metrics");
    let app = router(pool);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "metrics server stopped");
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use offload_pool::{InProcessFactory, PoolConfig};

    use super::*;

    #[tokio::test]
    async fn handlers_report_pool_state() {
        let pool = Scheduler::start(PoolConfig::default(), Arc::new(InProcessFactory::default()))
            .await
            .unwrap();

        let Json(snapshot) = metrics(State(pool.clone())).await.unwrap();
        assert_eq!(snapshot.units.len(), 1);
        let Json(health_ok) = health(State(pool.clone())).await;
        assert!(health_ok.running);

        pool.shutdown().await.unwrap();
        let err = metrics(State(pool.clone())).await.unwrap_err();
        assert_eq!(err, StatusCode::SERVICE_UNAVAILABLE);
    }
}
