//! Management HTTP server: health check, pool stats and Prometheus metrics

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pool::{PoolStats, WorkerPool};

/// Build the management router
pub fn router(pool: Arc<WorkerPool>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats).layer(cors))
        .route("/metrics", get(metrics))
        .fallback(not_found)
        .with_state(pool)
        .layer(TraceLayer::new_for_http())
}

/// GET /health
async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /stats
async fn stats(State(pool): State<Arc<WorkerPool>>) -> Json<PoolStats> {
    Json(pool.stats().await)
}

/// GET /metrics
#[cfg(feature = "metrics")]
async fn metrics() -> impl IntoResponse {
    match foreman_telemetry::metrics::gather() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(not(feature = "metrics"))]
async fn metrics() -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, "Metrics not enabled")
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Management server bound to its address
pub struct ManagementServer {
    listener: TcpListener,
    pool: Arc<WorkerPool>,
}

impl ManagementServer {
    /// Bind the listener; failing to bind is fatal for the master
    pub async fn bind(addr: &str, pool: Arc<WorkerPool>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, pool })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> std::io::Result<()> {
        info!("Management server listening on http://{}", self.local_addr()?);

        axum::serve(self.listener, router(self.pool))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PoolError, PoolResult};
    use crate::pool::{PoolConfig, WorkerId};
    use crate::process::{WorkerEvent, WorkerHandle, WorkerLauncher};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct NoLauncher;

    #[async_trait]
    impl WorkerLauncher for NoLauncher {
        async fn launch(
            &self,
            _id: WorkerId,
            _events: mpsc::UnboundedSender<WorkerEvent>,
        ) -> PoolResult<Box<dyn WorkerHandle>> {
            Err(PoolError::Provisioning("disabled".into()))
        }
    }

    fn app() -> Router {
        let config = PoolConfig {
            ceiling: 4,
            ..Default::default()
        };
        let (pool, _notices) = WorkerPool::new(config, Arc::new(NoLauncher));
        router(pool)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = app
            .oneshot(
                Request::get(uri)
                    .header("origin", "http://dashboard.local")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    #[tokio::test]
    async fn test_health_is_empty_ok() {
        let (status, _, body) = get(app(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_stats_json_with_cors() {
        let (status, headers, body) = get(app(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");

        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            stats,
            serde_json::json!({
                "status": "good",
                "load": "0.00%",
                "total": 0,
                "available": 4,
                "idle": 0,
                "cached": 0,
                "busy": 0,
                "maxConcurrent": 4,
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (status, _, _) = get(app(), "/workers").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_metrics_exposition() {
        foreman_telemetry::ForemanMetrics::new().unwrap();
        let (status, _, body) = get(app(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("foreman_pool_load"));
    }
}
