//! HTTP health and metrics surface
//!
//! A small Axum service exposing the consumer's health snapshot and the
//! pipeline counters as JSON, served next to the consumer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, Router},
};
use serde::Serialize;
use tracing::{error, info};

use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::queue::{ConsumerHealth, EvaluateConsumer, EvaluateHandler};

/// Source of the consumer health snapshot shown on `/health`
pub trait HealthSource: Send + Sync {
    /// Current health snapshot
    fn health(&self) -> ConsumerHealth;
}

impl<H: EvaluateHandler> HealthSource for EvaluateConsumer<H> {
    fn health(&self) -> ConsumerHealth {
        EvaluateConsumer::health(self)
    }
}

/// Shared state behind the HTTP handlers
#[derive(Clone)]
pub struct PipelineService {
    consumer: Arc<dyn HealthSource>,
    metrics: Arc<PipelineMetrics>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    consumer: ConsumerHealth,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    metrics: MetricsSnapshot,
}

impl PipelineService {
    /// Service over the given consumer and metrics
    pub fn new(consumer: Arc<dyn HealthSource>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { consumer, metrics }
    }

    /// The Axum router for this service
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(Self::health_handler))
            .route("/metrics", get(Self::metrics_handler))
            .with_state(self.clone())
    }

    async fn health_handler(
        State(service): State<PipelineService>,
    ) -> (StatusCode, Json<HealthResponse>) {
        let consumer = service.consumer.health();
        let status_code = if consumer.is_healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let body = HealthResponse {
            status: if consumer.is_healthy {
                "healthy"
            } else {
                "degraded"
            },
            version: env!("CARGO_PKG_VERSION"),
            consumer,
        };
        (status_code, Json(body))
    }

    async fn metrics_handler(State(service): State<PipelineService>) -> Json<MetricsResponse> {
        Json(MetricsResponse {
            metrics: service.metrics.snapshot(),
        })
    }

    /// Bind and serve until the listener fails
    pub async fn serve(self, addr: SocketAddr) -> crate::Result<()> {
        let app = self.router();
        info!(%addr, "starting pipeline service");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| crate::PipelineError::Internal(format!("bind failed: {e}")))?;

        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "service error");
            return Err(crate::PipelineError::Internal(format!("serve failed: {e}")));
        }
        Ok(())
    }
}
