//! Health endpoint and shared health state.
//!
//! `/health` reports the §-contract body: overall status, uptime, and
//! per-dependency status with observed latency. `/live` always answers 200
//! while the process runs; `/ready` answers 200 unless the pipeline is
//! unhealthy. A destination quarantined for a table degrades the status; it
//! does not make the pipeline unhealthy.

use crate::metrics::SharedMetrics;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use cassflow_core::Destination;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::info;

/// Overall and per-dependency status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One probed dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub status: HealthStatus,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Mutable health state the orchestrator maintains.
#[derive(Debug)]
pub struct HealthState {
    started_at: Instant,
    dependencies: HashMap<String, DependencyHealth>,
    quarantined: HashSet<(Destination, String)>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            dependencies: HashMap::new(),
            quarantined: HashSet::new(),
        }
    }
}

impl HealthState {
    pub fn new() -> SharedHealthState {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn set_dependency(&mut self, name: impl Into<String>, health: DependencyHealth) {
        self.dependencies.insert(name.into(), health);
    }

    pub fn set_quarantined(&mut self, destination: Destination, table: impl Into<String>) {
        self.quarantined.insert((destination, table.into()));
    }

    pub fn clear_quarantined(&mut self, destination: Destination, table: &str) {
        self.quarantined
            .remove(&(destination, table.to_string()));
    }

    pub fn is_quarantined(&self, destination: Destination, table: &str) -> bool {
        self.quarantined
            .contains(&(destination, table.to_string()))
    }

    pub fn quarantined(&self) -> impl Iterator<Item = &(Destination, String)> {
        self.quarantined.iter()
    }

    /// Overall status. Every dependency down means unhealthy; any single
    /// dependency down or any quarantine latched means degraded.
    pub fn status(&self) -> HealthStatus {
        let total = self.dependencies.len();
        let down = self
            .dependencies
            .values()
            .filter(|d| d.status != HealthStatus::Healthy)
            .count();

        if total > 0 && down == total {
            return HealthStatus::Unhealthy;
        }
        if down > 0 || !self.quarantined.is_empty() {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// Shared health state handle.
pub type SharedHealthState = Arc<RwLock<HealthState>>;

/// Body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub uptime_seconds: f64,
    pub dependencies: HashMap<String, DependencyHealth>,
    /// `(destination, table)` pairs latched off after failed DDL.
    pub quarantined: Vec<String>,
}

#[derive(Clone)]
struct AppState {
    health: SharedHealthState,
    metrics: SharedMetrics,
}

/// Serve `/health`, `/live`, `/ready`, and `/metrics` on one listener.
pub async fn serve(
    bind: &str,
    health: SharedHealthState,
    metrics: SharedMetrics,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let state = AppState { health, metrics };
    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/live", get(live_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "observability listener started");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.read().await;
    let status = health.status();
    let body = HealthResponse {
        status,
        uptime_seconds: health.uptime_seconds(),
        dependencies: health.dependencies.clone(),
        quarantined: health
            .quarantined()
            .map(|(d, t)| format!("{}:{}", d.label(), t))
            .collect(),
    };
    let code = match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(body))
}

async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.health.read().await.status() {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render().await,
    )
}
