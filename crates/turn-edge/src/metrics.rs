//! Metrics collection and export

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
    routing::{get, Router},
};
use prometheus::{Counter, Encoder, Gauge, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::demux::Protocol;
use crate::lifecycle::{wait_for_shutdown, ServiceState};

/// Front-end metrics
pub struct EdgeMetrics {
    connections: IntCounterVec,
    auth_attempts: IntCounterVec,
    proxy_errors: Counter,
    state: Gauge,
    registry: Registry,
}

impl EdgeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections = IntCounterVec::new(
            Opts::new("turn_edge_connections_total", "TCP connections by classified protocol"),
            &["protocol"],
        )?;
        registry.register(Box::new(connections.clone()))?;

        let auth_attempts = IntCounterVec::new(
            Opts::new("turn_edge_auth_attempts_total", "Authentication attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(auth_attempts.clone()))?;

        let proxy_errors = Counter::with_opts(Opts::new(
            "turn_edge_proxy_errors_total",
            "HTTP requests that could not be forwarded upstream",
        ))?;
        registry.register(Box::new(proxy_errors.clone()))?;

        let state = Gauge::with_opts(Opts::new(
            "turn_edge_state",
            "Service state (0 starting, 1 running, 2 shutting down, 3 stopped)",
        ))?;
        registry.register(Box::new(state.clone()))?;

        Ok(Self {
            connections,
            auth_attempts,
            proxy_errors,
            state,
            registry,
        })
    }

    pub fn record_connection(&self, protocol: Protocol) {
        self.connections.with_label_values(&[protocol.as_str()]).inc();
    }

    pub fn record_auth(&self, accepted: bool) {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.auth_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn record_proxy_error(&self) {
        self.proxy_errors.inc();
    }

    pub fn set_state(&self, state: ServiceState) {
        self.state.set(state as u8 as f64);
    }

    pub fn connections(&self, protocol: Protocol) -> u64 {
        self.connections.with_label_values(&[protocol.as_str()]).get()
    }

    pub fn auth_attempts(&self, accepted: bool) -> u64 {
        let outcome = if accepted { "accepted" } else { "rejected" };
        self.auth_attempts.with_label_values(&[outcome]).get()
    }

    pub fn proxy_errors(&self) -> f64 {
        self.proxy_errors.get()
    }

    /// Export Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}

type MetricsState = (Arc<EdgeMetrics>, watch::Receiver<ServiceState>);

/// Router serving `/health` and `/metrics`.
pub fn router(metrics: Arc<EdgeMetrics>, state: watch::Receiver<ServiceState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state((metrics, state))
}

/// Serve the metrics router on `listener` until `shutdown` flips to true.
pub async fn serve(listener: TcpListener, router: Router, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("HTTP server for health/metrics listening on {}", addr);
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await
}

/// Health check handler, 200 only while running
async fn health_handler(State((_, state)): State<MetricsState>) -> StatusCode {
    if *state.borrow() == ServiceState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Metrics export handler
async fn metrics_handler(State((metrics, _)): State<MetricsState>) -> Result<Response<String>, StatusCode> {
    match metrics.export() {
        Ok(body) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
