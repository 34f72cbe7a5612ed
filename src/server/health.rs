use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use axum::{Router, routing::get, extract::State, response::IntoResponse, Json};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

use crate::server::lifecycle::StreamServer;

/// Struct for managing server health metrics.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Number of clients currently receiving the stream.
    pub active_clients: IntGauge,
    /// Connections accepted by the listener, before any checks.
    pub connections_accepted: IntCounter,
    /// Frame parts fully written to a client.
    pub frames_sent: IntCounter,
    /// Clients removed after a failed write.
    pub clients_evicted: IntCounter,
    /// Recorded failed authentication attempts.
    pub auth_failures: IntCounter,
    /// Rejected connections, labelled by HTTP status.
    pub rejected_connections: IntCounterVec,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMetrics {
    /// Creates a new instance of `HealthMetrics` and registers the metrics with Prometheus.
    pub fn new() -> Self {
        let registry = Registry::new();
        let active_clients = IntGauge::new("active_clients", "Clients receiving the stream")
            .expect("valid metric");
        let connections_accepted =
            IntCounter::new("connections_accepted_total", "Accepted TCP connections")
                .expect("valid metric");
        let frames_sent = IntCounter::new("frames_sent_total", "Frame parts delivered")
            .expect("valid metric");
        let clients_evicted =
            IntCounter::new("clients_evicted_total", "Clients dropped after a failed write")
                .expect("valid metric");
        let auth_failures =
            IntCounter::new("auth_failures_total", "Recorded failed authentication attempts")
                .expect("valid metric");
        let rejected_connections = IntCounterVec::new(
            Opts::new("rejected_connections_total", "Connections answered with an error status"),
            &["status"],
        )
        .expect("valid metric");

        registry.register(Box::new(active_clients.clone())).expect("unique metric");
        registry.register(Box::new(connections_accepted.clone())).expect("unique metric");
        registry.register(Box::new(frames_sent.clone())).expect("unique metric");
        registry.register(Box::new(clients_evicted.clone())).expect("unique metric");
        registry.register(Box::new(auth_failures.clone())).expect("unique metric");
        registry.register(Box::new(rejected_connections.clone())).expect("unique metric");

        Self {
            active_clients,
            connections_accepted,
            frames_sent,
            clients_evicted,
            auth_failures,
            rejected_connections,
            registry,
        }
    }

    /// Counts a connection answered with `status`.
    pub fn record_rejection(&self, status: u16) {
        self.rejected_connections
            .with_label_values(&[&status.to_string()])
            .inc();
    }

    /// Exposes the current state of all registered metrics in Prometheus-compatible format.
    pub fn expose_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Builds the router serving `/metrics` and `/status`.
pub fn router(server: Arc<StreamServer>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .with_state(server)
}

/// Serves the metrics router over plain HTTP on `port`.
///
/// Meant for a loopback or otherwise trusted network; the stream itself is
/// only ever served over TLS.
pub async fn serve_metrics_http(server: Arc<StreamServer>, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Metrics endpoint listening on {}", addr);

    if let Err(e) = axum::Server::bind(&addr)
        .serve(router(server).into_make_service())
        .await
    {
        error!("Metrics endpoint failed: {}", e);
    }
}

/// Handles the `/metrics` HTTP request and returns the current metrics data.
async fn metrics_handler(State(server): State<Arc<StreamServer>>) -> impl IntoResponse {
    server.state().metrics.expose_metrics()
}

/// Handles the `/status` HTTP request with a JSON summary of the server.
async fn status_handler(State(server): State<Arc<StreamServer>>) -> impl IntoResponse {
    Json(server.status())
}
