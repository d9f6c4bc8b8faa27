use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::router::RouteCounts;
use crate::ws::{self, HubState};

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub connections: ConnectionCounts,
    pub routed: RouteCounts,
    pub telemetry_buffers: Vec<BufferDepth>,
    pub reconnect: ReconnectAdvisory,
}

#[derive(Debug, Serialize)]
pub struct ConnectionCounts {
    pub devices: usize,
    pub clients: usize,
}

#[derive(Debug, Serialize)]
pub struct BufferDepth {
    pub device_id: String,
    pub depth: usize,
}

/// Guidance relayed to endpoints that implement their own reconnect loops.
#[derive(Debug, Serialize)]
pub struct ReconnectAdvisory {
    pub max_attempts: u32,
    pub interval_seconds: u64,
}

pub async fn health(State(state): State<HubState>) -> Json<HealthSnapshot> {
    let mut telemetry_buffers: Vec<BufferDepth> = state
        .registry
        .telemetry()
        .depths()
        .into_iter()
        .map(|(device_id, depth)| BufferDepth { device_id, depth })
        .collect();
    telemetry_buffers.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    Json(HealthSnapshot {
        status: "healthy",
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connections: ConnectionCounts {
            devices: state.registry.device_count(),
            clients: state.registry.client_count(),
        },
        routed: state.router.counters().snapshot(),
        telemetry_buffers,
        reconnect: ReconnectAdvisory {
            max_attempts: state.config.max_reconnect_attempts,
            interval_seconds: state.config.reconnect_interval.as_secs(),
        },
    })
}

pub async fn metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// The full HTTP surface: duplex bind points, health probe, and optionally
/// the Prometheus exposition endpoint.
pub fn app(state: HubState, prometheus: Option<PrometheusHandle>) -> axum::Router {
    let mut router = axum::Router::new()
        .route("/device/{id}", get(ws::device_ws))
        .route("/client/{id}", get(ws::client_ws))
        .route("/health", get(health))
        .with_state(state);

    if let Some(handle) = prometheus {
        router = router.merge(
            axum::Router::new()
                .route("/metrics", get(metrics))
                .with_state(handle),
        );
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn health_reports_counts_and_uptime() {
        let state = HubState::new(Config::default());
        let Json(snapshot) = health(State(state)).await;
        assert_eq!(snapshot.status, "healthy");
        assert_eq!(snapshot.connections.devices, 0);
        assert_eq!(snapshot.connections.clients, 0);
        assert_eq!(snapshot.reconnect.max_attempts, 5);
        assert!(snapshot.telemetry_buffers.is_empty());
    }
}
