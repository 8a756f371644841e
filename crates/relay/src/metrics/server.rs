//! Stats exposition endpoint
//!
//! Serves the relay counters in Prometheus text format on
//! `GET /metrics`. Queue depth gauges are sampled at scrape time from
//! receiver handles onto each pipeline's queues; any other path or method
//! returns 404.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use cairn_types::Metric;

use super::{MetricsError, RelayMetrics};

/// Receiver handles used only to observe queue depths. Holding receiver
/// clones does not keep a queue alive: disconnection is still driven by
/// the producer side.
#[derive(Clone)]
pub struct QueueDepths {
    pub influx_json: flume::Receiver<Vec<u8>>,
    pub prometheus: flume::Receiver<Vec<u8>>,
    pub filter: flume::Receiver<Metric>,
    pub output: flume::Receiver<Metric>,
    pub dead_letter: flume::Receiver<String>,
}

#[derive(Clone)]
struct StatsState {
    metrics: Arc<RelayMetrics>,
    registry: Arc<RwLock<Registry>>,
    queues: Arc<Vec<QueueDepths>>,
}

/// Serve the stats endpoint until the process exits.
pub async fn serve_stats(
    address: &str,
    port: u16,
    metrics: Arc<RelayMetrics>,
    registry: Arc<RwLock<Registry>>,
    queues: Vec<QueueDepths>,
) -> Result<(), MetricsError> {
    let bind = format!("{}:{}", address, port);
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|source| MetricsError::Bind {
            address: bind.clone(),
            source,
        })?;
    info!(address = %bind, "stats listener started");

    let state = StatsState {
        metrics,
        registry,
        queues: Arc::new(queues),
    };
    let app = Router::new()
        .route("/metrics", any(metrics_handler))
        .with_state(state);

    axum::serve(listener, app).await.map_err(MetricsError::Serve)
}

async fn metrics_handler(State(state): State<StatsState>, method: Method) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }
    debug!("stats endpoint scraped");

    state.metrics.refresh_gauges(&state.queues);

    let mut body = String::new();
    let registry = state.registry.read();
    match prometheus_client::encoding::text::encode(&mut body, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
