//! Liveness/readiness, status and Prometheus metrics endpoints.

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use once_cell::sync::OnceCell;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use equiverse_core::Aggregator;

static LIVE: AtomicBool = AtomicBool::new(true);
static READY: AtomicBool = AtomicBool::new(false);
static METER_PROVIDER: OnceCell<SdkMeterProvider> = OnceCell::new();

pub fn mark_ready() { READY.store(true, Ordering::SeqCst); }

/// Route the global meter into the default Prometheus registry.
pub fn init_metrics() -> Result<()> {
    METER_PROVIDER.get_or_try_init(|| -> Result<SdkMeterProvider> {
        let exporter = opentelemetry_prometheus::exporter().build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        opentelemetry::global::set_meter_provider(provider.clone());
        Ok(provider)
    })?;
    Ok(())
}

pub fn router(aggregator: Arc<Aggregator>) -> Router {
    Router::new()
        .route("/live", get(|| async { Json(serde_json::json!({ "live": LIVE.load(Ordering::SeqCst) })) }))
        .route("/ready", get(|| async { Json(serde_json::json!({ "ready": READY.load(Ordering::SeqCst) })) }))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(aggregator)
}

async fn status(State(aggregator): State<Arc<Aggregator>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "live": LIVE.load(Ordering::SeqCst),
        "ready": READY.load(Ordering::SeqCst),
        "rounds": aggregator.status(),
    }))
}

async fn metrics() -> impl IntoResponse {
    if METER_PROVIDER.get().is_none() {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized".to_string()).into_response();
    }
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}

pub async fn start_health_server(port: u16, aggregator: Arc<Aggregator>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(?addr, "health server listening");
    let app = router(aggregator);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            LIVE.store(false, Ordering::SeqCst);
            tracing::error!(error = ?e, "health server failed");
        }
    });
    Ok(())
}
