use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fleet_functions::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{rounds::RoundTracker, samsara::SamsaraClient},
    store, telemetry,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing fleet-functions trigger server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    telemetry::describe_metrics();

    tracing::info!(backend = %config.storage_backend, "Initializing object store");
    let object_store = store::build_object_store(&config).expect("Failed to initialize object store");

    let samsara = Arc::new(SamsaraClient::new(
        config.samsara_base_url.clone(),
        config.samsara_api_key.clone(),
    ));
    let tracker = RoundTracker::new(object_store.clone(), samsara);

    let state = AppState::new(object_store, tracker, config.capture_offsets_ms.clone());

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/events/alert", post(routes::events::receive_alert))
        .route(
            "/api/v1/rounds/{asset_id}/{event_time}",
            get(routes::events::get_round),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024)); // alert payloads are tiny

    tracing::info!("Starting fleet-functions on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
