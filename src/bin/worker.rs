use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_functions::{
    config::AppConfig,
    services::{
        media::HttpMediaFetcher, notify::WebhookNotifier, rounds::RoundTracker,
        samsara::SamsaraClient, slug_bug::SlugBugAction, vision::WorkersAiClient,
    },
    store, telemetry,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting retrieval round worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        telemetry::describe_metrics();
        tracing::info!(%addr, "Serving worker metrics");
    }

    tracing::info!(backend = %config.storage_backend, "Initializing object store");
    let object_store = store::build_object_store(&config).expect("Failed to initialize object store");

    tracing::info!("Initializing services");
    let samsara = Arc::new(SamsaraClient::new(
        config.samsara_base_url.clone(),
        config.samsara_api_key.clone(),
    ));
    let tracker = RoundTracker::new(object_store.clone(), samsara.clone());

    let action = SlugBugAction::new(
        Arc::new(HttpMediaFetcher::new()),
        Arc::new(WorkersAiClient::new(
            config.cf_account_id.clone(),
            config.cf_api_token.clone(),
        )),
        samsara,
        Arc::new(WebhookNotifier::new(config.notify_webhook_url.clone())),
        object_store.clone(),
    );

    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    tracing::info!(
        poll_interval_secs = config.poll_interval_secs,
        run_once = config.worker_run_once,
        "Worker ready, starting check loop"
    );

    loop {
        match tracker.check(&action).await {
            Ok(summary) => {
                tracing::info!(
                    became_available = summary.became_available,
                    resumed = summary.resumed,
                    completed = summary.completed,
                    action_failures = summary.action_failures,
                    abandoned = summary.abandoned,
                    conflicts = summary.conflicts,
                    "Check sweep finished"
                );
            }
            Err(e) => {
                // Storage faults abort the sweep; the next one retries.
                tracing::error!(error = %e, "Check sweep failed");
                if config.worker_run_once {
                    std::process::exit(1);
                }
            }
        }

        if config.worker_run_once {
            break;
        }
        sleep(poll_interval).await;
    }
}
