use std::net::SocketAddr;

use anyhow::Context;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and serve `/metrics` on `bind_addr`.
pub fn init(bind_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid metrics bind address '{bind_addr}'"))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;

    // Only the first installation wins; init is called once per process.
    let _ = PROM_HANDLE.set(handle);
    describe();

    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics_handler));

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "metrics endpoint listening");
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind metrics listener");
            }
        }
    });

    Ok(())
}

fn describe() {
    metrics::describe_counter!("store_ingested_points_total", "Points accepted by the store");
    metrics::describe_counter!("store_sink_errors_total", "Batches that failed after all retries");
    metrics::describe_counter!("store_out_of_retention_total", "Batches the store partially dropped as out of retention");
    metrics::describe_counter!("batch_rows_skipped_total", "Batch rows skipped for missing or malformed values");
    metrics::describe_counter!("stream_ticks_total", "Synthetic measurements generated");
    metrics::describe_counter!("forecast_runs_total", "Forecast trajectories generated");
    metrics::describe_counter!("forecast_write_failures_total", "Forecast samples the store did not accept");
    metrics::describe_histogram!("ingest_end_to_end_latency_seconds", "Time from receipt to store acknowledgement");
}

async fn metrics_handler() -> String {
    PROM_HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}
