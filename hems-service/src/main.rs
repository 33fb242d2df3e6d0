use anyhow::Result;
use hems_service::{batch, config::AppConfig, metrics_server, observability};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store = cfg.store.connect()?;

    if cfg.batch.enabled {
        let report = batch::load_batches(store.clone(), &cfg.batch, OffsetDateTime::now_utc()).await;
        tracing::info!(
            written = report.written,
            skipped = report.skipped,
            failed_points = report.failed_points,
            "historical batch load complete"
        );
    }

    let cancel = CancellationToken::new();
    let streaming = if cfg.stream.enabled {
        let store = store.clone();
        let stream_cfg = cfg.stream.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            batch::run_streaming(store, &stream_cfg, cancel).await
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    cancel.cancel();

    if let Some(handle) = streaming {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "streaming ingestion failed"),
            Err(e) => tracing::error!(error = %e, "streaming task panicked"),
        }
    }

    Ok(())
}
