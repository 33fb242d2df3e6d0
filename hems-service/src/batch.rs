use std::{fmt, path::Path, str::FromStr, sync::Arc, time::Duration};

use hems_client::{domain::MeasurementPoint, SharedStore};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{BatchConfig, CsvClassConfig, StreamConfig},
    pipeline::{Pipeline, PipelineError, SinkReport, Transform},
    sinks::StoreSink,
    sources::{EnergyCsvFileSource, RetentionAlignedSource, SyntheticEnergySource},
    transform::PointValidation,
};

/// The historical data classes loaded at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataClass {
    Consumption,
    Generation,
    MarketPrice,
}

impl DataClass {
    pub const ALL: [DataClass; 3] = [DataClass::Consumption, DataClass::Generation, DataClass::MarketPrice];

    pub fn name(self) -> &'static str {
        match self {
            DataClass::Consumption => "consumption",
            DataClass::Generation => "generation",
            DataClass::MarketPrice => "market_price",
        }
    }

    pub fn config(self, cfg: &BatchConfig) -> &CsvClassConfig {
        match self {
            DataClass::Consumption => &cfg.consumption,
            DataClass::Generation => &cfg.generation,
            DataClass::MarketPrice => &cfg.market_price,
        }
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consumption" => Ok(DataClass::Consumption),
            "generation" => Ok(DataClass::Generation),
            "market_price" | "market_prices" => Ok(DataClass::MarketPrice),
            other => Err(format!(
                "unknown data class '{other}' (expected consumption, generation or market_price)"
            )),
        }
    }
}

/// Load one CSV file of `class`, shifted so its oldest row lands at
/// `now - lookback_hours`.
pub async fn load_class(
    store: SharedStore,
    cfg: &BatchConfig,
    class: DataClass,
    path: &Path,
    now: OffsetDateTime,
) -> Result<SinkReport, PipelineError> {
    let mapping = class.config(cfg).mapping.clone();
    let lookback = time::Duration::hours(cfg.lookback_hours as i64);

    let validation: Arc<dyn Transform<MeasurementPoint, MeasurementPoint> + Send + Sync> = Arc::new(PointValidation);
    let pipeline = Pipeline {
        source: RetentionAlignedSource::new(EnergyCsvFileSource::new(path, mapping), now, lookback),
        transforms: vec![validation],
        sink: StoreSink::new(
            store,
            cfg.batch_size,
            cfg.max_retries,
            Duration::from_millis(cfg.retry_backoff_ms),
        )
        .with_label(class.name()),
    };

    let report = pipeline.run().await?;
    tracing::info!(
        class = %class,
        path = %path.display(),
        written = report.written,
        skipped = report.skipped,
        failed_points = report.failed_points,
        out_of_window_batches = report.out_of_window_batches,
        "batch load finished"
    );
    Ok(report)
}

/// Load every configured data class whose file exists.
pub async fn load_batches(store: SharedStore, cfg: &BatchConfig, now: OffsetDateTime) -> SinkReport {
    let mut total = SinkReport::default();

    for class in DataClass::ALL {
        let path = &class.config(cfg).path;
        if !path.exists() {
            tracing::info!(class = %class, path = %path.display(), "batch file not found, skipping");
            continue;
        }

        match load_class(store.clone(), cfg, class, path, now).await {
            Ok(report) => total.merge(&report),
            Err(e) => tracing::error!(class = %class, error = %e, "batch load failed"),
        }
    }

    total
}

/// Write one synthetic point per tick until `cancel` fires. Each point is
/// written on its own; a failed write is logged and the next tick tries again.
pub async fn run_streaming(
    store: SharedStore,
    cfg: &StreamConfig,
    cancel: CancellationToken,
) -> Result<SinkReport, PipelineError> {
    let pipeline: Pipeline<_, MeasurementPoint, _> = Pipeline {
        source: SyntheticEnergySource::new(cfg, cancel)?,
        transforms: Vec::new(),
        sink: StoreSink::new(store, 1, 0, Duration::ZERO).with_label(cfg.source_tag.as_str()),
    };

    tracing::info!(interval_secs = cfg.interval_secs, source = %cfg.source_tag, "streaming ingestion started");
    let report = pipeline.run().await?;
    tracing::info!(written = report.written, failed = report.failed_points, "streaming ingestion stopped");
    Ok(report)
}
