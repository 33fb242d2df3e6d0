use std::{io::Write, path::Path, sync::Arc};

use hems_client::{
    db,
    domain::{CONSUMPTION_POWER_KW, ENERGY_FLOW, PV_POWER_KW, SOURCE_BATCH, SOURCE_SIMULATION, TAG_SOURCE},
    store::{MemoryStore, TagPredicate, TimeRange},
    SharedStore, TimeSeriesStore,
};
use hems_service::{
    batch::{self, DataClass},
    config::{BatchConfig, ForecastConfig},
    forecast::HORIZON_STEPS,
    ForecastEngine,
};
use time::{macros::datetime, Duration, OffsetDateTime};

fn write_csv(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    path
}

fn batch_config(dir: &Path) -> BatchConfig {
    let mut cfg = BatchConfig::default();
    cfg.consumption.path = write_csv(
        dir,
        "consumption.csv",
        "timestamp,consumption_kwh\n\
         2021-03-01 00:00:00,1.0\n\
         2021-03-01 00:15:00,3.0\n\
         2021-03-01 00:30:00,bogus\n\
         2021-03-01 00:45:00,2.0\n",
    );
    cfg.generation.path = write_csv(
        dir,
        "generation.csv",
        "timestamp,generation_kwh\n\
         2021-03-01T00:00:00Z,4.0\n\
         2021-03-01T00:15:00Z,5.0\n\
         2021-03-01T00:45:00Z,6.0\n",
    );
    cfg.market_price.path = dir.join("missing_prices.csv");
    cfg
}

#[tokio::test]
async fn batch_files_land_in_window_and_pivot_into_wide_rows() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = batch_config(dir.path());
    let memory = Arc::new(MemoryStore::new());
    let store: SharedStore = memory.clone();

    // Quarter-hour aligned so windows and shifted rows line up exactly.
    let now = datetime!(2025-06-01 12:00:00 UTC);
    let report = batch::load_batches(store.clone(), &cfg, now).await;

    assert_eq!(report.written, 6);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.out_of_window_batches, 0);

    let points = memory.points().await;
    let lower = now - Duration::hours(cfg.lookback_hours as i64);
    assert!(points.iter().all(|p| p.ts >= lower && p.ts <= lower + Duration::minutes(45)));
    assert!(points.iter().all(|p| p.tags[TAG_SOURCE] == SOURCE_BATCH));

    // The first consumption and generation rows share a shifted timestamp.
    let flow = db::flow_timeseries(store.as_ref(), now, Duration::hours(25)).await.unwrap();
    assert!(!flow.is_empty());
    let first = &flow[0];
    assert_eq!(first[PV_POWER_KW], 4.0);
    assert_eq!(first[CONSUMPTION_POWER_KW], 1.0);
    assert!(first.keys().all(|k| !k.starts_with('_') && k != "result" && k != "table"));

    let timestamps: Vec<&str> = flow.iter().filter_map(|r| r["timestamp"].as_str()).collect();
    let mut sorted = timestamps.clone();
    sorted.sort();
    assert_eq!(timestamps, sorted);
}

#[tokio::test]
async fn single_class_backfill_shifts_only_that_file() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = batch_config(dir.path());
    let memory = Arc::new(MemoryStore::new());
    let now = datetime!(2025-06-01 12:00:00 UTC);

    let report = batch::load_class(memory.clone(), &cfg, DataClass::Generation, &cfg.generation.path, now)
        .await
        .unwrap();

    assert_eq!(report.written, 3);
    let mut ts: Vec<OffsetDateTime> = memory.points().await.iter().map(|p| p.ts).collect();
    ts.sort();
    assert_eq!(ts[0], datetime!(2025-05-31 12:00:00 UTC));
    assert_eq!(ts[2] - ts[0], Duration::minutes(45));
}

#[tokio::test]
async fn outlier_row_is_skipped_without_dropping_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = BatchConfig::default();
    cfg.consumption.path = write_csv(
        dir.path(),
        "consumption.csv",
        "timestamp,consumption_kwh\n\
         1800-01-01 00:00:00,9.0\n\
         2021-03-01 00:00:00,1.0\n\
         2021-03-01 00:15:00,2.0\n\
         2021-03-01 00:30:00,3.0\n",
    );
    let memory = Arc::new(MemoryStore::new());
    let now = datetime!(2025-06-01 12:00:00 UTC);

    let report = batch::load_class(memory.clone(), &cfg, DataClass::Consumption, &cfg.consumption.path, now)
        .await
        .unwrap();

    assert_eq!(report.written, 3);
    assert_eq!(report.skipped, 1);
    let mut stored: Vec<(OffsetDateTime, f64)> = memory
        .points()
        .await
        .iter()
        .map(|p| (p.ts, p.fields[CONSUMPTION_POWER_KW]))
        .collect();
    stored.sort_by_key(|(ts, _)| *ts);
    assert_eq!(
        stored,
        vec![
            (datetime!(2025-05-31 12:00:00 UTC), 1.0),
            (datetime!(2025-05-31 12:15:00 UTC), 2.0),
            (datetime!(2025-05-31 12:30:00 UTC), 3.0),
        ]
    );
}

#[tokio::test]
async fn empty_store_reads_are_empty_not_errors() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let now = OffsetDateTime::now_utc();

    assert!(db::latest_status(store.as_ref(), now).await.unwrap().is_empty());
    assert!(db::flow_timeseries(store.as_ref(), now, Duration::hours(24)).await.unwrap().is_empty());
    assert!(db::soc_forecast(store.as_ref(), now).await.unwrap().is_empty());
}

#[tokio::test]
async fn cleanup_removes_only_simulation_points() {
    let memory = Arc::new(MemoryStore::new());
    let store: SharedStore = memory.clone();
    let now = OffsetDateTime::now_utc();

    let point = |source: &str| {
        hems_client::domain::MeasurementPoint::new(ENERGY_FLOW, now - Duration::minutes(5))
            .tag(TAG_SOURCE, source)
            .field(PV_POWER_KW, 1.0)
    };
    store
        .write(&[point(SOURCE_BATCH), point(SOURCE_SIMULATION)])
        .await
        .unwrap();

    store
        .delete_range(
            ENERGY_FLOW,
            &TagPredicate::eq(TAG_SOURCE, SOURCE_SIMULATION),
            TimeRange::new(datetime!(2023-01-01 00:00:00 UTC), datetime!(2030-01-01 00:00:00 UTC)),
        )
        .await
        .unwrap();

    let remaining = memory.points().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].tags[TAG_SOURCE], SOURCE_BATCH);

    let status = db::latest_status(store.as_ref(), now).await.unwrap();
    assert_eq!(status[TAG_SOURCE], SOURCE_BATCH);
    assert_eq!(status[PV_POWER_KW], 1.0);
    assert!(status.contains_key("timestamp"));
}

#[tokio::test]
async fn forecast_is_persisted_and_read_back() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let engine = ForecastEngine::new(
        store.clone(),
        ForecastConfig {
            seed: Some(3),
            ..ForecastConfig::default()
        },
    )
    .unwrap();

    let now = datetime!(2025-06-01 10:07:00 UTC);
    let profile = engine.generate(now).await;
    assert_eq!(profile.persisted, HORIZON_STEPS);

    let read = db::soc_forecast(store.as_ref(), now).await.unwrap();
    assert_eq!(read.len(), HORIZON_STEPS);
    assert_eq!(read[0].timestamp, datetime!(2025-06-01 10:15:00 UTC));
    assert_eq!(read, profile.samples);
}
