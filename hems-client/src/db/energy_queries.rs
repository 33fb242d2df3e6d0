use serde_json::{Map, Number, Value};
use time::{format_description::well_known::Rfc3339, Date, Duration, OffsetDateTime};

use crate::{
    domain::{ForecastSample, SeriesRecord, ENERGY_FLOW, FORECAST_SOC, GENERATED_AT, MARKET_PRICES, TAG_RUN_ID},
    error::StoreResult,
    store::{Aggregation, SeriesQuery, TimeRange, TimeSeriesStore},
};

/// A sanitized record as handed to API consumers.
pub type JsonRecord = Map<String, Value>;

pub const STATUS_LOOKBACK: Duration = Duration::hours(1);
pub const FLOW_LOOKBACK: Duration = Duration::hours(24);
pub const AGGREGATION_WINDOW: Duration = Duration::minutes(15);
pub const FORECAST_LOOKBACK: Duration = Duration::hours(1);
/// Covers a full 24h horizon starting up to one step after `now`.
pub const FORECAST_LOOKAHEAD: Duration = Duration::hours(25);

fn is_internal(key: &str) -> bool {
    key.starts_with('_') || key == "result" || key == "table"
}

/// Strip store bookkeeping and expose the time as an RFC 3339 `timestamp`.
pub fn clean_record(record: &SeriesRecord) -> JsonRecord {
    let mut clean = Map::new();
    let ts = record
        .ts
        .format(&Rfc3339)
        .unwrap_or_else(|_| record.ts.to_string());
    clean.insert("timestamp".to_string(), Value::String(ts));

    for (key, value) in record.tags.iter().filter(|(k, _)| !is_internal(k)) {
        clean.insert(key.clone(), Value::String(value.clone()));
    }
    for (key, value) in record.fields.iter().filter(|(k, _)| !is_internal(k)) {
        if let Some(n) = Number::from_f64(*value) {
            clean.insert(key.clone(), Value::Number(n));
        }
    }

    clean
}

/// Most recent energy-flow record of the last hour, or an empty map.
pub async fn latest_status(store: &dyn TimeSeriesStore, now: OffsetDateTime) -> StoreResult<JsonRecord> {
    let query = SeriesQuery::new(ENERGY_FLOW, TimeRange::lookback(now, STATUS_LOOKBACK)).last();
    let records = store.query(&query).await?;

    Ok(records
        .iter()
        .max_by_key(|r| r.ts)
        .map(clean_record)
        .unwrap_or_default())
}

async fn windowed(
    store: &dyn TimeSeriesStore,
    measurement: &str,
    now: OffsetDateTime,
    lookback: Duration,
) -> StoreResult<Vec<JsonRecord>> {
    let query = SeriesQuery::new(measurement, TimeRange::lookback(now, lookback))
        .aggregate(Aggregation::mean(AGGREGATION_WINDOW));
    let mut records = store.query(&query).await?;
    records.sort_by_key(|r| r.ts);

    Ok(records.iter().map(clean_record).collect())
}

/// 15-minute means of energy flow over `[now - lookback, now)`, oldest first.
pub async fn flow_timeseries(
    store: &dyn TimeSeriesStore,
    now: OffsetDateTime,
    lookback: Duration,
) -> StoreResult<Vec<JsonRecord>> {
    windowed(store, ENERGY_FLOW, now, lookback).await
}

/// 15-minute means of market prices over `[now - lookback, now)`, oldest first.
pub async fn price_timeseries(
    store: &dyn TimeSeriesStore,
    now: OffsetDateTime,
    lookback: Duration,
) -> StoreResult<Vec<JsonRecord>> {
    windowed(store, MARKET_PRICES, now, lookback).await
}

/// Points stored per field and series in each UTC day of `[start_day, start_day + days)`.
///
/// Counts are reported at the end of each day window.
pub async fn daily_counts(
    store: &dyn TimeSeriesStore,
    measurement: &str,
    start_day: Date,
    days: u16,
) -> StoreResult<Vec<JsonRecord>> {
    let start = start_day.midnight().assume_utc();
    let range = TimeRange::new(start, start + Duration::days(i64::from(days.max(1))));
    let query = SeriesQuery::new(measurement, range).aggregate(Aggregation::count(Duration::days(1)));
    let mut records = store.query(&query).await?;
    records.sort_by_key(|r| r.ts);

    Ok(records.iter().map(clean_record).collect())
}

/// Run id of the most recently generated trajectory among `records`.
fn latest_run(records: &[SeriesRecord]) -> Option<&str> {
    records
        .iter()
        .filter_map(|r| Some((r.field(GENERATED_AT)?, r.tag(TAG_RUN_ID)?)))
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, run)| run)
}

/// Materialized forecast samples around `now`.
///
/// This is a plain range read; trajectories were computed and written
/// beforehand. When several runs overlap only the newest one is returned.
pub async fn soc_forecast(store: &dyn TimeSeriesStore, now: OffsetDateTime) -> StoreResult<Vec<ForecastSample>> {
    let range = TimeRange::new(now - FORECAST_LOOKBACK, now + FORECAST_LOOKAHEAD);
    let records = store.query(&SeriesQuery::new(FORECAST_SOC, range)).await?;

    let run = latest_run(&records);
    let mut samples: Vec<ForecastSample> = records
        .iter()
        .filter(|r| run.is_none() || r.tag(TAG_RUN_ID) == run)
        .filter_map(ForecastSample::from_record)
        .collect();
    samples.sort_by_key(|s| s.timestamp);

    Ok(samples)
}
