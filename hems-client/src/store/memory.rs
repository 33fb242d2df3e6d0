use std::collections::BTreeMap;

use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};
use tokio::sync::RwLock;

use super::{Aggregation, SeriesQuery, TagPredicate, TimeRange, TimeSeriesStore};
use crate::{
    domain::{pivot, MeasurementPoint, NarrowRow, SeriesRecord},
    error::{StoreError, StoreResult},
};

/// (measurement, field, tags): one independent series.
type SeriesKey = (String, String, BTreeMap<String, String>);

/// In-process store with the same query semantics as the HTTP store.
///
/// With a retention window configured, points older than `now - retention`
/// are dropped at write time and reported as `OutOfRetention`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    retention: Option<Duration>,
    points: RwLock<Vec<MeasurementPoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention: Some(retention),
            points: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }

    /// Copy of every stored point in write order.
    pub async fn points(&self) -> Vec<MeasurementPoint> {
        self.points.read().await.clone()
    }
}

fn series_key(row: &NarrowRow) -> SeriesKey {
    (row.measurement.clone(), row.field.clone(), row.tags.clone())
}

fn format_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

/// Window every series independently; output timestamps are window stops,
/// capped at the range stop.
fn aggregate_window(rows: Vec<NarrowRow>, agg: Aggregation, range: TimeRange) -> Vec<NarrowRow> {
    let every = agg.every.whole_nanoseconds().max(1);
    let mut windows: BTreeMap<(SeriesKey, i128), Vec<f64>> = BTreeMap::new();

    for row in rows {
        let start = row.ts.unix_timestamp_nanos().div_euclid(every) * every;
        windows.entry((series_key(&row), start)).or_default().push(row.value);
    }

    windows
        .into_iter()
        .filter_map(|(((measurement, field, tags), start), values)| {
            let value = agg.func.apply(&values)?;
            let stop = OffsetDateTime::from_unix_timestamp_nanos(start + every)
                .ok()?
                .min(range.stop);
            Some(NarrowRow {
                ts: stop,
                measurement,
                field,
                value,
                tags,
                meta: BTreeMap::new(),
            })
        })
        .collect()
}

/// Most recent row of every series; on equal timestamps the later write wins.
fn last_per_series(rows: Vec<NarrowRow>) -> Vec<NarrowRow> {
    let mut last: BTreeMap<SeriesKey, NarrowRow> = BTreeMap::new();
    for row in rows {
        match last.get(&series_key(&row)) {
            Some(existing) if existing.ts > row.ts => {}
            _ => {
                last.insert(series_key(&row), row);
            }
        }
    }
    last.into_values().collect()
}

fn annotate(rows: &mut [NarrowRow], range: TimeRange) {
    let mut tables: BTreeMap<SeriesKey, usize> = BTreeMap::new();
    for row in rows.iter() {
        let next = tables.len();
        tables.entry(series_key(row)).or_insert(next);
    }

    let start = format_ts(range.start);
    let stop = format_ts(range.stop);
    for row in rows.iter_mut() {
        let table = tables.get(&series_key(row)).copied().unwrap_or_default();
        row.meta.insert("result".to_string(), "_result".to_string());
        row.meta.insert("table".to_string(), table.to_string());
        row.meta.insert("_start".to_string(), start.clone());
        row.meta.insert("_stop".to_string(), stop.clone());
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write(&self, points: &[MeasurementPoint]) -> StoreResult<()> {
        for point in points {
            point.ensure_writable()?;
        }

        let cutoff = self.retention.map(|r| OffsetDateTime::now_utc() - r);
        let mut dropped = 0usize;
        let mut guard = self.points.write().await;
        for point in points {
            if cutoff.is_some_and(|c| point.ts < c) {
                dropped += 1;
                continue;
            }
            guard.push(point.clone());
        }

        if dropped > 0 {
            return Err(StoreError::OutOfRetention {
                message: format!("points beyond retention policy dropped={dropped}"),
            });
        }
        Ok(())
    }

    async fn query(&self, query: &SeriesQuery) -> StoreResult<Vec<SeriesRecord>> {
        let mut rows: Vec<NarrowRow> = {
            let guard = self.points.read().await;
            guard
                .iter()
                .filter(|p| {
                    p.measurement == query.measurement
                        && query.range.contains(p.ts)
                        && query.tags.matches(&p.tags)
                })
                .flat_map(|p| {
                    p.fields
                        .iter()
                        .filter(|(field, _)| query.wants_field(field))
                        .map(move |(field, value)| NarrowRow {
                            ts: p.ts,
                            measurement: p.measurement.clone(),
                            field: field.clone(),
                            value: *value,
                            tags: p.tags.clone(),
                            meta: BTreeMap::new(),
                        })
                })
                .collect()
        };

        if let Some(agg) = query.aggregation {
            rows = aggregate_window(rows, agg, query.range);
        }
        if query.last_only {
            rows = last_per_series(rows);
        }
        annotate(&mut rows, query.range);

        Ok(pivot(rows))
    }

    async fn delete_range(
        &self,
        measurement: &str,
        predicate: &TagPredicate,
        range: TimeRange,
    ) -> StoreResult<()> {
        let mut guard = self.points.write().await;
        let before = guard.len();
        guard.retain(|p| {
            !(p.measurement == measurement && range.contains(p.ts) && predicate.matches(&p.tags))
        });
        tracing::debug!(removed = before - guard.len(), measurement, "deleted range");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn point(ts: OffsetDateTime, source: &str, pv: f64, load: f64) -> MeasurementPoint {
        MeasurementPoint::new("energy_flow", ts)
            .tag("source", source)
            .field("pv_power_kw", pv)
            .field("consumption_power_kw", load)
    }

    fn day() -> TimeRange {
        TimeRange::new(
            datetime!(2025-01-01 00:00:00 UTC),
            datetime!(2025-01-02 00:00:00 UTC),
        )
    }

    #[tokio::test]
    async fn query_pivots_fields_into_one_record_per_timestamp() {
        let store = MemoryStore::new();
        let t1 = datetime!(2025-01-01 10:00:00 UTC);
        store.write(&[point(t1, "simulation", 3.0, 1.2)]).await.unwrap();

        let records = store.query(&SeriesQuery::new("energy_flow", day())).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ts, t1);
        assert_eq!(records[0].field("pv_power_kw"), Some(3.0));
        assert_eq!(records[0].field("consumption_power_kw"), Some(1.2));
        assert_eq!(records[0].meta.get("result").map(String::as_str), Some("_result"));
    }

    #[tokio::test]
    async fn range_stop_is_exclusive() {
        let store = MemoryStore::new();
        store
            .write(&[
                point(datetime!(2025-01-01 00:00:00 UTC), "simulation", 1.0, 1.0),
                point(datetime!(2025-01-02 00:00:00 UTC), "simulation", 2.0, 2.0),
            ])
            .await
            .unwrap();

        let records = store.query(&SeriesQuery::new("energy_flow", day())).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("pv_power_kw"), Some(1.0));
    }

    #[tokio::test]
    async fn empty_range_returns_no_records() {
        let store = MemoryStore::new();
        let records = store.query(&SeriesQuery::new("energy_flow", day())).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn window_mean_skips_empty_windows_and_stamps_window_stop() {
        let store = MemoryStore::new();
        store
            .write(&[
                point(datetime!(2025-01-01 10:01:00 UTC), "simulation", 2.0, 1.0),
                point(datetime!(2025-01-01 10:07:00 UTC), "simulation", 4.0, 3.0),
                // 10:15-10:30 is empty
                point(datetime!(2025-01-01 10:31:00 UTC), "simulation", 6.0, 0.5),
            ])
            .await
            .unwrap();

        let q = SeriesQuery::new("energy_flow", day()).aggregate(Aggregation::mean(Duration::minutes(15)));
        let records = store.query(&q).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ts, datetime!(2025-01-01 10:15:00 UTC));
        assert_eq!(records[0].field("pv_power_kw"), Some(3.0));
        assert_eq!(records[0].field("consumption_power_kw"), Some(2.0));
        assert_eq!(records[1].ts, datetime!(2025-01-01 10:45:00 UTC));
        assert_eq!(records[1].field("pv_power_kw"), Some(6.0));
    }

    #[tokio::test]
    async fn last_keeps_latest_value_per_series() {
        let store = MemoryStore::new();
        store
            .write(&[
                point(datetime!(2025-01-01 10:00:00 UTC), "simulation", 1.0, 1.0),
                point(datetime!(2025-01-01 10:00:15 UTC), "simulation", 2.0, 1.5),
            ])
            .await
            .unwrap();

        let q = SeriesQuery::new("energy_flow", day()).last();
        let records = store.query(&q).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ts, datetime!(2025-01-01 10:00:15 UTC));
        assert_eq!(records[0].field("pv_power_kw"), Some(2.0));
    }

    #[tokio::test]
    async fn field_and_tag_filters_apply() {
        let store = MemoryStore::new();
        let t1 = datetime!(2025-01-01 10:00:00 UTC);
        store
            .write(&[point(t1, "simulation", 1.0, 1.0), point(t1, "csv_init", 5.0, 0.2)])
            .await
            .unwrap();

        let q = SeriesQuery::new("energy_flow", day())
            .fields(["pv_power_kw"])
            .tag("source", "csv_init");
        let records = store.query(&q).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("pv_power_kw"), Some(5.0));
        assert_eq!(records[0].field("consumption_power_kw"), None);
    }

    #[tokio::test]
    async fn points_outside_retention_are_dropped_and_reported() {
        let store = MemoryStore::with_retention(Duration::days(30));
        let now = OffsetDateTime::now_utc();

        let res = store
            .write(&[
                point(now - Duration::days(365), "csv_init", 1.0, 1.0),
                point(now - Duration::hours(1), "csv_init", 2.0, 1.0),
            ])
            .await;

        assert!(matches!(res, Err(StoreError::OutOfRetention { .. })));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn invalid_point_rejects_whole_batch() {
        let store = MemoryStore::new();
        let t1 = datetime!(2025-01-01 10:00:00 UTC);

        let res = store
            .write(&[point(t1, "simulation", 1.0, 1.0), MeasurementPoint::new("energy_flow", t1)])
            .await;

        assert!(matches!(res, Err(StoreError::InvalidPoint(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn delete_range_removes_only_matching_tag() {
        let store = MemoryStore::new();
        let t1 = datetime!(2025-01-01 10:00:00 UTC);
        store
            .write(&[point(t1, "simulation", 1.0, 1.0), point(t1, "csv_init", 5.0, 0.2)])
            .await
            .unwrap();

        store
            .delete_range("energy_flow", &TagPredicate::eq("source", "simulation"), day())
            .await
            .unwrap();

        let remaining = store.points().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].tags.get("source").map(String::as_str), Some("csv_init"));
    }
}
