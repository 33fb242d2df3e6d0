use std::time::{Duration, SystemTime};

use futures::StreamExt;
use hems_client::{domain::MeasurementPoint, SharedStore, StoreError};

use crate::pipeline::{Envelope, PipelineError, Sink, SinkReport};

/// Buffers points and writes them to the store one batch per call.
///
/// Transient store errors are retried with linear backoff. A batch that still
/// fails is logged and counted and the run continues with the next batch.
pub struct StoreSink {
    store: SharedStore,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    label: String,
}

impl StoreSink {
    pub fn new(store: SharedStore, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
            label: "store".to_string(),
        }
    }

    /// Name used in logs and metric labels, e.g. the data class.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    async fn flush_batch(&self, batch: &[Envelope<MeasurementPoint>], report: &mut SinkReport) {
        if batch.is_empty() {
            return;
        }

        let points: Vec<MeasurementPoint> = batch.iter().map(|env| env.payload.clone()).collect();

        let mut attempt: u32 = 0;
        loop {
            match self.store.write(&points).await {
                Ok(()) => {
                    report.written += points.len();
                    metrics::counter!("store_ingested_points_total", "class" => self.label.clone())
                        .increment(points.len() as u64);

                    if let Some(min_received) = batch.iter().map(|e| e.received_at).min() {
                        if let Ok(dur) = SystemTime::now().duration_since(min_received) {
                            metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
                        }
                    }
                    return;
                }
                Err(StoreError::OutOfRetention { message }) => {
                    tracing::warn!(
                        class = %self.label,
                        points = points.len(),
                        %message,
                        "store dropped points outside its retention window"
                    );
                    metrics::counter!("store_out_of_retention_total", "class" => self.label.clone()).increment(1);
                    report.out_of_window_batches += 1;
                    return;
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        class = %self.label,
                        error = %e,
                        attempt,
                        "store write failed, retrying"
                    );
                    metrics::counter!("store_write_retry_total", "class" => self.label.clone()).increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(
                        class = %self.label,
                        error = %e,
                        points = points.len(),
                        "store write failed, dropping batch"
                    );
                    metrics::counter!("store_sink_errors_total", "class" => self.label.clone()).increment(1);
                    report.failed_batches += 1;
                    report.failed_points += points.len();
                    return;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Sink<MeasurementPoint> for StoreSink {
    async fn run<S>(&self, mut input: S) -> Result<SinkReport, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<MeasurementPoint>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut report = SinkReport::default();
        let mut buffer: Vec<Envelope<MeasurementPoint>> = Vec::with_capacity(self.batch_size);

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) if e.is_row_level() => {
                    report.skipped += 1;
                    tracing::debug!(class = %self.label, error = %e, "row skipped");
                    continue;
                }
                Err(e) => {
                    report.source_errors += 1;
                    tracing::error!(class = %self.label, error = %e, "error in upstream pipeline for StoreSink");
                    continue;
                }
            };

            buffer.push(env);
            if buffer.len() >= self.batch_size {
                self.flush_batch(&buffer, &mut report).await;
                buffer.clear();
            }
        }

        if !buffer.is_empty() {
            self.flush_batch(&buffer, &mut report).await;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use hems_client::{
        domain::SeriesRecord,
        store::{MemoryStore, SeriesQuery, TagPredicate, TimeRange},
        StoreResult, TimeSeriesStore,
    };
    use time::OffsetDateTime;

    use super::*;

    /// Fails the first `failures` writes with the given error, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: usize,
        transient: bool,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize, transient: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures,
                transient,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl TimeSeriesStore for FlakyStore {
        async fn write(&self, points: &[MeasurementPoint]) -> StoreResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                let status = if self.transient { 503 } else { 400 };
                return Err(StoreError::Api {
                    status,
                    message: "unavailable".to_string(),
                });
            }
            self.inner.write(points).await
        }

        async fn query(&self, query: &SeriesQuery) -> StoreResult<Vec<SeriesRecord>> {
            self.inner.query(query).await
        }

        async fn delete_range(&self, measurement: &str, predicate: &TagPredicate, range: TimeRange) -> StoreResult<()> {
            self.inner.delete_range(measurement, predicate, range).await
        }
    }

    fn points(n: usize) -> Vec<Result<Envelope<MeasurementPoint>, PipelineError>> {
        let now = OffsetDateTime::now_utc();
        (0..n)
            .map(|i| {
                Ok(Envelope::new(
                    MeasurementPoint::new("energy_flow", now - time::Duration::minutes(i as i64))
                        .field("pv_power_kw", i as f64),
                ))
            })
            .collect()
    }

    #[tokio::test]
    async fn writes_in_batches_and_counts_skipped_rows() {
        let store = Arc::new(FlakyStore::new(0, true));
        let sink = StoreSink::new(store.clone(), 2, 0, Duration::ZERO);

        let mut items = points(5);
        items.insert(1, Err(PipelineError::DataQuality("bad".into())));
        items.push(Err(PipelineError::Source("gone".into())));

        let report = sink.run(futures::stream::iter(items)).await.unwrap();

        assert_eq!(report.written, 5);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.source_errors, 1);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.inner.len().await, 5);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(FlakyStore::new(2, true));
        let sink = StoreSink::new(store.clone(), 10, 3, Duration::from_millis(1));

        let report = sink.run(futures::stream::iter(points(3))).await.unwrap();

        assert_eq!(report.written, 3);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_drops_only_that_batch() {
        let store = Arc::new(FlakyStore::new(1, false));
        let sink = StoreSink::new(store.clone(), 2, 3, Duration::from_millis(1));

        let report = sink.run(futures::stream::iter(points(4))).await.unwrap();

        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.failed_points, 2);
        assert_eq!(report.written, 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn out_of_retention_is_reported_not_fatal() {
        let store = Arc::new(MemoryStore::with_retention(time::Duration::hours(1)));
        let sink = StoreSink::new(store.clone(), 10, 3, Duration::from_millis(1));

        let old = MeasurementPoint::new("energy_flow", OffsetDateTime::now_utc() - time::Duration::days(2))
            .field("pv_power_kw", 1.0);
        let mut items = points(2);
        items.push(Ok(Envelope::new(old)));

        let report = sink.run(futures::stream::iter(items)).await.unwrap();

        assert_eq!(report.out_of_window_batches, 1);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(store.len().await, 2);
    }
}
