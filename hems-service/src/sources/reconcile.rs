use futures::StreamExt;
use hems_client::domain::MeasurementPoint;
use time::{Duration, OffsetDateTime};

use crate::{
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
    transform::check_timestamp,
};

/// Offset that moves the oldest batch timestamp to `now - lookback`.
pub fn batch_offset(min_ts: OffsetDateTime, now: OffsetDateTime, lookback: Duration) -> Duration {
    (now - lookback) - min_ts
}

/// Shift a whole batch into the store's retention window.
///
/// The inner source is drained first so one offset can be computed from the
/// oldest timestamp; every point is then moved by that same offset. Source
/// timestamps outside the sanity window are rejected before the offset is
/// computed. Errors pass through in their original order.
pub struct RetentionAlignedSource<S> {
    inner: S,
    now: OffsetDateTime,
    lookback: Duration,
}

impl<S> RetentionAlignedSource<S> {
    pub fn new(inner: S, now: OffsetDateTime, lookback: Duration) -> Self {
        Self { inner, now, lookback }
    }
}

#[async_trait::async_trait]
impl<S> Source<MeasurementPoint> for RetentionAlignedSource<S>
where
    S: Source<MeasurementPoint>,
{
    async fn stream(&self) -> EnvelopeStream<MeasurementPoint> {
        let items: Vec<Result<Envelope<MeasurementPoint>, PipelineError>> = self
            .inner
            .stream()
            .await
            .map(|item| item.and_then(|env| check_timestamp(env.payload.ts).map(|()| env)))
            .collect()
            .await;

        let min_ts = items.iter().filter_map(|r| r.as_ref().ok()).map(|env| env.payload.ts).min();
        let Some(min_ts) = min_ts else {
            return Box::pin(futures::stream::iter(items));
        };

        let offset = batch_offset(min_ts, self.now, self.lookback);
        tracing::info!(
            min_ts = %min_ts,
            offset_secs = offset.whole_seconds(),
            points = items.iter().filter(|r| r.is_ok()).count(),
            "aligning batch to retention window"
        );

        let shifted = items.into_iter().map(move |item| {
            item.map(|mut env| {
                env.payload.ts += offset;
                env
            })
        });
        Box::pin(futures::stream::iter(shifted))
    }
}
