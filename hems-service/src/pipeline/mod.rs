use std::{pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// The source as a whole cannot be read.
    #[error("source error: {0}")]
    Source(String),
    /// One record is malformed; the rest of the batch continues.
    #[error("data quality error: {0}")]
    DataQuality(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

impl PipelineError {
    /// Errors confined to a single record, which are skipped and counted.
    pub fn is_row_level(&self) -> bool {
        matches!(self, Self::DataQuality(_) | Self::Transform(_))
    }
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<SinkReport, PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// Outcome counts of one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    /// Points in batches the store fully accepted.
    pub written: usize,
    /// Rows rejected by the source or a transform.
    pub skipped: usize,
    pub source_errors: usize,
    /// Batches the store accepted only in part because of its retention window.
    pub out_of_window_batches: usize,
    pub failed_batches: usize,
    pub failed_points: usize,
}

impl SinkReport {
    pub fn merge(&mut self, other: &SinkReport) {
        self.written += other.written;
        self.skipped += other.skipped;
        self.source_errors += other.source_errors;
        self.out_of_window_batches += other.out_of_window_batches;
        self.failed_batches += other.failed_batches;
        self.failed_points += other.failed_points;
    }
}

pub struct Pipeline<S, T, K> {
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>, // same-type transforms chain
    pub sink: K,
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<SinkReport, PipelineError> {
        let mut stream = self.source.stream().await;

        // Apply transforms in sequence (if any).
        for t in self.transforms {
            let t_arc = t.clone();
            stream = Box::pin(stream.then(move |item| {
                let t_inner = t_arc.clone();
                async move {
                    match item {
                        Ok(env) => t_inner.apply(env).await,
                        Err(e) => Err(e),
                    }
                }
            }));
        }

        self.sink.run(stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_level_errors_are_data_quality_and_transform() {
        assert!(PipelineError::DataQuality("x".into()).is_row_level());
        assert!(PipelineError::Transform("x".into()).is_row_level());
        assert!(!PipelineError::Source("x".into()).is_row_level());
        assert!(!PipelineError::Sink("x".into()).is_row_level());
    }

    #[test]
    fn reports_merge_by_summing() {
        let mut a = SinkReport {
            written: 10,
            skipped: 1,
            ..SinkReport::default()
        };
        a.merge(&SinkReport {
            written: 5,
            failed_batches: 1,
            failed_points: 5,
            ..SinkReport::default()
        });

        assert_eq!(a.written, 15);
        assert_eq!(a.skipped, 1);
        assert_eq!(a.failed_points, 5);
    }
}
