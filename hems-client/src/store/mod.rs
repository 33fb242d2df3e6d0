use std::{collections::BTreeMap, sync::Arc};

use time::{Duration, OffsetDateTime};

use crate::{
    domain::{MeasurementPoint, SeriesRecord},
    error::StoreResult,
};

pub mod flux;
pub mod influx;
pub mod line_protocol;
pub mod memory;

pub use influx::{InfluxConfig, InfluxStore};
pub use memory::MemoryStore;

/// Half-open time range `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: OffsetDateTime,
    pub stop: OffsetDateTime,
}

impl TimeRange {
    pub fn new(start: OffsetDateTime, stop: OffsetDateTime) -> Self {
        Self { start, stop }
    }

    /// `[now - lookback, now)`.
    pub fn lookback(now: OffsetDateTime, lookback: Duration) -> Self {
        Self::new(now - lookback, now)
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.start <= ts && ts < self.stop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Mean,
    /// Number of points in the window.
    Count,
}

impl AggregateFn {
    pub fn flux_name(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Count => "count",
        }
    }

    pub fn apply(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            Self::Mean => Some(values.iter().sum::<f64>() / values.len() as f64),
            Self::Count => Some(values.len() as f64),
        }
    }
}

/// Fixed-width windowing of each field independently. Empty windows are
/// never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregation {
    pub every: Duration,
    pub func: AggregateFn,
}

impl Aggregation {
    pub fn mean(every: Duration) -> Self {
        Self {
            every,
            func: AggregateFn::Mean,
        }
    }

    pub fn count(every: Duration) -> Self {
        Self {
            every,
            func: AggregateFn::Count,
        }
    }
}

/// Conjunction of tag equality tests. An empty predicate matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPredicate {
    pub equals: BTreeMap<String, String>,
}

impl TagPredicate {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::any().and(key, value)
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.equals.iter().all(|(k, v)| tags.get(k) == Some(v))
    }
}

/// Range + filter + optional window aggregate over one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesQuery {
    pub measurement: String,
    /// Fields to return; empty means all fields.
    pub fields: Vec<String>,
    pub tags: TagPredicate,
    pub range: TimeRange,
    pub aggregation: Option<Aggregation>,
    /// Keep only the most recent value of every series.
    pub last_only: bool,
}

impl SeriesQuery {
    pub fn new(measurement: impl Into<String>, range: TimeRange) -> Self {
        Self {
            measurement: measurement.into(),
            fields: Vec::new(),
            tags: TagPredicate::any(),
            range,
            aggregation: None,
            last_only: false,
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags = self.tags.and(key, value);
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn last(mut self) -> Self {
        self.last_only = true;
        self
    }

    pub fn wants_field(&self, field: &str) -> bool {
        self.fields.is_empty() || self.fields.iter().any(|f| f == field)
    }
}

/// Contract of the time-series storage engine.
///
/// Implementations must be safe for concurrent use by independent writers
/// and readers; callers add no locking around them.
#[async_trait::async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Append `points` as one batch. A failure fails the whole batch, except
    /// `OutOfRetention`, which reports points the store dropped.
    async fn write(&self, points: &[MeasurementPoint]) -> StoreResult<()>;

    /// Run `query` and return pivoted rows in ascending timestamp order.
    async fn query(&self, query: &SeriesQuery) -> StoreResult<Vec<SeriesRecord>>;

    /// Administrative removal of points of `measurement` matching `predicate`
    /// inside `range`.
    async fn delete_range(
        &self,
        measurement: &str,
        predicate: &TagPredicate,
        range: TimeRange,
    ) -> StoreResult<()>;
}

pub type SharedStore = Arc<dyn TimeSeriesStore>;
