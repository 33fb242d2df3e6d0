use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use super::{flux, line_protocol, SeriesQuery, TagPredicate, TimeRange, TimeSeriesStore};
use crate::{
    domain::{pivot, MeasurementPoint, SeriesRecord},
    error::{StoreError, StoreResult},
};

/// Connection parameters, treated as opaque values.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    /// `None` leaves requests unbounded.
    pub request_timeout: Option<Duration>,
}

/// InfluxDB v2 HTTP API client.
#[derive(Clone)]
pub struct InfluxStore {
    cfg: InfluxConfig,
    client: Client,
}

impl InfluxStore {
    pub fn new(cfg: InfluxConfig) -> StoreResult<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = cfg.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { cfg, client })
    }

    pub fn bucket(&self) -> &str {
        &self.cfg.bucket
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.cfg.url.trim_end_matches('/'), path)
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.cfg.token)
    }

    /// Probe the server's health endpoint.
    pub async fn health(&self) -> StoreResult<()> {
        let response = self.client.get(self.endpoint("/health")).send().await?;
        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StoreError::Unauthorized),
        // Returned when some or all points fall outside the bucket's retention policy.
        StatusCode::UNPROCESSABLE_ENTITY => {
            warn!(message = %message, "store dropped points outside its retention policy");
            Err(StoreError::OutOfRetention { message })
        }
        other => Err(StoreError::Api {
            status: other.as_u16(),
            message,
        }),
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write(&self, points: &[MeasurementPoint]) -> StoreResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        for point in points {
            point.ensure_writable()?;
        }

        let body = line_protocol::encode_batch(points);
        debug!(points = points.len(), bytes = body.len(), "writing batch");

        let response = self
            .client
            .post(self.endpoint("/api/v2/write"))
            .query(&[
                ("org", self.cfg.org.as_str()),
                ("bucket", self.cfg.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(header::AUTHORIZATION, self.auth_header())
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        check_status(response).await.map(|_| ())
    }

    async fn query(&self, query: &SeriesQuery) -> StoreResult<Vec<SeriesRecord>> {
        let text = flux::build_query(&self.cfg.bucket, query)?;
        debug!(measurement = %query.measurement, "running flux query");

        let response = self
            .client
            .post(self.endpoint("/api/v2/query"))
            .query(&[("org", self.cfg.org.as_str())])
            .header(header::AUTHORIZATION, self.auth_header())
            .header(header::ACCEPT, "application/csv")
            .json(&json!({
                "query": text,
                "type": "flux",
                "dialect": { "header": true, "delimiter": ",", "annotations": [] },
            }))
            .send()
            .await?;

        let body = check_status(response).await?.text().await?;
        let rows = flux::decode_csv(&body)?;
        Ok(pivot(rows))
    }

    async fn delete_range(
        &self,
        measurement: &str,
        predicate: &TagPredicate,
        range: TimeRange,
    ) -> StoreResult<()> {
        let predicate = flux::delete_predicate(measurement, predicate);
        debug!(predicate = %predicate, "deleting range");

        let response = self
            .client
            .post(self.endpoint("/api/v2/delete"))
            .query(&[("org", self.cfg.org.as_str()), ("bucket", self.cfg.bucket.as_str())])
            .header(header::AUTHORIZATION, self.auth_header())
            .json(&json!({
                "start": flux::format_time(range.start)?,
                "stop": flux::format_time(range.stop)?,
                "predicate": predicate,
            }))
            .send()
            .await?;

        check_status(response).await.map(|_| ())
    }
}
