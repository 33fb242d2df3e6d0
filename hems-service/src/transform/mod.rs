use hems_client::domain::MeasurementPoint;
use time::{macros::datetime, OffsetDateTime};

use crate::pipeline::{Envelope, PipelineError, Transform};

/// Pure validation of a `MeasurementPoint` before it reaches the store.
///
/// Rules:
/// - at least one field, all values finite.
/// - power fields (`*_kw`) must be non-negative; prices may be negative.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_point(env: Envelope<MeasurementPoint>) -> Result<Envelope<MeasurementPoint>, PipelineError> {
    let p = &env.payload;

    if p.fields.is_empty() {
        return Err(PipelineError::Transform(format!("{} point has no fields", p.measurement)));
    }

    for (name, value) in &p.fields {
        if !value.is_finite() {
            return Err(PipelineError::Transform(format!("{name} must be finite")));
        }
        if name.ends_with("_kw") && *value < 0.0 {
            return Err(PipelineError::Transform(format!("{name} must be non-negative")));
        }
    }

    check_timestamp(p.ts)?;

    Ok(env)
}

/// Broad sanity window [2000-01-01, 2100-01-01] for point timestamps.
pub fn check_timestamp(ts: OffsetDateTime) -> Result<(), PipelineError> {
    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if ts < min_ts || ts > max_ts {
        return Err(PipelineError::Transform(format!("timestamp {ts} out of allowed range")));
    }
    Ok(())
}

#[derive(Clone, Default)]
pub struct PointValidation;

#[async_trait::async_trait]
impl Transform<MeasurementPoint, MeasurementPoint> for PointValidation {
    async fn apply(&self, input: Envelope<MeasurementPoint>) -> Result<Envelope<MeasurementPoint>, PipelineError> {
        let measurement = input.payload.measurement.clone();
        match validate_point(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_rejected_total", "measurement" => measurement).increment(1);
                Err(e)
            }
        }
    }
}
