use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{record::SeriesRecord, MeasurementPoint, FORECAST_SOC, LOAD_FORECAST_KW, PV_FORECAST_KW, SOC_PERCENT};

/// One quarter-hour step of a SoC trajectory.
///
/// Serialized in the external shape `{timestamp, soc, pv_forecast, load_forecast}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSample {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "soc")]
    pub soc_percent: f64,
    #[serde(rename = "pv_forecast")]
    pub pv_forecast_kw: f64,
    #[serde(rename = "load_forecast")]
    pub load_forecast_kw: f64,
}

impl ForecastSample {
    pub fn to_point(&self, tags: &BTreeMap<String, String>) -> MeasurementPoint {
        let mut point = MeasurementPoint::new(FORECAST_SOC, self.timestamp)
            .field(SOC_PERCENT, self.soc_percent)
            .field(PV_FORECAST_KW, self.pv_forecast_kw)
            .field(LOAD_FORECAST_KW, self.load_forecast_kw);
        point.tags = tags.clone();
        point
    }

    /// Rebuild a sample from a pivoted forecast row. Rows lacking a SoC value
    /// are not samples.
    pub fn from_record(record: &SeriesRecord) -> Option<Self> {
        Some(Self {
            timestamp: record.ts,
            soc_percent: record.field(SOC_PERCENT)?,
            pv_forecast_kw: record.field(PV_FORECAST_KW).unwrap_or(0.0),
            load_forecast_kw: record.field(LOAD_FORECAST_KW).unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn serializes_with_external_keys() {
        let sample = ForecastSample {
            timestamp: datetime!(2025-01-01 10:15:00 UTC),
            soc_percent: 51.25,
            pv_forecast_kw: 3.3,
            load_forecast_kw: 1.0,
        };

        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["timestamp"], "2025-01-01T10:15:00Z");
        assert_eq!(json["soc"], 51.25);
        assert_eq!(json["pv_forecast"], 3.3);
        assert_eq!(json["load_forecast"], 1.0);
    }

    #[test]
    fn point_carries_all_three_fields_and_tags() {
        let sample = ForecastSample {
            timestamp: datetime!(2025-01-01 10:15:00 UTC),
            soc_percent: 50.0,
            pv_forecast_kw: 0.0,
            load_forecast_kw: 1.5,
        };
        let tags = BTreeMap::from([("algorithm".to_string(), "simple_heuristic".to_string())]);

        let point = sample.to_point(&tags);
        assert_eq!(point.measurement, FORECAST_SOC);
        assert_eq!(point.fields.len(), 3);
        assert_eq!(point.tags, tags);
    }
}
