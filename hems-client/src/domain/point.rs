use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::error::{StoreError, StoreResult};

/// A single timestamped measurement as written to the store.
///
/// Tags are indexed string dimensions (e.g. `source`), fields carry the
/// numeric payload (e.g. `pv_power_kw`). Points are never mutated once
/// written; they expire through the store's retention policy.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub ts: OffsetDateTime,
}

impl MeasurementPoint {
    pub fn new(measurement: impl Into<String>, ts: OffsetDateTime) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            ts,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Reject points the store could not represent.
    pub fn ensure_writable(&self) -> StoreResult<()> {
        if self.measurement.trim().is_empty() {
            return Err(StoreError::InvalidPoint("measurement name is empty".to_string()));
        }
        if self.fields.is_empty() {
            return Err(StoreError::InvalidPoint(format!(
                "point in '{}' has no fields",
                self.measurement
            )));
        }
        if let Some((key, value)) = self.fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(StoreError::InvalidPoint(format!(
                "field '{key}' has non-finite value {value}"
            )));
        }
        if self.tags.keys().chain(self.fields.keys()).any(|k| k.is_empty()) {
            return Err(StoreError::InvalidPoint("empty tag or field key".to_string()));
        }
        Ok(())
    }
}
