use std::collections::BTreeMap;

use time::OffsetDateTime;

/// One field value of one series at one instant, as the store reports it
/// before pivoting.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrowRow {
    pub ts: OffsetDateTime,
    pub measurement: String,
    pub field: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    /// Store bookkeeping columns (`result`, `table`, `_start`, `_stop`).
    pub meta: BTreeMap<String, String>,
}

/// A wide row: every field of one series sharing a timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRecord {
    pub ts: OffsetDateTime,
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub meta: BTreeMap<String, String>,
}

impl SeriesRecord {
    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }
}

type PivotKey = (OffsetDateTime, String, BTreeMap<String, String>);

/// Reshape narrow rows into wide records keyed by (timestamp, measurement,
/// tag set). Output is ordered by ascending timestamp; rows of different tag
/// sets at the same instant stay separate records.
pub fn pivot<I>(rows: I) -> Vec<SeriesRecord>
where
    I: IntoIterator<Item = NarrowRow>,
{
    let mut wide: BTreeMap<PivotKey, SeriesRecord> = BTreeMap::new();

    for row in rows {
        let key = (row.ts, row.measurement.clone(), row.tags.clone());
        let record = wide.entry(key).or_insert_with(|| SeriesRecord {
            ts: row.ts,
            measurement: row.measurement,
            tags: row.tags,
            fields: BTreeMap::new(),
            meta: BTreeMap::new(),
        });
        record.fields.insert(row.field, row.value);
        for (k, v) in row.meta {
            record.meta.entry(k).or_insert(v);
        }
    }

    wide.into_values().collect()
}
