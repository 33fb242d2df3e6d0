use std::{collections::BTreeMap, fs::File, path::PathBuf};

use csv::StringRecord;
use hems_client::domain::MeasurementPoint;
use serde::Deserialize;
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime, PrimitiveDateTime};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

/// How one CSV file maps onto measurement points.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CsvMapping {
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    pub measurement: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// CSV column name to field name.
    pub columns: BTreeMap<String, String>,
}

/// Parse a batch timestamp. Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS+HH:MM`
/// and naive `YYYY-MM-DD HH:MM:SS`, the latter taken as UTC. The date and
/// time may also be joined by `T`, and seconds may carry a fraction.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let s = raw.trim();
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(ts);
    }

    let with_offset = [
        format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]][offset_hour sign:mandatory]:[offset_minute]"
        ),
        format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]][offset_hour sign:mandatory]:[offset_minute]"
        ),
    ];
    if let Some(ts) = with_offset.iter().find_map(|f| OffsetDateTime::parse(s, *f).ok()) {
        return Some(ts);
    }

    let naive = [
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"),
    ];
    naive
        .iter()
        .find_map(|f| PrimitiveDateTime::parse(s, *f).ok())
        .map(PrimitiveDateTime::assume_utc)
}

struct ColumnIndex {
    timestamp: usize,
    fields: Vec<(usize, String)>,
}

fn resolve_columns(headers: &StringRecord, mapping: &CsvMapping) -> Result<ColumnIndex, PipelineError> {
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV header")))
    };

    let timestamp = position(&mapping.timestamp_column)?;
    let fields = mapping
        .columns
        .iter()
        .map(|(column, field)| Ok((position(column)?, field.clone())))
        .collect::<Result<Vec<_>, PipelineError>>()?;

    Ok(ColumnIndex { timestamp, fields })
}

fn record_to_point(
    record: &StringRecord,
    columns: &ColumnIndex,
    mapping: &CsvMapping,
) -> Result<MeasurementPoint, PipelineError> {
    let ts_raw = record.get(columns.timestamp).unwrap_or("");
    let ts = parse_timestamp(ts_raw)
        .ok_or_else(|| PipelineError::DataQuality(format!("invalid timestamp '{ts_raw}'")))?;

    let mut point = MeasurementPoint::new(mapping.measurement.as_str(), ts);
    for (key, value) in &mapping.tags {
        point = point.tag(key.as_str(), value.as_str());
    }

    for (idx, field) in &columns.fields {
        let raw = record.get(*idx).unwrap_or("").trim();
        let value: f64 = raw
            .parse()
            .map_err(|_| PipelineError::DataQuality(format!("invalid {field} value '{raw}'")))?;
        if !value.is_finite() {
            return Err(PipelineError::DataQuality(format!("non-finite {field} value '{raw}'")));
        }
        point = point.field(field.as_str(), value);
    }

    Ok(point)
}

/// Historical CSV file of one data class.
///
/// Every row needs the timestamp column and every mapped column. A row that
/// fails to parse is yielded as `DataQuality` and the file keeps streaming; a
/// missing file or header ends the stream with a `Source` error.
pub struct EnergyCsvFileSource {
    path: PathBuf,
    mapping: CsvMapping,
}

impl EnergyCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P, mapping: CsvMapping) -> Self {
        Self {
            path: path.into(),
            mapping,
        }
    }
}

#[async_trait::async_trait]
impl Source<MeasurementPoint> for EnergyCsvFileSource {
    async fn stream(&self) -> EnvelopeStream<MeasurementPoint> {
        let path = self.path.clone();
        let mapping = self.mapping.clone();

        let s = async_stream::stream! {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to open {}: {e}", path.display())));
                    return;
                }
            };

            let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
            let columns = match rdr.headers() {
                Ok(headers) => resolve_columns(headers, &mapping),
                Err(e) => Err(PipelineError::Source(format!("failed to read CSV headers: {e}"))),
            };
            let columns = match columns {
                Ok(c) => c,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            for (line, result) in rdr.records().enumerate() {
                let parsed = result
                    .map_err(|e| PipelineError::DataQuality(format!("unreadable CSV record: {e}")))
                    .and_then(|record| record_to_point(&record, &columns, &mapping));

                match parsed {
                    Ok(point) => yield Ok(Envelope::new(point)),
                    Err(e) => {
                        metrics::counter!("batch_rows_skipped_total", "measurement" => mapping.measurement.clone())
                            .increment(1);
                        tracing::debug!(row = line + 1, error = %e, "skipping CSV row");
                        yield Err(e);
                    }
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use futures::StreamExt;
    use time::macros::datetime;

    use super::*;

    fn consumption_mapping() -> CsvMapping {
        CsvMapping {
            timestamp_column: "timestamp".to_string(),
            measurement: "energy_flow".to_string(),
            tags: BTreeMap::from([("source".to_string(), "csv_init".to_string())]),
            columns: BTreeMap::from([("consumption_kwh".to_string(), "consumption_power_kw".to_string())]),
        }
    }

    fn csv_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_all_accepted_timestamp_formats() {
        let expected = datetime!(2024-03-01 10:00:00 UTC);

        assert_eq!(parse_timestamp("2024-03-01T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 11:00:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp(" 2024-03-01 10:00:00 "), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("01/03/2024 10:00"), None);
    }

    #[test]
    fn parses_fractional_seconds() {
        let expected = datetime!(2024-03-01 10:00:00.25 UTC);

        assert_eq!(parse_timestamp("2024-03-01 10:00:00.25"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T10:00:00.250"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 11:00:00.25+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T10:00:00.25Z"), Some(expected));
    }

    #[tokio::test]
    async fn bad_rows_are_reported_and_the_file_continues() {
        let f = csv_file(
            "timestamp,consumption_kwh\n\
             2024-03-01 10:00:00,1.5\n\
             not-a-date,2.0\n\
             2024-03-01 10:15:00,\n\
             2024-03-01 10:30:00,0.75\n",
        );

        let source = EnergyCsvFileSource::new(f.path(), consumption_mapping());
        let items: Vec<_> = source.stream().await.collect().await;

        assert_eq!(items.len(), 4);
        let points: Vec<_> = items.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(points.len(), 2);
        assert!(items
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(PipelineError::is_row_level));

        let last = &points[1].payload;
        assert_eq!(last.ts, datetime!(2024-03-01 10:30:00 UTC));
        assert_eq!(last.fields.get("consumption_power_kw"), Some(&0.75));
        assert_eq!(last.tags.get("source").map(String::as_str), Some("csv_init"));
    }

    #[tokio::test]
    async fn missing_mapped_column_is_a_source_error() {
        let f = csv_file("timestamp,generation_kwh\n2024-03-01 10:00:00,1.0\n");

        let source = EnergyCsvFileSource::new(f.path(), consumption_mapping());
        let items: Vec<_> = source.stream().await.collect().await;

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(PipelineError::Source(_))));
    }

    #[tokio::test]
    async fn missing_file_is_a_source_error() {
        let source = EnergyCsvFileSource::new("/nonexistent/consumption.csv", consumption_mapping());
        let items: Vec<_> = source.stream().await.collect().await;

        assert!(matches!(items.as_slice(), [Err(PipelineError::Source(_))]));
    }
}
