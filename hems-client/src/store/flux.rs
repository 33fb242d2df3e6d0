//! Flux query text and annotated-CSV response decoding for InfluxDB v2.

use std::{collections::BTreeMap, fmt::Write as _};

use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime, UtcOffset};

use super::{SeriesQuery, TagPredicate};
use crate::{
    domain::NarrowRow,
    error::{StoreError, StoreResult},
};

/// Columns the store adds to every row for its own bookkeeping.
const META_COLUMNS: [&str; 4] = ["result", "table", "_start", "_stop"];

pub fn format_time(ts: OffsetDateTime) -> StoreResult<String> {
    ts.to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|e| StoreError::Config(format!("timestamp {ts} not representable: {e}")))
}

/// Flux duration literal, whole seconds where possible.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.whole_nanoseconds();
    if nanos % 1_000_000_000 == 0 {
        format!("{}s", nanos / 1_000_000_000)
    } else {
        format!("{nanos}ns")
    }
}

/// Double-quoted Flux string literal.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

pub fn build_query(bucket: &str, query: &SeriesQuery) -> StoreResult<String> {
    let mut flux = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(flux, "from(bucket: {})", quote(bucket));
    let _ = writeln!(
        flux,
        "  |> range(start: {}, stop: {})",
        format_time(query.range.start)?,
        format_time(query.range.stop)?
    );
    let _ = writeln!(
        flux,
        "  |> filter(fn: (r) => r[\"_measurement\"] == {})",
        quote(&query.measurement)
    );

    if !query.fields.is_empty() {
        let clauses: Vec<String> = query
            .fields
            .iter()
            .map(|f| format!("r[\"_field\"] == {}", quote(f)))
            .collect();
        let _ = writeln!(flux, "  |> filter(fn: (r) => {})", clauses.join(" or "));
    }

    for (key, value) in &query.tags.equals {
        let _ = writeln!(flux, "  |> filter(fn: (r) => r[{}] == {})", quote(key), quote(value));
    }

    if let Some(agg) = &query.aggregation {
        let _ = writeln!(
            flux,
            "  |> aggregateWindow(every: {}, fn: {}, createEmpty: false)",
            format_duration(agg.every),
            agg.func.flux_name()
        );
    }

    if query.last_only {
        let _ = writeln!(flux, "  |> last()");
    }

    Ok(flux)
}

/// Predicate expression for the delete endpoint, e.g.
/// `_measurement="energy_flow" AND source="simulation"`.
pub fn delete_predicate(measurement: &str, predicate: &TagPredicate) -> String {
    let mut clauses = vec![format!("_measurement={}", quote(measurement))];
    clauses.extend(
        predicate
            .equals
            .iter()
            .map(|(k, v)| format!("{k}={}", quote(v))),
    );
    clauses.join(" AND ")
}

/// Decode the CSV body of a query response into narrow rows.
///
/// The body may hold several tables separated by blank lines, each with its
/// own header row; annotation rows start with `#`.
pub fn decode_csv(body: &str) -> StoreResult<Vec<NarrowRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(body.as_bytes());

    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for result in rdr.records() {
        let record = result.map_err(|e| StoreError::Decode(format!("invalid CSV: {e}")))?;

        if record.iter().all(|c| c.trim().is_empty()) {
            header = None;
            continue;
        }

        if record.iter().any(|c| c == "_time") && record.iter().any(|c| c == "_value") {
            header = Some(record.iter().map(str::to_string).collect());
            continue;
        }

        let Some(columns) = header.as_ref() else {
            if record.iter().any(|c| c == "error") {
                return Err(StoreError::Decode(format!(
                    "query returned an error table: {}",
                    record.iter().collect::<Vec<_>>().join(",")
                )));
            }
            return Err(StoreError::Decode("data row before header row".to_string()));
        };

        if let Some(row) = decode_row(columns, &record)? {
            rows.push(row);
        }
    }

    Ok(rows)
}

fn decode_row(columns: &[String], record: &csv::StringRecord) -> StoreResult<Option<NarrowRow>> {
    let mut ts = None;
    let mut value = None;
    let mut field = None;
    let mut measurement = String::new();
    let mut tags = BTreeMap::new();
    let mut meta = BTreeMap::new();

    for (name, cell) in columns.iter().zip(record.iter()) {
        match name.as_str() {
            "" => {}
            "_time" => {
                let parsed = OffsetDateTime::parse(cell, &Rfc3339)
                    .map_err(|e| StoreError::Decode(format!("invalid _time '{cell}': {e}")))?;
                ts = Some(parsed);
            }
            "_value" => value = Some(cell),
            "_field" => field = Some(cell.to_string()),
            "_measurement" => measurement = cell.to_string(),
            n if META_COLUMNS.contains(&n) => {
                meta.insert(n.to_string(), cell.to_string());
            }
            n => {
                if !cell.is_empty() {
                    tags.insert(n.to_string(), cell.to_string());
                }
            }
        }
    }

    let (Some(ts), Some(raw), Some(field)) = (ts, value, field) else {
        return Err(StoreError::Decode("row lacks _time, _value or _field".to_string()));
    };

    let Ok(value) = raw.trim().parse::<f64>() else {
        tracing::warn!(field = %field, value = %raw, "skipping non-numeric field value");
        return Ok(None);
    };

    Ok(Some(NarrowRow {
        ts,
        measurement,
        field,
        value,
        tags,
        meta,
    }))
}
