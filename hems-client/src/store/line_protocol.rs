use crate::domain::MeasurementPoint;

/// Measurement names escape commas and spaces.
fn escape_measurement(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

/// Tag keys, tag values and field keys escape commas, spaces and equals.
fn escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

fn push_tag(out: &mut String, key: &str, value: &str) {
    out.push(',');
    escape_ident(key, out);
    out.push('=');
    escape_ident(value, out);
}

fn push_field_f64(out: &mut String, first: &mut bool, key: &str, value: f64) {
    if *first {
        *first = false;
    } else {
        out.push(',');
    }

    escape_ident(key, out);
    out.push('=');
    // No suffix: line protocol reads bare numbers as floats.
    out.push_str(&value.to_string());
}

/// Append one point as a line (without the trailing newline).
pub fn write_line(point: &MeasurementPoint, out: &mut String) {
    escape_measurement(&point.measurement, out);

    // Empty tag values are not representable and are left out.
    for (key, value) in point.tags.iter().filter(|(_, v)| !v.is_empty()) {
        push_tag(out, key, value);
    }

    out.push(' ');
    let mut first = true;
    for (key, value) in &point.fields {
        push_field_f64(out, &mut first, key, *value);
    }

    out.push(' ');
    out.push_str(&point.ts.unix_timestamp_nanos().to_string());
}

/// Encode a batch as newline-separated lines, one request body.
pub fn encode_batch(points: &[MeasurementPoint]) -> String {
    // Heuristic capacity: ~120 bytes per line.
    let mut s = String::with_capacity(points.len().saturating_mul(120));
    for point in points {
        write_line(point, &mut s);
        s.push('\n');
    }
    s
}
