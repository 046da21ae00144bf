//! Line protocol parsing and rendering
//!
//! Format: `measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp`
//! Measurement, tag and field keys escape `,`, `=` and ` ` with a backslash;
//! string field values are double-quoted with `\"` and `\\` escapes.

use crate::{FieldValue, Fields, Point, RelayError, Result, SeriesKey, Timestamp};

/// A parsed point together with the exact line it came from
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub point: Point,
    /// Source line, with a timestamp appended when the client omitted it
    pub raw: String,
}

/// Nanoseconds per unit of a write precision
pub fn precision_multiplier(precision: &str) -> Result<i64> {
    match precision {
        "" | "n" | "ns" => Ok(1),
        "u" | "us" | "µ" => Ok(1_000),
        "ms" => Ok(1_000_000),
        "s" => Ok(1_000_000_000),
        "m" => Ok(60_000_000_000),
        "h" => Ok(3_600_000_000_000),
        other => Err(RelayError::BadRequest(format!("unknown precision: {}", other))),
    }
}

/// Parse a write body
///
/// Lines without a timestamp get `now` (nanoseconds) converted to the
/// request precision, so every replica stores the same time.
pub fn parse_lines(body: &str, precision: &str, now: Timestamp) -> Result<Vec<ParsedLine>> {
    let multiplier = precision_multiplier(precision)?;
    let mut lines = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (point, has_ts) = parse_line(line, multiplier, now)
            .map_err(|e| RelayError::BadRequest(format!("unable to parse '{}': {}", line, e)))?;
        let raw = if has_ts {
            line.to_string()
        } else {
            format!("{} {}", line, point.timestamp / multiplier)
        };
        lines.push(ParsedLine { point, raw });
    }
    Ok(lines)
}

/// Parse a write body into points only
pub fn parse_points(body: &str, precision: &str, now: Timestamp) -> Result<Vec<Point>> {
    Ok(parse_lines(body, precision, now)?
        .into_iter()
        .map(|l| l.point)
        .collect())
}

fn parse_line(
    line: &str,
    multiplier: i64,
    now: Timestamp,
) -> std::result::Result<(Point, bool), String> {
    let sections = split_sections(line);
    if sections.len() < 2 {
        return Err("missing fields".into());
    }

    let key_parts = split_escaped(sections[0], ',', false);
    let measurement = unescape(key_parts[0]);
    if measurement.is_empty() {
        return Err("missing measurement".into());
    }
    let mut key = SeriesKey::new(measurement);
    for tag in &key_parts[1..] {
        let kv = split_escaped(tag, '=', false);
        if kv.len() != 2 || kv[0].is_empty() || kv[1].is_empty() {
            return Err(format!("invalid tag format {}", tag));
        }
        key.tags.insert(unescape(kv[0]), unescape(kv[1]));
    }

    let mut fields = Fields::new();
    for field in split_escaped(sections[1], ',', true) {
        let Some(eq) = find_unescaped(field, '=') else {
            return Err(format!("invalid field format {}", field));
        };
        let name = unescape(&field[..eq]);
        if name.is_empty() {
            return Err("missing field key".into());
        }
        fields.insert(name, parse_field_value(&field[eq + 1..])?);
    }
    if fields.is_empty() {
        return Err("missing fields".into());
    }

    let (timestamp, has_ts) = match sections.get(2) {
        Some(ts) => {
            let ts: i64 = ts.parse().map_err(|_| format!("invalid timestamp {}", ts))?;
            let ns = ts
                .checked_mul(multiplier)
                .ok_or_else(|| format!("timestamp out of range {}", ts))?;
            (ns, true)
        }
        None => (now - now % multiplier, false),
    };
    Ok((Point::new(key, fields, timestamp), has_ts))
}

fn parse_field_value(s: &str) -> std::result::Result<FieldValue, String> {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        let inner = &s[1..s.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(&n) = chars.peek() {
                    if n == '"' || n == '\\' {
                        out.push(n);
                        chars.next();
                        continue;
                    }
                }
            }
            out.push(c);
        }
        return Ok(FieldValue::String(out));
    }
    match s {
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Boolean(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Boolean(false)),
        _ => {}
    }
    if let Some(n) = s.strip_suffix('i').or_else(|| s.strip_suffix('u')) {
        return n
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| format!("invalid integer {}", s));
    }
    s.parse::<f64>()
        .map(FieldValue::Float)
        .map_err(|_| format!("invalid field value {}", s))
}

/// Split a line into key, fields and timestamp on unescaped, unquoted spaces
fn split_sections(line: &str) -> Vec<&str> {
    let mut sections = Vec::with_capacity(3);
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            // quotes only matter once we are past the key section
            '"' if !sections.is_empty() => quoted = !quoted,
            ' ' if !quoted => {
                if i > start && sections.len() < 2 {
                    sections.push(&line[start..i]);
                    start = i + 1;
                } else if i == start {
                    start = i + 1;
                }
            }
            _ => {}
        }
    }
    if start < line.len() {
        sections.push(line[start..].trim());
    }
    sections
}

fn split_escaped(s: &str, sep: char, honour_quotes: bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
        } else if c == '"' && honour_quotes {
            quoted = !quoted;
        } else if c == sep && !quoted {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn find_unescaped(s: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == target {
            return Some(i);
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&n) = chars.peek() {
                if n == ',' || n == '=' || n == ' ' || n == '\\' {
                    out.push(n);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn escape_into(out: &mut String, s: &str, specials: &[char]) {
    for c in s.chars() {
        if specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Render a series key (`m,k=v`) with line-protocol escaping
pub fn render_series_key(key: &SeriesKey) -> String {
    let mut out = String::new();
    escape_into(&mut out, &key.measurement, &[',', ' ']);
    for (k, v) in &key.tags {
        out.push(',');
        escape_into(&mut out, k, &[',', '=', ' ']);
        out.push('=');
        escape_into(&mut out, v, &[',', '=', ' ']);
    }
    out
}

/// Render a point as one line with a nanosecond timestamp
pub fn render_point(point: &Point) -> String {
    let mut line = render_series_key(&point.key);
    line.push(' ');
    for (i, (k, v)) in point.fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        escape_into(&mut line, k, &[',', '=', ' ']);
        line.push('=');
        match v {
            FieldValue::Float(f) => {
                let s = f.to_string();
                line.push_str(&s);
            }
            FieldValue::Integer(n) => {
                line.push_str(&n.to_string());
                line.push('i');
            }
            FieldValue::Boolean(b) => line.push_str(if *b { "true" } else { "false" }),
            FieldValue::String(s) => {
                line.push('"');
                escape_into(&mut line, s, &['"', '\\']);
                line.push('"');
            }
        }
    }
    line.push(' ');
    line.push_str(&point.timestamp.to_string());
    line
}
