//! Influx line-protocol decoder
//!
//! Parses textual records of the form
//! `measurement,tag=v field=v timestamp`, one point per line. A payload is
//! accepted as a whole or not at all: any malformed line discards the
//! entire payload, matching the upstream relay's behavior.

use std::collections::BTreeMap;

use cairn_types::{FieldValue, Metric};

use super::{flip_single_field, DecodeError};

pub(crate) fn decode(payload: &[u8], flip_single_fields: bool) -> Result<Vec<Metric>, DecodeError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| DecodeError::Line(format!("payload is not utf-8: {}", e)))?;

    let mut points = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut point = parse_point(line).map_err(DecodeError::Line)?;
        if flip_single_fields {
            point = flip_single_field(point);
        }
        points.push(point);
    }
    Ok(points)
}

/// Characters that a backslash escapes in the measurement/tag/field-key
/// sections.
const KEY_ESCAPES: &[char] = &[',', '=', ' ', '\\'];

fn parse_point(line: &str) -> Result<Metric, String> {
    let chars: Vec<char> = line.chars().collect();
    let mut pos = 0usize;

    let (name, stop) = scan(&chars, &mut pos, &[',', ' ']);
    if name.is_empty() {
        return Err("missing measurement name".to_string());
    }

    let mut tags = BTreeMap::new();
    let mut at = stop;
    while at == Some(',') {
        let (key, key_stop) = scan(&chars, &mut pos, &['=', ',', ' ']);
        if key_stop != Some('=') || key.is_empty() {
            return Err(format!("malformed tag key at offset {}", pos));
        }
        let (value, value_stop) = scan(&chars, &mut pos, &[',', ' ']);
        if value.is_empty() {
            return Err(format!("missing tag value for {:?}", key));
        }
        tags.insert(key, value);
        at = value_stop;
    }
    if at != Some(' ') {
        return Err("missing field section".to_string());
    }

    let mut fields = BTreeMap::new();
    loop {
        let (key, key_stop) = scan(&chars, &mut pos, &['=', ',', ' ']);
        if key_stop != Some('=') || key.is_empty() {
            return Err(format!("malformed field key at offset {}", pos));
        }
        let (value, value_stop) = scan_field_value(&chars, &mut pos)?;
        fields.insert(key, value);
        match value_stop {
            Some(',') => continue,
            _ => {
                at = value_stop;
                break;
            }
        }
    }

    let timestamp = match at {
        None => now_nanos(),
        Some(' ') => {
            let token: String = chars[pos..].iter().collect();
            let token = token.trim();
            if token.is_empty() {
                now_nanos()
            } else {
                token
                    .parse::<i64>()
                    .map_err(|_| format!("invalid timestamp {:?}", token))?
            }
        }
        Some(c) => return Err(format!("unexpected character {:?} after fields", c)),
    };

    Ok(Metric {
        name,
        tags,
        fields,
        timestamp,
    })
}

/// Scan from `pos` until one of `stops` appears unescaped, returning the
/// unescaped segment and the delimiter hit (`None` at end of line).
fn scan(chars: &[char], pos: &mut usize, stops: &[char]) -> (String, Option<char>) {
    let mut out = String::new();
    while *pos < chars.len() {
        let c = chars[*pos];
        if c == '\\' && *pos + 1 < chars.len() && KEY_ESCAPES.contains(&chars[*pos + 1]) {
            out.push(chars[*pos + 1]);
            *pos += 2;
            continue;
        }
        if stops.contains(&c) {
            *pos += 1;
            return (out, Some(c));
        }
        out.push(c);
        *pos += 1;
    }
    (out, None)
}

fn scan_field_value(
    chars: &[char],
    pos: &mut usize,
) -> Result<(FieldValue, Option<char>), String> {
    if *pos < chars.len() && chars[*pos] == '"' {
        *pos += 1;
        let mut out = String::new();
        while *pos < chars.len() {
            let c = chars[*pos];
            if c == '\\' && *pos + 1 < chars.len() && matches!(chars[*pos + 1], '"' | '\\') {
                out.push(chars[*pos + 1]);
                *pos += 2;
                continue;
            }
            if c == '"' {
                *pos += 1;
                // the quote must be followed by a separator or end of line
                let stop = if *pos < chars.len() {
                    let next = chars[*pos];
                    if next != ',' && next != ' ' {
                        return Err(format!("unexpected character {:?} after string field", next));
                    }
                    *pos += 1;
                    Some(next)
                } else {
                    None
                };
                return Ok((FieldValue::String(out), stop));
            }
            out.push(c);
            *pos += 1;
        }
        return Err("unterminated string field value".to_string());
    }

    let (token, stop) = scan(chars, pos, &[',', ' ']);
    Ok((parse_scalar(&token)?, stop))
}

fn parse_scalar(token: &str) -> Result<FieldValue, String> {
    match token {
        "" => return Err("empty field value".to_string()),
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Boolean(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Boolean(false)),
        _ => {}
    }
    if let Some(digits) = token.strip_suffix('i') {
        return digits
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| format!("invalid integer field {:?}", token));
    }
    if let Some(digits) = token.strip_suffix('u') {
        return digits
            .parse::<u64>()
            .ok()
            .and_then(|v| i64::try_from(v).ok())
            .map(FieldValue::Integer)
            .ok_or_else(|| format!("invalid unsigned field {:?}", token));
    }
    if token.eq_ignore_ascii_case("nan") || token.to_ascii_lowercase().contains("inf") {
        return Err(format!("non-finite field value {:?}", token));
    }
    token
        .parse::<f64>()
        .map(FieldValue::Float)
        .map_err(|_| format!("invalid field value {:?}", token))
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_point() {
        let out = decode(
            b"test_metric,tag=Value field=1 1637090544726635243",
            false,
        )
        .unwrap();
        assert_eq!(out.len(), 1);
        let metric = &out[0];
        assert_eq!(metric.name, "test_metric");
        assert_eq!(metric.tags["tag"], "Value");
        assert_eq!(metric.fields["field"], FieldValue::Float(1.0));
        assert_eq!(metric.timestamp, 1637090544726635243);
    }

    #[test]
    fn flips_single_field_point() {
        let out = decode(b"test_metric,tag=Value field=1 1637090544726635243", true).unwrap();
        let metric = &out[0];
        assert_eq!(metric.name, "test_metric_field");
        assert_eq!(metric.fields.len(), 1);
        assert_eq!(metric.fields["value"], FieldValue::Float(1.0));
        assert_eq!(metric.tags["tag"], "Value");
        assert_eq!(metric.timestamp, 1637090544726635243);
    }

    #[test]
    fn keeps_multi_field_points_intact_under_flip() {
        let out = decode(b"m,host=a x=1,y=2 99", true).unwrap();
        let metric = &out[0];
        assert_eq!(metric.name, "m");
        assert_eq!(metric.fields.len(), 2);
        assert_eq!(metric.fields["x"], FieldValue::Float(1.0));
    }

    #[test]
    fn rejects_whitespace_in_tag_section() {
        let err = decode(b"test_metric, tag=value field=1 1637090544726635243", false);
        assert!(err.is_err());
    }

    #[test]
    fn malformed_line_discards_whole_payload() {
        let payload = b"good,tag=v f=1 10\nbad line here\n";
        assert!(decode(payload, false).is_err());
    }

    #[test]
    fn parses_multiple_points_per_payload() {
        let payload = b"a f=1 10\nb f=2 20\n\nc f=3 30";
        let out = decode(payload, false).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].name, "c");
        assert_eq!(out[2].timestamp, 30);
    }

    #[test]
    fn parses_typed_field_values() {
        let out = decode(
            b"m count=42i,total=7u,ok=true,ratio=0.5,note=\"hi there\" 5",
            false,
        )
        .unwrap();
        let fields = &out[0].fields;
        assert_eq!(fields["count"], FieldValue::Integer(42));
        assert_eq!(fields["total"], FieldValue::Integer(7));
        assert_eq!(fields["ok"], FieldValue::Boolean(true));
        assert_eq!(fields["ratio"], FieldValue::Float(0.5));
        assert_eq!(fields["note"], FieldValue::String("hi there".to_string()));
    }

    #[test]
    fn unescapes_special_characters() {
        let out = decode(
            b"cpu\\ load,data\\ center=us\\=west desc=\"say \\\"hi\\\"\" 10",
            false,
        )
        .unwrap();
        let metric = &out[0];
        assert_eq!(metric.name, "cpu load");
        assert_eq!(metric.tags["data center"], "us=west");
        assert_eq!(
            metric.fields["desc"],
            FieldValue::String("say \"hi\"".to_string())
        );
    }

    #[test]
    fn serialization_roundtrip() {
        let payload = "weather,loc\\ a=us\\,midwest temperature=82,note=\"a \\\"b\\\"\" 146583983";
        let out = decode(payload.as_bytes(), false).unwrap();
        let reparsed = decode(out[0].to_line_protocol().as_bytes(), false).unwrap();
        assert_eq!(out, reparsed);
    }

    #[test]
    fn missing_timestamp_defaults_to_now() {
        let before = now_nanos();
        let out = decode(b"m f=1", false).unwrap();
        assert!(out[0].timestamp >= before);
    }

    #[test]
    fn empty_payload_decodes_to_nothing() {
        assert!(decode(b"", false).unwrap().is_empty());
        assert!(decode(b"\n\n", false).unwrap().is_empty());
    }

    #[test]
    fn rejects_missing_fields_section() {
        assert!(decode(b"lonely_measurement 10", false).is_err());
        assert!(decode(b"m,tag=v", false).is_err());
    }
}
