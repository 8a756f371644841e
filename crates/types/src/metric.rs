//! Normalized metric representation
//!
//! Every decoder produces [`Metric`] values; the filter stage mutates them
//! and the output stage serializes them back to influx line protocol.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single field value.
///
/// The influx JSON format carries fields of mixed numeric/string type, so
/// the in-memory form is a tagged union of the permitted primitives rather
/// than an untyped value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}i", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Boolean(v) => write!(f, "{}", v),
            FieldValue::String(v) => write!(f, "\"{}\"", escape_string_value(v)),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// One metric record.
///
/// Tags and fields use ordered maps so line-protocol serialization is
/// deterministic (the protocol permits any key order; sorted keys are the
/// canonical form). All fields default so partially populated JSON decodes
/// the same way the upstream producers emit it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    /// Nanoseconds for the line/JSON influx formats, whole seconds for the
    /// Prometheus adapter format.
    #[serde(default)]
    pub timestamp: i64,
}

impl Metric {
    /// Serialize this metric to a single influx line-protocol record:
    /// `name,tag=v field=v timestamp`.
    pub fn to_line_protocol(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(&escape_measurement(&self.name));
        for (key, value) in &self.tags {
            out.push(',');
            out.push_str(&escape_key(key));
            out.push('=');
            out.push_str(&escape_key(value));
        }
        out.push(' ');
        let mut first = true;
        for (key, value) in &self.fields {
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(&escape_key(key));
            out.push('=');
            out.push_str(&value.to_string());
        }
        out.push(' ');
        out.push_str(&self.timestamp.to_string());
        out
    }
}

fn escape_measurement(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ',' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            ',' | '=' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

fn escape_string_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metric {
        Metric {
            name: "weather".to_string(),
            tags: BTreeMap::from([("location".to_string(), "us-midwest".to_string())]),
            fields: BTreeMap::from([("temperature".to_string(), FieldValue::Float(82.0))]),
            timestamp: 1465839830100400200,
        }
    }

    #[test]
    fn line_protocol_basic() {
        assert_eq!(
            sample().to_line_protocol(),
            "weather,location=us-midwest temperature=82 1465839830100400200"
        );
    }

    #[test]
    fn line_protocol_escapes_special_characters() {
        let metric = Metric {
            name: "cpu load,total".to_string(),
            tags: BTreeMap::from([("data center".to_string(), "us=west".to_string())]),
            fields: BTreeMap::from([(
                "desc".to_string(),
                FieldValue::String("say \"hi\"".to_string()),
            )]),
            timestamp: 10,
        };
        assert_eq!(
            metric.to_line_protocol(),
            "cpu\\ load\\,total,data\\ center=us\\=west desc=\"say \\\"hi\\\"\" 10"
        );
    }

    #[test]
    fn line_protocol_untagged_and_typed_fields() {
        let metric = Metric {
            name: "m".to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::from([
                ("count".to_string(), FieldValue::Integer(3)),
                ("ok".to_string(), FieldValue::Boolean(true)),
            ]),
            timestamp: -1,
        };
        assert_eq!(metric.to_line_protocol(), "m count=3i,ok=true -1");
    }

    #[test]
    fn json_roundtrip_keeps_mixed_field_types() {
        let raw = r#"{"name":"docker","tags":{"host":"raynor"},"fields":{"n":660,"load":0.5,"up":true,"state":"ok"},"timestamp":1458229140}"#;
        let metric: Metric = serde_json::from_str(raw).unwrap();
        assert_eq!(metric.fields["n"], FieldValue::Integer(660));
        assert_eq!(metric.fields["load"], FieldValue::Float(0.5));
        assert_eq!(metric.fields["up"], FieldValue::Boolean(true));
        assert_eq!(metric.fields["state"], FieldValue::String("ok".to_string()));
        assert_eq!(metric.timestamp, 1458229140);
    }

    #[test]
    fn json_defaults_for_missing_sections() {
        let metric: Metric = serde_json::from_str(r#"{"name":"docker"}"#).unwrap();
        assert!(metric.tags.is_empty());
        assert!(metric.fields.is_empty());
        assert_eq!(metric.timestamp, 0);
    }
}
