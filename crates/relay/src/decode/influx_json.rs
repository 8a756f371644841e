//! Influx JSON decoder
//!
//! Payloads arrive in influx's default JSON output shape and unmarshal
//! directly into the metric form:
//!
//! ```json
//! {
//!     "fields": {"usage": 30, "n_images": 660},
//!     "name": "docker",
//!     "tags": {"host": "raynor"},
//!     "timestamp": 1458229140
//! }
//! ```

use cairn_types::Metric;

use super::{flip_single_field, DecodeError};

pub(crate) fn decode(payload: &[u8], flip_single_fields: bool) -> Result<Vec<Metric>, DecodeError> {
    let metric: Metric = serde_json::from_slice(payload)?;
    let metric = if flip_single_fields {
        flip_single_field(metric)
    } else {
        metric
    };
    Ok(vec![metric])
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::FieldValue;

    const PAYLOAD: &str = r#"{"name":"docker","tags":{"host":"raynor"},"fields":{"n_images":660},"timestamp":1458229140}"#;

    #[test]
    fn unmarshals_directly() {
        let out = decode(PAYLOAD.as_bytes(), false).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name, "docker");
        assert_eq!(out[0].fields["n_images"], FieldValue::Integer(660));
        assert_eq!(out[0].timestamp, 1458229140);
    }

    #[test]
    fn flips_single_field_records() {
        let out = decode(PAYLOAD.as_bytes(), true).unwrap();
        let metric = &out[0];
        assert_eq!(metric.name, "docker_n_images");
        assert_eq!(metric.fields.len(), 1);
        assert_eq!(metric.fields["value"], FieldValue::Integer(660));
        assert_eq!(metric.tags["host"], "raynor");
        assert_eq!(metric.timestamp, 1458229140);
    }

    #[test]
    fn leaves_multi_field_records_alone() {
        let raw = r#"{"name":"docker","fields":{"a":1,"b":2},"timestamp":5}"#;
        let out = decode(raw.as_bytes(), true).unwrap();
        assert_eq!(out[0].fields.len(), 2);
        assert_eq!(out[0].name, "docker");
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(decode(b"{not json", false).is_err());
    }
}
