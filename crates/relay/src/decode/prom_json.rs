//! Prometheus adapter JSON decoder
//!
//! Samples come in the JSON form published by the prometheus-kafka
//! adapter (see [`cairn_types::PromSample`]) and already satisfy the
//! Prometheus data model, so they skip the filter stage. That means
//! normalization and the single-field rewrite both happen here.
//!
//! Normalization lowercases the raw payload before unmarshalling, which
//! also munges the RFC 3339 timestamp; the timestamp is re-uppercased
//! afterwards so it parses again.

use cairn_types::{FieldValue, Metric, PromSample};

use super::DecodeError;

pub(crate) fn decode(
    payload: &[u8],
    normalize: bool,
    flip_single_fields: bool,
) -> Result<Vec<Metric>, DecodeError> {
    let lowered;
    let payload = if normalize {
        lowered = payload.to_ascii_lowercase();
        lowered.as_slice()
    } else {
        payload
    };

    let mut sample: PromSample = serde_json::from_slice(payload)?;
    if normalize {
        sample.timestamp = sample.timestamp.to_ascii_uppercase();
    }

    // adapter timestamps are RFC 3339; the rest of the pipeline carries
    // whole seconds
    let parsed = chrono::DateTime::parse_from_rfc3339(&sample.timestamp).map_err(|source| {
        DecodeError::Timestamp {
            timestamp: sample.timestamp.clone(),
            source,
        }
    })?;

    let mut metric = Metric {
        timestamp: parsed.timestamp(),
        ..Metric::default()
    };
    for (key, value) in sample.labels {
        // __name__ repeats the metric name, drop it
        if key == "__name__" {
            continue;
        }
        metric.tags.insert(key, value);
    }

    if flip_single_fields {
        // prometheus samples are single-valued by construction, so the
        // rewrite just stores the value under "value"
        metric.name = sample.name;
        metric
            .fields
            .insert("value".to_string(), FieldValue::String(sample.value));
    } else {
        // split the sample name on "_": the final token becomes the field
        // key, the rest stays the name; single-token names keep "value"
        match sample.name.rsplit_once('_') {
            Some((name, field)) => {
                metric.name = name.to_string();
                metric
                    .fields
                    .insert(field.to_string(), FieldValue::String(sample.value));
            }
            None => {
                metric.name = sample.name;
                metric
                    .fields
                    .insert("value".to_string(), FieldValue::String(sample.value));
            }
        }
    }

    Ok(vec![metric])
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{"value":"2","name":"test_metric_field","timestamp":"2021-11-16T07:20:50.52Z","labels":{"__name__":"test_metric_field","tag":"Value"}}"#;

    #[test]
    fn splits_name_when_flip_disabled() {
        let out = decode(PAYLOAD.as_bytes(), false, false).unwrap();
        let metric = &out[0];
        assert_eq!(metric.name, "test_metric");
        assert_eq!(metric.fields.len(), 1);
        assert_eq!(metric.fields["field"], FieldValue::String("2".to_string()));
        assert_eq!(metric.tags.len(), 1);
        assert_eq!(metric.tags["tag"], "Value");
        assert_eq!(metric.timestamp, 1637047250);
    }

    #[test]
    fn keeps_name_when_flip_enabled_and_normalizes() {
        let out = decode(PAYLOAD.as_bytes(), true, true).unwrap();
        let metric = &out[0];
        assert_eq!(metric.name, "test_metric_field");
        assert_eq!(metric.fields["value"], FieldValue::String("2".to_string()));
        assert_eq!(metric.tags["tag"], "value");
        assert_eq!(metric.timestamp, 1637047250);
    }

    #[test]
    fn single_token_name_uses_value_field() {
        let raw = r#"{"value":"1","name":"up","timestamp":"1970-01-01T00:00:10Z","labels":{}}"#;
        let out = decode(raw.as_bytes(), false, false).unwrap();
        assert_eq!(out[0].name, "up");
        assert_eq!(out[0].fields["value"], FieldValue::String("1".to_string()));
        assert_eq!(out[0].timestamp, 10);
    }

    #[test]
    fn drops_name_label_only() {
        let out = decode(PAYLOAD.as_bytes(), false, true).unwrap();
        assert!(!out[0].tags.contains_key("__name__"));
        assert_eq!(out[0].tags.len(), 1);
    }

    #[test]
    fn unparseable_timestamp_is_a_timestamp_error() {
        let raw = r#"{"value":"1","name":"up","timestamp":"yesterday","labels":{}}"#;
        let err = decode(raw.as_bytes(), false, false).unwrap_err();
        assert!(matches!(err, DecodeError::Timestamp { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn truncates_to_whole_seconds() {
        let raw = r#"{"value":"1","name":"up","timestamp":"2021-11-16T07:20:50.999999Z","labels":{}}"#;
        let out = decode(raw.as_bytes(), false, true).unwrap();
        assert_eq!(out[0].timestamp, 1637047250);
    }
}
