//! Identifier filtering and scrubbing
//!
//! Influx-format records are permissive about identifiers, so everything
//! decoded from the line/JSON formats passes through here before output.
//! The rules follow the Prometheus data model
//! (<https://prometheus.io/docs/concepts/data_model/>): names must start
//! with a letter, disallowed characters become `_`, and tag keys with the
//! reserved `__` prefix are removed.

use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cairn_types::Metric;

use crate::metrics::RelayMetrics;

static ALLOWED_NAMES: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-zA-Z][a-zA-Z0-9_:]*$").unwrap());
static ALLOWED_FIRST_CHAR: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-zA-Z]").unwrap());
static ALLOWED_FIELDS: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-zA-Z0-9_:]*$").unwrap());
static REPLACE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new("[^a-zA-Z0-9_:]").unwrap());
static ALLOWED_TAG_KEYS: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-zA-Z][a-zA-Z0-9_]*$").unwrap());

/// Scrub one record against the identifier grammar. Returns `None` when
/// the record is dropped (bad first character or no fields).
pub(crate) fn scrub(metric: Metric, normalize: bool, metrics: &RelayMetrics) -> Option<Metric> {
    let started = Instant::now();

    if !ALLOWED_FIRST_CHAR.is_match(&metric.name) {
        metrics.dropped.inc();
        warn!(name = %metric.name, "dropped metric: bad first character in name");
        metrics.filter_time.inc_by(started.elapsed().as_secs_f64());
        return None;
    }
    if metric.fields.is_empty() {
        metrics.dropped.inc();
        warn!(name = %metric.name, "dropped metric: no fields");
        metrics.filter_time.inc_by(started.elapsed().as_secs_f64());
        return None;
    }

    let mut scrubbed = Metric {
        timestamp: metric.timestamp,
        ..Metric::default()
    };

    let name = if normalize {
        metric.name.to_lowercase()
    } else {
        metric.name
    };
    scrubbed.name = if ALLOWED_NAMES.is_match(&name) {
        name
    } else {
        metrics.filter_steps.inc();
        REPLACE_CHARS.replace_all(&name, "_").into_owned()
    };

    for (key, value) in metric.tags {
        let (mut key, value) = if normalize {
            (key.to_lowercase(), value.to_lowercase())
        } else {
            (key, value)
        };
        if !ALLOWED_TAG_KEYS.is_match(&key) {
            metrics.filter_steps.inc();
            key = REPLACE_CHARS.replace_all(&key, "_").into_owned();
        }
        // double-underscore tag keys are reserved for internal prometheus
        // use, drop the tag but keep the record
        if key.starts_with("__") {
            metrics.filter_steps.inc();
        } else {
            scrubbed.tags.insert(key, value);
        }
    }

    for (key, value) in metric.fields {
        let mut key = if normalize { key.to_lowercase() } else { key };
        if !ALLOWED_FIELDS.is_match(&key) {
            metrics.filter_steps.inc();
            key = REPLACE_CHARS.replace_all(&key, "_").into_owned();
        }
        scrubbed.fields.insert(key, value);
    }

    metrics.metrics_counted.inc_by(scrubbed.fields.len() as u64);
    metrics.filter_time.inc_by(started.elapsed().as_secs_f64());
    Some(scrubbed)
}

/// One filter worker between the influx decoders and the output stage.
pub struct FilterWorker {
    worker: usize,
    normalize: bool,
    metrics: Arc<RelayMetrics>,
}

impl FilterWorker {
    pub fn new(worker: usize, normalize: bool, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            worker,
            normalize,
            metrics,
        }
    }

    pub async fn run(
        self,
        input: flume::Receiver<Metric>,
        output: flume::Sender<Metric>,
        cancel: CancellationToken,
    ) {
        info!(worker = self.worker, "filter worker starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker = self.worker, "closing filter worker, draining input");
                    while let Ok(metric) = input.recv_async().await {
                        if !self.forward(metric, &output).await {
                            return;
                        }
                    }
                    break;
                }
                metric = input.recv_async() => match metric {
                    Ok(metric) => {
                        if !self.forward(metric, &output).await {
                            return;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
        info!(worker = self.worker, "filter worker stopped");
    }

    async fn forward(&self, metric: Metric, output: &flume::Sender<Metric>) -> bool {
        if let Some(scrubbed) = scrub(metric, self.normalize, &self.metrics) {
            if output.send_async(scrubbed).await.is_err() {
                warn!(worker = self.worker, "output queue closed, stopping filter worker");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::FieldValue;
    use prometheus_client::registry::Registry;
    use std::collections::BTreeMap;

    fn test_metrics() -> Arc<RelayMetrics> {
        Arc::new(RelayMetrics::new(&mut Registry::default()))
    }

    fn sample() -> Metric {
        Metric {
            name: "test_metric".to_string(),
            tags: BTreeMap::from([("tag".to_string(), "Value".to_string())]),
            fields: BTreeMap::from([("field".to_string(), FieldValue::Float(1.0))]),
            timestamp: 1637090544726635243,
        }
    }

    #[test]
    fn conformant_metric_passes_unchanged() {
        let metrics = test_metrics();
        let out = scrub(sample(), false, &metrics).unwrap();
        assert_eq!(out, sample());
        assert_eq!(metrics.dropped.get(), 0);
        assert_eq!(metrics.filter_steps.get(), 0);
        assert_eq!(metrics.metrics_counted.get(), 1);
    }

    #[test]
    fn drops_bad_first_character() {
        let metrics = test_metrics();
        let mut metric = sample();
        metric.name = "_test_metric".to_string();
        assert!(scrub(metric, false, &metrics).is_none());
        assert_eq!(metrics.dropped.get(), 1);
    }

    #[test]
    fn drops_metric_without_fields() {
        let metrics = test_metrics();
        let mut metric = sample();
        metric.fields.clear();
        assert!(scrub(metric, false, &metrics).is_none());
        assert_eq!(metrics.dropped.get(), 1);
    }

    #[test]
    fn normalizes_to_lowercase() {
        let metrics = test_metrics();
        let mut metric = sample();
        metric.name = "Test_Metric".to_string();
        let out = scrub(metric, true, &metrics).unwrap();
        assert_eq!(out.name, "test_metric");
        assert_eq!(out.tags["tag"], "value");
    }

    #[test]
    fn replaces_disallowed_characters() {
        let metrics = test_metrics();
        let metric = Metric {
            name: "test-metric".to_string(),
            tags: BTreeMap::from([("tag 1".to_string(), "Value".to_string())]),
            fields: BTreeMap::from([("field.1".to_string(), FieldValue::Float(1.0))]),
            timestamp: 7,
        };
        let out = scrub(metric, false, &metrics).unwrap();
        assert_eq!(out.name, "test_metric");
        assert!(out.tags.contains_key("tag_1"));
        assert!(out.fields.contains_key("field_1"));
        assert_eq!(out.timestamp, 7);
        assert_eq!(metrics.filter_steps.get(), 3);
    }

    #[test]
    fn drops_reserved_tag_keys_but_keeps_record() {
        let metrics = test_metrics();
        let mut metric = sample();
        metric
            .tags
            .insert("__internal".to_string(), "x".to_string());
        let out = scrub(metric, false, &metrics).unwrap();
        assert!(!out.tags.contains_key("__internal"));
        assert!(out.tags.contains_key("tag"));
        assert_eq!(metrics.filter_steps.get(), 1);
        assert_eq!(metrics.dropped.get(), 0);
    }

    #[test]
    fn colon_survives_in_names_and_field_keys() {
        let metrics = test_metrics();
        let metric = Metric {
            name: "job:rate".to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::from([("sum:total".to_string(), FieldValue::Integer(1))]),
            timestamp: 0,
        };
        let out = scrub(metric, false, &metrics).unwrap();
        assert_eq!(out.name, "job:rate");
        assert!(out.fields.contains_key("sum:total"));
        assert_eq!(metrics.filter_steps.get(), 0);
    }

    #[test]
    fn normalization_roundtrip_is_identity_on_conformant_input() {
        let metrics = test_metrics();
        let metric = Metric {
            name: "already_lower".to_string(),
            tags: BTreeMap::from([("host".to_string(), "a1".to_string())]),
            fields: BTreeMap::from([("value".to_string(), FieldValue::Float(2.0))]),
            timestamp: 9,
        };
        let out = scrub(metric.clone(), true, &metrics).unwrap();
        assert_eq!(out, metric);
        assert_eq!(metrics.filter_steps.get(), 0);
    }

    #[tokio::test]
    async fn worker_drains_input_after_cancellation() {
        let metrics = test_metrics();
        let (in_tx, in_rx) = flume::bounded::<Metric>(16);
        let (out_tx, out_rx) = flume::bounded::<Metric>(16);
        let cancel = CancellationToken::new();

        for _ in 0..6 {
            in_tx.send(sample()).unwrap();
        }
        cancel.cancel();

        let worker = FilterWorker::new(1, false, metrics);
        let handle = tokio::spawn(worker.run(in_rx, out_tx, cancel));
        drop(in_tx);
        handle.await.unwrap();

        assert_eq!(out_rx.drain().count(), 6);
    }

    #[tokio::test]
    async fn worker_drops_and_forwards() {
        let metrics = test_metrics();
        let (in_tx, in_rx) = flume::bounded::<Metric>(8);
        let (out_tx, out_rx) = flume::bounded::<Metric>(8);

        in_tx.send(sample()).unwrap();
        let mut bad = sample();
        bad.name = "9starts_with_digit".to_string();
        in_tx.send(bad).unwrap();
        drop(in_tx);

        let worker = FilterWorker::new(1, false, metrics.clone());
        worker.run(in_rx, out_tx, CancellationToken::new()).await;

        let forwarded: Vec<Metric> = out_rx.drain().collect();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(metrics.dropped.get(), 1);
    }
}
