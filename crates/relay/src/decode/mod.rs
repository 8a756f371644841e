//! Format-specific decoders
//!
//! Three wire formats share the same worker shape: read raw broker
//! payloads from a bounded queue, decode them to [`Metric`] records, and
//! forward downstream. Malformed payloads are dropped and counted; an
//! unparseable adapter timestamp is the one fatal decoder path, because
//! it means the upstream contract is broken.

mod influx_json;
mod line;
mod prom_json;

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cairn_types::Metric;

use crate::metrics::RelayMetrics;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid line protocol: {0}")]
    Line(String),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid sample timestamp {timestamp:?}: {source}")]
    Timestamp {
        timestamp: String,
        source: chrono::ParseError,
    },
}

impl DecodeError {
    /// Whether this error indicates an upstream contract violation the
    /// relay refuses to run past.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::Timestamp { .. })
    }
}

/// The wire formats a decode pool can consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    InfluxLine,
    InfluxJson,
    PromJson,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::InfluxLine => "influx-line",
            WireFormat::InfluxJson => "influx-json",
            WireFormat::PromJson => "prometheus",
        }
    }
}

/// Rewrite a record with fewer than two fields into the sink-friendly
/// naming convention: the metric becomes `<name>_<fieldKey>` and the sole
/// field is renamed `value`. Tags and timestamp are preserved.
pub(crate) fn flip_single_field(metric: Metric) -> Metric {
    if metric.fields.len() >= 2 {
        return metric;
    }
    let mut flipped = Metric {
        name: metric.name,
        tags: metric.tags,
        timestamp: metric.timestamp,
        ..Metric::default()
    };
    if let Some((key, value)) = metric.fields.into_iter().next() {
        flipped.name.push('_');
        flipped.name.push_str(&key);
        flipped.fields.insert("value".to_string(), value);
    }
    flipped
}

/// One decoder worker: consumes raw payloads for a single wire format and
/// forwards decoded metrics downstream (the filter queue for the influx
/// formats, the output queue for the Prometheus adapter format).
pub struct DecodeWorker {
    format: WireFormat,
    worker: usize,
    normalize: bool,
    flip_single_fields: bool,
    metrics: Arc<RelayMetrics>,
}

impl DecodeWorker {
    pub fn new(
        format: WireFormat,
        worker: usize,
        normalize: bool,
        flip_single_fields: bool,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            format,
            worker,
            normalize,
            flip_single_fields,
            metrics,
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<Metric>, DecodeError> {
        match self.format {
            WireFormat::InfluxLine => line::decode(payload, self.flip_single_fields),
            WireFormat::InfluxJson => influx_json::decode(payload, self.flip_single_fields),
            WireFormat::PromJson => {
                prom_json::decode(payload, self.normalize, self.flip_single_fields)
            }
        }
    }

    fn process(&self, payload: &[u8]) -> Vec<Metric> {
        let started = Instant::now();

        let decoded = if payload.is_empty() {
            warn!(
                worker = self.worker,
                format = self.format.as_str(),
                "empty payload received from broker"
            );
            Vec::new()
        } else {
            self.metrics.received.inc();
            match self.decode(payload) {
                Ok(metrics) => metrics,
                Err(e) if e.is_fatal() => {
                    error!(
                        worker = self.worker,
                        format = self.format.as_str(),
                        error = %e,
                        payload = %String::from_utf8_lossy(payload),
                        "unrecoverable decode failure"
                    );
                    std::process::exit(1);
                }
                Err(e) => {
                    self.metrics.dropped.inc();
                    error!(
                        worker = self.worker,
                        format = self.format.as_str(),
                        error = %e,
                        payload = %String::from_utf8_lossy(payload),
                        "could not decode payload"
                    );
                    Vec::new()
                }
            }
        };

        self.metrics
            .process_time
            .inc_by(started.elapsed().as_secs_f64());
        decoded
    }

    /// Run until the input queue closes or cancellation is observed; on
    /// cancellation keep draining the input until it is empty.
    pub async fn run(
        self,
        input: flume::Receiver<Vec<u8>>,
        output: flume::Sender<Metric>,
        cancel: CancellationToken,
    ) {
        info!(
            worker = self.worker,
            format = self.format.as_str(),
            "decode worker starting"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(
                        worker = self.worker,
                        format = self.format.as_str(),
                        "closing decode worker, draining input"
                    );
                    while let Ok(payload) = input.recv_async().await {
                        if !self.forward(&payload, &output).await {
                            return;
                        }
                    }
                    break;
                }
                payload = input.recv_async() => match payload {
                    Ok(payload) => {
                        if !self.forward(&payload, &output).await {
                            return;
                        }
                    }
                    Err(_) => break,
                },
            }
        }
        info!(
            worker = self.worker,
            format = self.format.as_str(),
            "decode worker stopped"
        );
    }

    async fn forward(&self, payload: &[u8], output: &flume::Sender<Metric>) -> bool {
        for metric in self.process(payload) {
            if output.send_async(metric).await.is_err() {
                warn!(
                    worker = self.worker,
                    format = self.format.as_str(),
                    "downstream queue closed, stopping decode worker"
                );
                return false;
            }
        }
        true
    }
}
