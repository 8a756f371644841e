//! Relay counters and gauges
//!
//! A single [`RelayMetrics`] cell struct is constructed against one
//! registry at startup and shared across every stage; stages bump the
//! atomic cells directly instead of looking metrics up by name.

mod server;

pub use server::{serve_stats, QueueDepths};

use std::sync::atomic::AtomicU64;
use std::time::Instant;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use thiserror::Error;

/// Counter accumulating fractional seconds.
pub type FloatCounter = Counter<f64, AtomicU64>;

type FloatGauge = Gauge<f64, AtomicU64>;

/// Errors from the stats endpoint.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to bind stats listener on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("stats server error: {0}")]
    Serve(std::io::Error),
}

/// Process-wide counters and gauges for the relay.
pub struct RelayMetrics {
    /// Records dropped during filtering or decoding.
    pub dropped: Counter,
    /// Records collected from the broker.
    pub ingested: Counter,
    /// Records published to the dead-letter topic.
    pub failed: Counter,
    /// Scrubbing substitutions applied during filtering.
    pub filter_steps: Counter,
    /// Individual field values counted on filtered records.
    pub metrics_counted: Counter,
    /// Non-empty payloads handed to a decoder.
    pub received: Counter,
    /// Records written to a time-series endpoint.
    pub sent: Counter,

    /// Seconds spent publishing to the dead-letter topic.
    pub failed_write_time: FloatCounter,
    /// Seconds spent filtering.
    pub filter_time: FloatCounter,
    /// Seconds spent consuming from the broker.
    pub ingest_time: FloatCounter,
    /// Seconds spent batching and writing output.
    pub output_time: FloatCounter,
    /// Seconds spent decoding.
    pub process_time: FloatCounter,

    uptime: FloatGauge,
    dead_letter_queue_len: Gauge,
    filter_queue_len: Gauge,
    output_queue_len: Gauge,
    influx_ingest_queue_len: Gauge,
    prometheus_ingest_queue_len: Gauge,

    started: Instant,
}

impl RelayMetrics {
    /// Create the metric cells and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            dropped: Counter::default(),
            ingested: Counter::default(),
            failed: Counter::default(),
            filter_steps: Counter::default(),
            metrics_counted: Counter::default(),
            received: Counter::default(),
            sent: Counter::default(),
            failed_write_time: FloatCounter::default(),
            filter_time: FloatCounter::default(),
            ingest_time: FloatCounter::default(),
            output_time: FloatCounter::default(),
            process_time: FloatCounter::default(),
            uptime: FloatGauge::default(),
            dead_letter_queue_len: Gauge::default(),
            filter_queue_len: Gauge::default(),
            output_queue_len: Gauge::default(),
            influx_ingest_queue_len: Gauge::default(),
            prometheus_ingest_queue_len: Gauge::default(),
            started: Instant::now(),
        };

        registry.register(
            "dropped_msg",
            "Messages dropped during filtering",
            metrics.dropped.clone(),
        );
        registry.register(
            "kafka_msg",
            "Messages collected from the broker",
            metrics.ingested.clone(),
        );
        registry.register(
            "failed_msg",
            "Messages published to the dead letter queue",
            metrics.failed.clone(),
        );
        registry.register(
            "filtered_msg",
            "Messages altered in some way during filtering",
            metrics.filter_steps.clone(),
        );
        registry.register(
            "metrics",
            "Individual metrics counted in incoming messages",
            metrics.metrics_counted.clone(),
        );
        registry.register(
            "received_msg",
            "Messages handed to a decoder",
            metrics.received.clone(),
        );
        registry.register(
            "sent_msg",
            "Messages sent to a time-series endpoint",
            metrics.sent.clone(),
        );
        registry.register(
            "failed_write_time_secs",
            "Time spent writing to the dead letter queue",
            metrics.failed_write_time.clone(),
        );
        registry.register(
            "filter_time_secs",
            "Time spent filtering",
            metrics.filter_time.clone(),
        );
        registry.register(
            "ingest_time_secs",
            "Time spent collecting from the broker",
            metrics.ingest_time.clone(),
        );
        registry.register(
            "output_time_secs",
            "Time spent writing output batches",
            metrics.output_time.clone(),
        );
        registry.register(
            "process_time_secs",
            "Time spent decoding payloads",
            metrics.process_time.clone(),
        );
        registry.register(
            "app_uptime_secs_total",
            "Seconds since relay start",
            metrics.uptime.clone(),
        );
        registry.register(
            "dead_letter_queue_len",
            "Current dead letter queue length",
            metrics.dead_letter_queue_len.clone(),
        );
        registry.register(
            "filter_queue_len",
            "Current filter queue length",
            metrics.filter_queue_len.clone(),
        );
        registry.register(
            "output_queue_len",
            "Current output queue length",
            metrics.output_queue_len.clone(),
        );
        registry.register(
            "influx_ingest_queue_len",
            "Current influx-format ingest queue length",
            metrics.influx_ingest_queue_len.clone(),
        );
        registry.register(
            "prometheus_ingest_queue_len",
            "Current prometheus-format ingest queue length",
            metrics.prometheus_ingest_queue_len.clone(),
        );

        metrics
    }

    /// Refresh the gauges that are sampled at scrape time.
    pub(crate) fn refresh_gauges(&self, queues: &[QueueDepths]) {
        self.uptime.set(self.started.elapsed().as_secs_f64());

        let mut dead_letter = 0i64;
        let mut filter = 0i64;
        let mut output = 0i64;
        let mut influx = 0i64;
        let mut prometheus = 0i64;
        for queue in queues {
            dead_letter += queue.dead_letter.len() as i64;
            filter += queue.filter.len() as i64;
            output += queue.output.len() as i64;
            influx += queue.influx_json.len() as i64;
            prometheus += queue.prometheus.len() as i64;
        }
        self.dead_letter_queue_len.set(dead_letter);
        self.filter_queue_len.set(filter);
        self.output_queue_len.set(output);
        self.influx_ingest_queue_len.set(influx);
        self.prometheus_ingest_queue_len.set(prometheus);
    }
}
