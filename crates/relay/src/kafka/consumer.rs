//! Broker ingest workers
//!
//! Each worker joins the consumer group, subscribes to its format's topic
//! patterns, and forwards raw record payloads to the decode queue. Offset
//! commits stay on the client's auto-commit; rebalances are logged and
//! left to the client to apply. Broker-level errors are not fatal, the
//! client recovers on its own.

use std::sync::Arc;
use std::time::Instant;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientContext, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use cairn_config::OffsetReset;

use super::TlsConfig;
use crate::metrics::RelayMetrics;

/// Connection parameters for one ingest worker.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub worker: usize,
    /// Anchored topic patterns for one wire format.
    pub topics: Vec<String>,
    /// Comma-joined broker list.
    pub brokers: String,
    pub group: String,
    /// Base client id; the worker index is appended.
    pub client_id: String,
    pub session_timeout_ms: u64,
    pub offset_reset: OffsetReset,
    pub tls: Option<TlsConfig>,
}

/// Logs partition assignment changes; the client itself applies them.
struct IngestContext {
    worker: usize,
}

impl ClientContext for IngestContext {}

impl ConsumerContext for IngestContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                debug!(worker = self.worker, ?partitions, "assigning partitions");
            }
            Rebalance::Revoke(partitions) => {
                debug!(worker = self.worker, ?partitions, "revoking partitions");
            }
            Rebalance::Error(e) => {
                error!(worker = self.worker, error = %e, "rebalance error");
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Error(e) = rebalance {
            error!(worker = self.worker, error = %e, "post-rebalance error");
        }
    }
}

fn build_consumer(config: &ConsumerConfig) -> Result<StreamConsumer<IngestContext>, KafkaError> {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set(
            "client.id",
            format!("{}-{}", config.client_id, config.worker),
        )
        .set("group.id", &config.group)
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("enable.partition.eof", "true")
        .set("enable.auto.commit", "true")
        .set("auto.offset.reset", config.offset_reset.as_str());
    if let Some(tls) = &config.tls {
        tls.apply(&mut client);
    }
    client.create_with_context(IngestContext {
        worker: config.worker,
    })
}

/// Run one ingest worker until cancelled.
///
/// A consumer that cannot be built or subscribed is fatal: without ingest
/// the relay is not doing its job, and the failure is configuration
/// level.
pub async fn run_ingest(
    config: ConsumerConfig,
    output: flume::Sender<Vec<u8>>,
    cancel: CancellationToken,
    metrics: Arc<RelayMetrics>,
) {
    info!(worker = config.worker, "ingest worker starting");
    let consumer = match build_consumer(&config) {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(worker = config.worker, error = %e, "could not build broker consumer");
            std::process::exit(1);
        }
    };

    let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
    if let Err(e) = consumer.subscribe(&topics) {
        error!(worker = config.worker, error = %e, topics = ?config.topics, "could not subscribe to topics");
        std::process::exit(1);
    }
    info!(
        worker = config.worker,
        brokers = %config.brokers,
        topics = ?config.topics,
        "consumer started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(worker = config.worker, "closing ingest worker");
                break;
            }
            result = consumer.recv() => {
                let started = Instant::now();
                match result {
                    Ok(message) => {
                        metrics.ingested.inc();
                        let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                        if output.send_async(payload).await.is_err() {
                            info!(worker = config.worker, "decode queue closed, stopping ingest worker");
                            break;
                        }
                    }
                    Err(KafkaError::PartitionEOF(partition)) => {
                        debug!(worker = config.worker, partition, "end of partition");
                    }
                    Err(e) => {
                        // the client recovers from transient broker errors
                        // on its own
                        error!(worker = config.worker, error = %e, "broker error, recovering");
                    }
                }
                metrics.ingest_time.inc_by(started.elapsed().as_secs_f64());
            }
        }
    }
}
