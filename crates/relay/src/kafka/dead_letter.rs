//! Dead-letter publisher
//!
//! A single worker per write path wraps failed-write records in the
//! dead-letter envelope and publishes them back to the broker. A publish
//! failure is fatal: if the broker is unreachable the relay would be
//! silently losing failure data, which it refuses to do.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cairn_types::DeadLetterEnvelope;

use super::TlsConfig;
use crate::metrics::RelayMetrics;

/// How long to wait for in-flight publishes when shutting down.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(10);

/// Producer parameters plus the envelope context identifying the write
/// path the records failed against.
#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub brokers: String,
    pub topic: String,
    pub compression: String,
    pub write_path: String,
    pub tsd_org: String,
    pub tsd_db: String,
    pub tls: Option<TlsConfig>,
}

fn build_producer(config: &DeadLetterConfig) -> Result<FutureProducer, rdkafka::error::KafkaError> {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("compression.type", &config.compression);
    if let Some(tls) = &config.tls {
        tls.apply(&mut client);
    }
    client.create()
}

/// Run the dead-letter worker until its input drains, then flush the
/// producer with a bounded timeout.
pub async fn run_dead_letter(
    config: DeadLetterConfig,
    input: flume::Receiver<String>,
    cancel: CancellationToken,
    metrics: Arc<RelayMetrics>,
) {
    info!(topic = %config.topic, "dead-letter worker starting");
    let producer = match build_producer(&config) {
        Ok(producer) => producer,
        Err(e) => {
            error!(error = %e, "could not build dead-letter producer");
            std::process::exit(1);
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("closing dead-letter worker, draining input");
                while let Ok(message) = input.recv_async().await {
                    publish(&producer, &config, &metrics, message).await;
                }
                if let Err(e) = producer.flush(Timeout::After(SHUTDOWN_FLUSH)) {
                    warn!(error = %e, "dead-letter producer flush timed out");
                }
                break;
            }
            message = input.recv_async() => match message {
                Ok(message) => publish(&producer, &config, &metrics, message).await,
                Err(_) => {
                    if let Err(e) = producer.flush(Timeout::After(SHUTDOWN_FLUSH)) {
                        warn!(error = %e, "dead-letter producer flush timed out");
                    }
                    break;
                }
            },
        }
    }
    info!("dead-letter worker stopped");
}

async fn publish(
    producer: &FutureProducer,
    config: &DeadLetterConfig,
    metrics: &RelayMetrics,
    message: String,
) {
    let started = Instant::now();
    let envelope = DeadLetterEnvelope {
        message,
        write_path: config.write_path.clone(),
        tsd_org: config.tsd_org.clone(),
        tsd_db: config.tsd_db.clone(),
    };
    let payload = match serde_json::to_vec(&envelope) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "could not serialize dead-letter envelope");
            std::process::exit(1);
        }
    };

    let record = FutureRecord::<(), _>::to(&config.topic).payload(&payload);
    match producer.send(record, Timeout::Never).await {
        Ok(_) => {
            metrics.failed.inc();
        }
        Err((e, _)) => {
            error!(error = %e, topic = %config.topic, "could not publish to dead-letter topic");
            std::process::exit(1);
        }
    }
    metrics
        .failed_write_time
        .inc_by(started.elapsed().as_secs_f64());
}
