//! Per-write-path pipeline container
//!
//! Owns the bounded queues, cancellation scopes, and worker handles of
//! one write path. Stages start leaves-first so every consumer is ready
//! before its producers, and shut down in the reverse order so upstream
//! stages always finish before the stages they feed.
//!
//! Queue closure falls out of ownership: the container keeps only
//! receiver handles, so once a stage's workers are joined their senders
//! are gone and the downstream queue disconnects after draining.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cairn_config::{RelayConfig, WritePathConfig};
use cairn_types::Metric;

use crate::decode::{DecodeWorker, WireFormat};
use crate::filter::FilterWorker;
use crate::kafka::{run_dead_letter, run_ingest, ConsumerConfig, DeadLetterConfig, TlsConfig};
use crate::metrics::{QueueDepths, RelayMetrics};
use crate::output::{run_output, OutputConfig};

/// One running pipeline and the handles needed to stop it cleanly.
pub struct Pipeline {
    url: String,

    ingest_cancel: CancellationToken,
    decode_cancel: CancellationToken,
    filter_cancel: CancellationToken,
    output_cancel: CancellationToken,
    failed_cancel: CancellationToken,

    ingest_handles: Vec<JoinHandle<()>>,
    decode_handles: Vec<JoinHandle<()>>,
    filter_handles: Vec<JoinHandle<()>>,
    output_handles: Vec<JoinHandle<()>>,
    failed_handles: Vec<JoinHandle<()>>,

    line_queue: flume::Receiver<Vec<u8>>,
    json_queue: flume::Receiver<Vec<u8>>,
    prom_queue: flume::Receiver<Vec<u8>>,
    filter_queue: flume::Receiver<Metric>,
    output_queue: flume::Receiver<Metric>,
    failed_queue: flume::Receiver<String>,
}

impl Pipeline {
    /// Build and start the pipeline for one write path.
    pub fn spawn(
        config: &RelayConfig,
        path: &WritePathConfig,
        metrics: Arc<RelayMetrics>,
    ) -> Pipeline {
        let url = path.output_url();
        info!(url = %url, "output URL");

        let tls = TlsConfig::from_config(config);

        let (line_tx, line_rx) = flume::bounded::<Vec<u8>>(path.channel_size);
        let (json_tx, json_rx) = flume::bounded::<Vec<u8>>(path.channel_size);
        let (prom_tx, prom_rx) = flume::bounded::<Vec<u8>>(path.channel_size);
        let (filter_tx, filter_rx) = flume::bounded::<Metric>(path.channel_size);
        let (output_tx, output_rx) = flume::bounded::<Metric>(path.channel_size);
        let (failed_tx, failed_rx) = flume::bounded::<String>(path.channel_size);

        let root = CancellationToken::new();
        let ingest_cancel = root.child_token();
        let decode_cancel = root.child_token();
        let filter_cancel = root.child_token();
        let output_cancel = root.child_token();
        let failed_cancel = root.child_token();

        // dead-letter worker comes up first; one per write path is
        // enough, the volume should stay low
        let failed_handles = vec![tokio::spawn(run_dead_letter(
            DeadLetterConfig {
                brokers: config.broker_list(),
                topic: config.failed_writes_topic.clone(),
                compression: config.failed_writes_compression_type.clone(),
                write_path: url.clone(),
                tsd_org: path.tsd_database_org.clone(),
                tsd_db: path.tsd_database_name.clone(),
                tls: tls.clone(),
            },
            failed_rx.clone(),
            failed_cancel.clone(),
            metrics.clone(),
        ))];

        // decoders; influx formats feed the filter stage, the prometheus
        // format is already conformant and goes straight to output
        let mut decode_handles = Vec::new();
        for worker in 1..=path.processor_threads {
            if !path.influx_json_topics.is_empty() {
                decode_handles.push(tokio::spawn(
                    DecodeWorker::new(
                        WireFormat::InfluxJson,
                        worker,
                        config.normalize_metrics,
                        path.flip_single_fields,
                        metrics.clone(),
                    )
                    .run(json_rx.clone(), filter_tx.clone(), decode_cancel.clone()),
                ));
            }
            if !path.prometheus_topics.is_empty() {
                decode_handles.push(tokio::spawn(
                    DecodeWorker::new(
                        WireFormat::PromJson,
                        worker,
                        config.normalize_metrics,
                        path.flip_single_fields,
                        metrics.clone(),
                    )
                    .run(prom_rx.clone(), output_tx.clone(), decode_cancel.clone()),
                ));
            }
            if !path.influx_line_topics.is_empty() {
                decode_handles.push(tokio::spawn(
                    DecodeWorker::new(
                        WireFormat::InfluxLine,
                        worker,
                        config.normalize_metrics,
                        path.flip_single_fields,
                        metrics.clone(),
                    )
                    .run(line_rx.clone(), filter_tx.clone(), decode_cancel.clone()),
                ));
            }
        }

        let mut filter_handles = Vec::new();
        for worker in 1..=path.filter_threads {
            filter_handles.push(tokio::spawn(
                FilterWorker::new(worker, config.normalize_metrics, metrics.clone()).run(
                    filter_rx.clone(),
                    output_tx.clone(),
                    filter_cancel.clone(),
                ),
            ));
        }

        let mut output_handles = Vec::new();
        for worker in 1..=path.write_threads {
            output_handles.push(tokio::spawn(run_output(
                OutputConfig {
                    worker,
                    url: url.clone(),
                    org: path.tsd_database_org.clone(),
                    database: path.tsd_database_name.clone(),
                    send_batch: path.send_batch,
                    flush_time: path.flush_time,
                    write_timeout: path.write_timeout,
                    max_retries: path.max_retries,
                },
                output_rx.clone(),
                failed_tx.clone(),
                output_cancel.clone(),
                metrics.clone(),
            )));
        }

        // ingest last, so the rest of the pipeline is ready to receive
        // before we start consuming
        let mut ingest_handles = Vec::new();
        for worker in 1..=path.read_threads {
            let consumer_config = |topics: &[String], worker| ConsumerConfig {
                worker,
                topics: topics.to_vec(),
                brokers: config.broker_list(),
                group: config.consumer_group.clone(),
                client_id: config.client_id.clone(),
                session_timeout_ms: config.kafka_session_timeout,
                offset_reset: config.starting_offset_type,
                tls: tls.clone(),
            };
            if !path.influx_json_topics.is_empty() {
                ingest_handles.push(tokio::spawn(run_ingest(
                    consumer_config(&path.influx_json_topics, worker),
                    json_tx.clone(),
                    ingest_cancel.clone(),
                    metrics.clone(),
                )));
            }
            if !path.influx_line_topics.is_empty() {
                ingest_handles.push(tokio::spawn(run_ingest(
                    consumer_config(&path.influx_line_topics, worker),
                    line_tx.clone(),
                    ingest_cancel.clone(),
                    metrics.clone(),
                )));
            }
            if !path.prometheus_topics.is_empty() {
                ingest_handles.push(tokio::spawn(run_ingest(
                    consumer_config(&path.prometheus_topics, worker),
                    prom_tx.clone(),
                    ingest_cancel.clone(),
                    metrics.clone(),
                )));
            }
        }

        // only worker-held senders remain; queues close as stages exit
        Pipeline {
            url,
            ingest_cancel,
            decode_cancel,
            filter_cancel,
            output_cancel,
            failed_cancel,
            ingest_handles,
            decode_handles,
            filter_handles,
            output_handles,
            failed_handles,
            line_queue: line_rx,
            json_queue: json_rx,
            prom_queue: prom_rx,
            filter_queue: filter_rx,
            output_queue: output_rx,
            failed_queue: failed_rx,
        }
    }

    /// Depth handles for the stats endpoint.
    pub fn queue_depths(&self) -> QueueDepths {
        QueueDepths {
            influx_json: self.json_queue.clone(),
            prometheus: self.prom_queue.clone(),
            filter: self.filter_queue.clone(),
            output: self.output_queue.clone(),
            dead_letter: self.failed_queue.clone(),
        }
    }

    /// Stop the pipeline without losing accepted records: cancel each
    /// stage in dependency order and wait for it to drain before moving
    /// downstream.
    pub async fn shutdown(self) {
        info!(url = %self.url, "closing ingest workers for write path");
        self.ingest_cancel.cancel();
        join_all(self.ingest_handles).await;

        info!(
            influx_queue = self.json_queue.len(),
            line_queue = self.line_queue.len(),
            prometheus_queue = self.prom_queue.len(),
            "waiting on decode queues to drain"
        );
        self.decode_cancel.cancel();
        join_all(self.decode_handles).await;

        info!(
            filter_queue = self.filter_queue.len(),
            "waiting on filter queue to drain"
        );
        self.filter_cancel.cancel();
        join_all(self.filter_handles).await;

        info!(
            output_queue = self.output_queue.len(),
            "waiting on output queue to drain"
        );
        self.output_cancel.cancel();
        join_all(self.output_handles).await;

        info!(
            failed_queue = self.failed_queue.len(),
            "waiting on dead-letter queue to drain"
        );
        self.failed_cancel.cancel();
        join_all(self.failed_handles).await;

        info!(url = %self.url, "write path drained");
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "pipeline worker panicked");
        }
    }
}
