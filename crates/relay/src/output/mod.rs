//! Batching output stage
//!
//! Each output worker owns a batch buffer and flushes it when either the
//! size threshold is reached or the wall-clock threshold has elapsed
//! since the previous flush. Flush checks run when a record arrives (the
//! stage has no background timer) plus once more after the input queue
//! drains at shutdown, so nothing is left behind.
//!
//! A batch whose write fails after the client's retries is taken apart:
//! every point that still carries tags is serialized back to line
//! protocol and handed to the dead-letter queue; untagged points are
//! discarded so empty records never reach the dead-letter topic.

mod client;

pub use client::{WriteClient, WriteError};

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cairn_types::Metric;

use crate::metrics::RelayMetrics;

/// Per-worker output configuration, resolved from the write path.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub worker: usize,
    /// Composed output URL of the write path.
    pub url: String,
    pub org: String,
    pub database: String,
    /// Flush when the batch reaches this many records.
    pub send_batch: usize,
    /// Flush when this many seconds (fractional) have elapsed since the
    /// last flush.
    pub flush_time: f64,
    /// HTTP request timeout in seconds.
    pub write_timeout: u64,
    pub max_retries: u32,
}

/// Run one output worker until its input drains.
///
/// The write client is constructed here so every worker owns its own
/// connection pool; a client that cannot be built means the write path
/// configuration is unusable, which is fatal.
pub async fn run_output(
    config: OutputConfig,
    input: flume::Receiver<Metric>,
    failed: flume::Sender<String>,
    cancel: CancellationToken,
    metrics: Arc<RelayMetrics>,
) {
    info!(worker = config.worker, url = %config.url, "output worker starting");
    let client = match WriteClient::new(
        &config.url,
        &config.org,
        &config.database,
        config.write_timeout,
        config.max_retries,
    ) {
        Ok(client) => client,
        Err(e) => {
            error!(worker = config.worker, error = %e, "could not build write client");
            std::process::exit(1);
        }
    };

    let worker = OutputWorker {
        config,
        client,
        metrics,
        batch: Vec::new(),
        last_flush: Instant::now(),
    };
    worker.run(input, failed, cancel).await;
}

struct OutputWorker {
    config: OutputConfig,
    client: WriteClient,
    metrics: Arc<RelayMetrics>,
    batch: Vec<Metric>,
    last_flush: Instant,
}

impl OutputWorker {
    async fn run(
        mut self,
        input: flume::Receiver<Metric>,
        failed: flume::Sender<String>,
        cancel: CancellationToken,
    ) {
        self.batch = Vec::with_capacity(self.config.send_batch * 2);
        self.last_flush = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker = self.config.worker, "closing output worker, draining input");
                    while let Ok(metric) = input.recv_async().await {
                        self.process(metric, &failed).await;
                    }
                    // one last write so nothing is dropped on the floor
                    self.flush(&failed).await;
                    break;
                }
                metric = input.recv_async() => match metric {
                    Ok(metric) => self.process(metric, &failed).await,
                    Err(_) => {
                        self.flush(&failed).await;
                        break;
                    }
                },
            }
        }
        info!(worker = self.config.worker, "output worker stopped");
    }

    async fn process(&mut self, metric: Metric, failed: &flume::Sender<String>) {
        let started = Instant::now();
        self.batch.push(metric);

        let timed_out = self.last_flush.elapsed().as_secs_f64() > self.config.flush_time;
        if self.batch.len() >= self.config.send_batch || timed_out {
            self.flush(failed).await;
            self.last_flush = Instant::now();
        }
        self.metrics
            .output_time
            .inc_by(started.elapsed().as_secs_f64());
    }

    async fn flush(&mut self, failed: &flume::Sender<String>) {
        if self.batch.is_empty() {
            return;
        }

        let body = self
            .batch
            .iter()
            .map(Metric::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        match self.client.write_batch(&body).await {
            Ok(()) => {
                self.metrics.sent.inc_by(self.batch.len() as u64);
            }
            Err(e) => {
                error!(worker = self.config.worker, error = %e, "failed write");
                for point in &self.batch {
                    // untagged points would dead-letter as near-empty
                    // records; skip them
                    if point.tags.is_empty() {
                        continue;
                    }
                    if failed.send_async(point.to_line_protocol()).await.is_err() {
                        warn!(
                            worker = self.config.worker,
                            "dead-letter queue closed, discarding failed points"
                        );
                        break;
                    }
                }
            }
        }
        self.batch.clear();
    }
}
