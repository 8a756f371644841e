//! Time-series endpoint write client
//!
//! Thin wrapper over an HTTP client for the v2 batch-write API. Bodies
//! are line-protocol text, gzip-compressed; failed requests retry with
//! exponential backoff up to the configured attempt limit before the
//! caller dead-letters the batch.

use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

/// Base delay for the retry backoff; doubles per attempt.
const RETRY_BASE_BACKOFF_MS: u64 = 100;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("failed to build HTTP client: {0}")]
    Build(reqwest::Error),

    #[error("batch write request failed: {0}")]
    Request(reqwest::Error),

    #[error("batch write rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("failed to compress batch body: {0}")]
    Compress(std::io::Error),
}

/// One write client per output worker; never shared.
pub struct WriteClient {
    http: reqwest::Client,
    endpoint: String,
    org: String,
    bucket: String,
    max_retries: u32,
}

impl WriteClient {
    pub fn new(
        base_url: &str,
        org: &str,
        bucket: &str,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self, WriteError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .gzip(true)
            .user_agent(concat!("cairn/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(WriteError::Build)?;
        Ok(Self {
            http,
            endpoint: format!("{}/api/v2/write", base_url.trim_end_matches('/')),
            org: org.to_string(),
            bucket: bucket.to_string(),
            max_retries,
        })
    }

    /// Write one batch body (newline-joined line protocol), retrying up
    /// to `max_retries` times before reporting the last error.
    pub async fn write_batch(&self, lines: &str) -> Result<(), WriteError> {
        let body = compress(lines.as_bytes())?;
        let mut attempt: u32 = 0;
        loop {
            match self.send(body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let backoff =
                        Duration::from_millis(RETRY_BASE_BACKOFF_MS << attempt.min(10));
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "batch write failed, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&self, body: Vec<u8>) -> Result<(), WriteError> {
        let response = self
            .http
            .post(&self.endpoint)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(CONTENT_ENCODING, "gzip")
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(WriteError::Request)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(WriteError::Rejected { status, body })
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, WriteError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(WriteError::Compress)?;
    encoder.finish().map_err(WriteError::Compress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn compress_roundtrip() {
        let body = "m,host=a f=1 10\nm,host=b f=2 20";
        let compressed = compress(body.as_bytes()).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn endpoint_composition_strips_trailing_slash() {
        let client = WriteClient::new("http://tsdb:8086/", "org", "db", 5, 0).unwrap();
        assert_eq!(client.endpoint, "http://tsdb:8086/api/v2/write");
    }
}
