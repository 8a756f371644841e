//! Configuration management for the cairn relay
//!
//! The relay is configured from a YAML file with `CAIRN_`-prefixed
//! environment overrides. Topic patterns that carry no regex markers are
//! anchored here so broker subscriptions match whole topic names by
//! default, and per-write-path thread counts fall back to half the host's
//! cores.

use std::path::Path;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Starting offset policy for consumer groups without a committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    /// Broker client string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Consumer group shared by every ingest worker.
    pub consumer_group: String,

    /// Client id base; each worker appends its index. Defaults to the
    /// host name.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Broker addresses (host:port).
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,

    /// Consumer group session timeout in milliseconds.
    #[serde(default = "default_session_timeout")]
    pub kafka_session_timeout: u64,

    /// Dead-letter topic shared across write paths.
    pub failed_writes_topic: String,

    /// Producer compression for dead-letter publishes.
    #[serde(default = "default_compression")]
    pub failed_writes_compression_type: String,

    #[serde(default)]
    pub starting_offset_type: OffsetReset,

    /// Lowercase names, tag keys/values, and field keys in flight.
    #[serde(default)]
    pub normalize_metrics: bool,

    #[serde(default)]
    pub tls_ca: Option<String>,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,

    #[serde(default = "default_stats_address")]
    pub stats_listen_address: String,
    #[serde(default = "default_stats_port")]
    pub stats_listen_port: u16,

    #[serde(default)]
    pub write_paths: Vec<WritePathConfig>,
}

/// One output endpoint and the tuning knobs of its pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritePathConfig {
    #[serde(default = "default_endpoint")]
    pub output_endpoint: String,
    #[serde(default)]
    pub output_port: Option<u16>,
    #[serde(default = "default_url_path")]
    pub output_path: String,

    #[serde(default)]
    pub tsd_database_name: String,
    #[serde(default)]
    pub tsd_database_org: String,

    #[serde(default)]
    pub prometheus_topics: Vec<String>,
    #[serde(default)]
    pub influx_json_topics: Vec<String>,
    #[serde(default)]
    pub influx_line_topics: Vec<String>,

    // threading settings; zero means "use the host default"
    #[serde(default, rename = "go_channel_size")]
    pub channel_size: usize,
    #[serde(default, rename = "kafka_reader_threads")]
    pub read_threads: usize,
    #[serde(default)]
    pub processor_threads: usize,
    #[serde(default)]
    pub filter_threads: usize,
    #[serde(default)]
    pub write_threads: usize,

    // output tuning
    #[serde(default = "default_send_batch")]
    pub send_batch: usize,
    /// HTTP request timeout for batch writes, in seconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    /// Wall-clock flush threshold in seconds (fractional).
    #[serde(default = "default_flush_time", rename = "tsd_flush_time")]
    pub flush_time: f64,
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default)]
    pub flip_single_fields: bool,
}

impl RelayConfig {
    /// Load configuration from a YAML file, overlaying `CAIRN_`-prefixed
    /// environment variables, then fill defaults and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("CAIRN_").split("__"));
        Self::from_figment(figment)
    }

    /// Load configuration from an in-memory YAML document. Used by tests
    /// and by tooling that templates configs.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Yaml::string(raw)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: RelayConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.finalize();
        config.validate()?;
        Ok(config)
    }

    /// Broker list in the comma-joined form the client expects.
    pub fn broker_list(&self) -> String {
        self.brokers.join(",")
    }

    fn finalize(&mut self) {
        if self.client_id.is_empty() {
            self.client_id = default_client_id();
        }
        if self.brokers.is_empty() {
            self.brokers = default_brokers();
        }
        if self.failed_writes_compression_type.is_empty() {
            self.failed_writes_compression_type = default_compression();
        }
        if self.kafka_session_timeout == 0 {
            self.kafka_session_timeout = default_session_timeout();
        }
        for path in &mut self.write_paths {
            path.finalize();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.consumer_group.is_empty() {
            return Err(ConfigError::Validation(
                "consumer_group cannot be empty".to_string(),
            ));
        }
        if self.failed_writes_topic.is_empty() {
            return Err(ConfigError::Validation(
                "failed_writes_topic cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl WritePathConfig {
    /// Composed output URL: `endpoint + (":" + port if port) + url_path`.
    pub fn output_url(&self) -> String {
        let mut url = self.output_endpoint.clone();
        if let Some(port) = self.output_port {
            url.push_str(&format!(":{}", port));
        }
        url.push_str(&self.output_path);
        url
    }

    fn finalize(&mut self) {
        for topics in [
            &mut self.prometheus_topics,
            &mut self.influx_json_topics,
            &mut self.influx_line_topics,
        ] {
            for topic in topics.iter_mut() {
                *topic = anchor_topic(topic);
            }
        }
        if self.output_endpoint.is_empty() {
            self.output_endpoint = default_endpoint();
        }
        if self.output_path.is_empty() {
            self.output_path = default_url_path();
        }
        if self.channel_size == 0 {
            self.channel_size = DEFAULT_CHANNEL_SIZE;
        }
        if self.read_threads == 0 {
            self.read_threads = default_threads();
        }
        if self.processor_threads == 0 {
            self.processor_threads = default_threads();
        }
        if self.filter_threads == 0 {
            self.filter_threads = default_threads();
        }
        if self.write_threads == 0 {
            self.write_threads = default_threads();
        }
        if self.send_batch == 0 {
            self.send_batch = default_send_batch();
        }
        if self.write_timeout == 0 {
            self.write_timeout = default_write_timeout();
        }
        if self.flush_time == 0.0 {
            self.flush_time = default_flush_time();
        }
    }
}

/// Anchor a topic pattern as `^pattern$` unless it already carries one of
/// the regex markers `^`, `*`, `$`. Subscriptions are therefore
/// whole-name regex matches by default.
fn anchor_topic(pattern: &str) -> String {
    if pattern.contains(|c| matches!(c, '^' | '*' | '$')) {
        pattern.to_string()
    } else {
        format!("^{}$", pattern)
    }
}

const DEFAULT_CHANNEL_SIZE: usize = 10000;

fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "cairn".to_string())
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_session_timeout() -> u64 {
    6000
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_stats_address() -> String {
    "127.0.0.1".to_string()
}

fn default_stats_port() -> u16 {
    9999
}

fn default_endpoint() -> String {
    "http://localhost".to_string()
}

fn default_url_path() -> String {
    "/".to_string()
}

fn default_send_batch() -> usize {
    1000
}

fn default_write_timeout() -> u64 {
    30
}

fn default_flush_time() -> f64 {
    5.0
}

/// Half the host cores, rounded up so single-core hosts still get a
/// worker.
fn default_threads() -> usize {
    num_cpus::get().div_ceil(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
consumer_group: metrics-relay
failed_writes_topic: failed-metrics
write_paths:
  - output_endpoint: http://tsdb.example.com
    output_port: 8086
    output_path: /
    tsd_database_name: metrics
    tsd_database_org: tenant-a
    influx_line_topics:
      - telegraf
    prometheus_topics:
      - "prom-.*"
"#;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let config = RelayConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.consumer_group, "metrics-relay");
        assert_eq!(config.brokers, vec!["localhost:9092".to_string()]);
        assert_eq!(config.broker_list(), "localhost:9092");
        assert_eq!(config.kafka_session_timeout, 6000);
        assert_eq!(config.failed_writes_compression_type, "gzip");
        assert_eq!(config.starting_offset_type, OffsetReset::Earliest);
        assert_eq!(config.stats_listen_address, "127.0.0.1");
        assert_eq!(config.stats_listen_port, 9999);
        assert!(!config.client_id.is_empty());

        let path = &config.write_paths[0];
        assert_eq!(path.channel_size, 10000);
        assert_eq!(path.send_batch, 1000);
        assert_eq!(path.write_timeout, 30);
        assert_eq!(path.flush_time, 5.0);
        assert_eq!(path.max_retries, 0);
        assert!(path.read_threads >= 1);
        assert!(path.write_threads >= 1);
    }

    #[test]
    fn anchors_plain_topic_patterns() {
        let config = RelayConfig::from_yaml_str(MINIMAL).unwrap();
        let path = &config.write_paths[0];
        assert_eq!(path.influx_line_topics, vec!["^telegraf$".to_string()]);
        // patterns that already carry a regex marker are left alone
        assert_eq!(path.prometheus_topics, vec!["prom-.*".to_string()]);
    }

    #[test]
    fn composes_output_url() {
        let config = RelayConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(
            config.write_paths[0].output_url(),
            "http://tsdb.example.com:8086/"
        );

        let portless = RelayConfig::from_yaml_str(
            r#"
consumer_group: g
failed_writes_topic: t
write_paths:
  - output_endpoint: http://tsdb
    output_path: /write
"#,
        )
        .unwrap();
        assert_eq!(portless.write_paths[0].output_url(), "http://tsdb/write");
    }

    #[test]
    fn rejects_missing_consumer_group() {
        let err = RelayConfig::from_yaml_str("failed_writes_topic: t\n").unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));

        let err = RelayConfig::from_yaml_str(
            "consumer_group: \"\"\nfailed_writes_topic: t\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn offset_reset_parses_lowercase() {
        let config = RelayConfig::from_yaml_str(
            "consumer_group: g\nfailed_writes_topic: t\nstarting_offset_type: latest\n",
        )
        .unwrap();
        assert_eq!(config.starting_offset_type, OffsetReset::Latest);
        assert_eq!(config.starting_offset_type.as_str(), "latest");
    }
}
