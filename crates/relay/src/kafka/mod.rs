//! Broker plumbing
//!
//! Ingest consumers and the dead-letter producer. Every worker constructs
//! and owns its own client handle; nothing broker-related is shared
//! across tasks.

mod consumer;
mod dead_letter;

pub use consumer::{run_ingest, ConsumerConfig};
pub use dead_letter::{run_dead_letter, DeadLetterConfig};

/// Optional TLS material applied to both consumers and the dead-letter
/// producer.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

impl TlsConfig {
    /// Build from the top-level relay configuration; `None` when no TLS
    /// material is configured.
    pub fn from_config(config: &cairn_config::RelayConfig) -> Option<Self> {
        if config.tls_ca.is_none() && config.tls_cert.is_none() && config.tls_key.is_none() {
            return None;
        }
        Some(Self {
            ca: config.tls_ca.clone(),
            cert: config.tls_cert.clone(),
            key: config.tls_key.clone(),
        })
    }

    fn apply(&self, client: &mut rdkafka::ClientConfig) {
        client.set("security.protocol", "ssl");
        if let Some(ca) = &self.ca {
            client.set("ssl.ca.location", ca);
        }
        if let Some(cert) = &self.cert {
            client.set("ssl.certificate.location", cert);
        }
        if let Some(key) = &self.key {
            client.set("ssl.key.location", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_config_absent_when_unset() {
        let config = cairn_config::RelayConfig::from_yaml_str(
            "consumer_group: g\nfailed_writes_topic: t\n",
        )
        .unwrap();
        assert!(TlsConfig::from_config(&config).is_none());
    }

    #[test]
    fn tls_config_applies_locations() {
        let config = cairn_config::RelayConfig::from_yaml_str(
            "consumer_group: g\nfailed_writes_topic: t\ntls_ca: /etc/ssl/ca.pem\n",
        )
        .unwrap();
        let tls = TlsConfig::from_config(&config).unwrap();
        let mut client = rdkafka::ClientConfig::new();
        tls.apply(&mut client);
        assert_eq!(client.get("security.protocol"), Some("ssl"));
        assert_eq!(client.get("ssl.ca.location"), Some("/etc/ssl/ca.pem"));
    }
}
