//! Dead-letter envelope
//!
//! Records that fail to write to a time-series endpoint are re-published
//! to a shared broker topic. Each envelope carries enough context to
//! replay the record against the endpoint it was intended for.

use serde::{Deserialize, Serialize};

/// Envelope published to the dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    /// The failed record, serialized as influx line protocol.
    pub message: String,
    /// Output URL the record was being written to.
    pub write_path: String,
    /// Tenant organization on the target database.
    pub tsd_org: String,
    /// Target database name.
    pub tsd_db: String,
}
