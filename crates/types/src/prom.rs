//! Prometheus adapter sample shape
//!
//! Samples arrive on the broker in the JSON form produced by the
//! prometheus-kafka adapter:
//!
//! ```json
//! {
//!   "timestamp": "1970-01-01T00:00:00Z",
//!   "value": "9876543210",
//!   "name": "up",
//!   "labels": {
//!     "__name__": "up",
//!     "label1": "value1"
//!   }
//! }
//! ```
//!
//! The timestamp stays a string here; the decoder converts it from
//! RFC 3339 to whole seconds.

use std::collections::BTreeMap;

use serde::Deserialize;

/// A single Prometheus sample as published by the adapter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromSample {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub timestamp: String,
}
