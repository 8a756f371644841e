//! Shared data model for the cairn relay
//!
//! This crate defines the normalized in-memory metric shape that flows
//! between pipeline stages, the Prometheus-adapter sample shape, and the
//! dead-letter envelope published back to the broker.

pub mod dead_letter;
pub mod metric;
pub mod prom;

pub use dead_letter::DeadLetterEnvelope;
pub use metric::{FieldValue, Metric};
pub use prom::PromSample;
