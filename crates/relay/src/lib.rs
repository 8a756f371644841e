//! Per-endpoint streaming pipeline for the cairn relay
//!
//! Each configured write path gets an independent pipeline of bounded
//! queues and worker pools:
//!
//! ```text
//! broker -> [ingest] -> raw bytes -> [decode] -> metric -> [filter] -> metric -> [output] -> TSDB
//!                                                                         |
//!                                                                         +-- failures -> [dead letter] -> broker
//! ```
//!
//! The Prometheus decoder feeds the output queue directly; the influx
//! line/JSON decoders feed the filter stage. Stages cooperate through
//! cancellation tokens and drain their input queues before exiting, so a
//! clean shutdown loses no record that was already accepted.

pub mod decode;
pub mod filter;
pub mod kafka;
pub mod metrics;
pub mod output;
pub mod pipeline;

pub use metrics::{QueueDepths, RelayMetrics};
pub use pipeline::Pipeline;
