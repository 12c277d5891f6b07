//! Command-line tooling for compact malloc traces.
//!
//! This crate provides:
//! - File pipelines: encode producer traces, replay compact streams and
//!   annotate summary traces
//! - Reports: JSON run summaries with SHA-256 digests of inputs and outputs
//! - Structured logs: JSONL run events and their schema validation

#![forbid(unsafe_code)]

pub mod error;
pub mod pipeline;
pub mod report;
pub mod structured_log;

pub use error::HarnessError;
pub use pipeline::{AnalysisPass, EncodeOptions, ReplayOptions};
pub use report::{EncodeReport, ReplayReport};
