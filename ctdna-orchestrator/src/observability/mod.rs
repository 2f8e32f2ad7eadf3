//! Observability utilities.
//!
//! Logging goes through `tracing` everywhere; this module installs the
//! subscriber and flattens span attributes for export.

mod spans;
mod subscriber;

pub use spans::{RunSpanAttributes, SpanTimer};
pub use subscriber::{init_tracing, LogFormat, DEFAULT_FILTER};
