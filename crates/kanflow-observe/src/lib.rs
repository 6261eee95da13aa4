//! Observability setup for Kanflow binaries.
//!
//! - `tracing_setup` -- subscriber initialisation and optional OpenTelemetry export

pub mod tracing_setup;
