//! Observability setup for Taskflow: structured logging and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
