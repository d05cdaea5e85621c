//! Observability setup for the Weft engine.
//!
//! - `tracing_setup` -- subscriber initialization with optional OpenTelemetry export
//! - `fields` -- span and layer names shared by the engine's tracing calls

pub mod fields;
pub mod tracing_setup;
