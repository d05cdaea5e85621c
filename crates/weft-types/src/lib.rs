//! Shared domain types for the Weft dataflow engine.
//!
//! This crate contains the types that flow between the iteration system, the
//! dispatch stack and the monitor: jobs, completions, owning-process paths,
//! opaque data references, layer configuration and the error enums.
//!
//! Zero engine dependencies -- only serde, serde_json, toml, thiserror.

pub mod config;
pub mod error;
pub mod job;
