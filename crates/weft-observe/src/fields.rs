//! Span and layer names used by `weft-core` instrumentation.
//!
//! Keeping them here lets exporters and log queries rely on one spelling.
//! Span fields use the `weft.` prefix (`weft.owning_process`, `weft.layer`,
//! `weft.port`, `weft.run_id`).

// --- Span names ---

/// Span covering one message entering a dispatch stack.
pub const SPAN_DISPATCH: &str = "weft.dispatch";

/// Span covering one token pushed through an iteration strategy stack.
pub const SPAN_ITERATION: &str = "weft.iteration";

/// Span covering one monitor broadcast.
pub const SPAN_MONITOR_NOTIFY: &str = "weft.monitor.notify";

// --- Layer names ---

pub const LAYER_PARALLELIZE: &str = "parallelize";
pub const LAYER_RETRY: &str = "retry";
pub const LAYER_INVOKE: &str = "invoke";
