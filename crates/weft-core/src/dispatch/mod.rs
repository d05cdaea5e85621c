//! Dispatch stack: a layered control pipeline between the iteration system
//! and activity invocation.
//!
//! - `message` -- downward/upward messages, job queues, state effects
//! - `layer` -- the `DispatchLayer` trait and `LayerContext`
//! - `stack` -- `DispatchStack` routing, sentinel top and builder
//! - `registry` -- name-indexed layer factories
//! - `layers` -- built-in `Parallelize`, `Retry`, `Invoke`

pub mod layer;
pub mod layers;
pub mod message;
pub mod registry;
pub mod stack;

pub use layer::{DispatchLayer, LayerContext};
pub use message::{
    CompletionEvent, DispatchDown, DispatchUp, ErrorEvent, JobEvent, JobQueue, JobQueueEvent,
    LayerReaction, MessageKind, ResultEvent, StateEffect, StateScope,
};
pub use registry::LayerRegistry;
pub use stack::{DispatchOutput, DispatchStack, DispatchStackBuilder};
