//! Iteration strategy system.
//!
//! - `node` -- arena-backed node tree, structural edits, depth algebra
//! - `cache` -- sparse index-array job cache
//! - `strategy` -- one node tree plus runtime combination state
//! - `stack` -- staged composition of strategies

pub mod cache;
pub mod node;
pub mod stack;
pub mod strategy;

pub use cache::TreeCache;
pub use node::{IterationTree, NodeId, NodeKind};
pub use stack::IterationStrategyStack;
pub use strategy::IterationStrategy;
