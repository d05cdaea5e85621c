//! Dataflow execution engine core for Weft.
//!
//! - `iteration` -- iteration strategy trees, the index-array job cache and
//!   staged strategy stacks
//! - `dispatch` -- the layered dispatch stack and its built-in layers
//! - `activity` -- the activity contract and its callback
//! - `monitor` -- live execution-state tree with observers
//! - `processor` -- joins an iteration stack to a dispatch stack

pub mod activity;
pub mod dispatch;
pub mod iteration;
pub mod monitor;
pub mod processor;
