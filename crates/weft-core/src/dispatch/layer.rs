//! The dispatch layer contract.
//!
//! Layers are called synchronously with a [`LayerContext`] that knows their
//! position in the stack. Every method has a pass-through default, so a
//! layer only overrides the messages it reacts to. Layers guard their own
//! state and must release any lock before sending a message on.

use std::fmt;
use std::sync::Arc;

use weft_types::job::OwningProcess;

use super::message::{
    CompletionEvent, DispatchDown, DispatchUp, ErrorEvent, JobEvent, JobQueueEvent,
    LayerReaction, ResultEvent,
};
use super::stack::DispatchStack;
use crate::monitor::MonitorableProperty;

/// Where a message is being handled: the stack and the handling layer's
/// position in it (0 is the bottom).
#[derive(Clone, Copy)]
pub struct LayerContext<'a> {
    stack: &'a Arc<DispatchStack>,
    position: usize,
}

impl<'a> LayerContext<'a> {
    pub(crate) fn new(stack: &'a Arc<DispatchStack>, position: usize) -> Self {
        Self { stack, position }
    }

    pub fn stack(&self) -> &'a Arc<DispatchStack> {
        self.stack
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Hand a message to the layer below.
    pub fn send_down(&self, message: DispatchDown) {
        self.stack.send_down_from(self.position, message);
    }

    /// Hand a message to the layer above (or out of the stack).
    pub fn send_up(&self, message: DispatchUp) {
        self.stack.send_up_from(self.position, message);
    }
}

/// One control-flow stage of a dispatch stack.
pub trait DispatchLayer: Send + Sync {
    fn name(&self) -> &str;

    fn receive_job_queue(&self, ctx: &LayerContext<'_>, event: JobQueueEvent) {
        ctx.send_down(DispatchDown::JobQueue(event));
    }

    fn receive_job(&self, ctx: &LayerContext<'_>, event: JobEvent) {
        ctx.send_down(DispatchDown::Job(event));
    }

    fn receive_result(&self, ctx: &LayerContext<'_>, event: ResultEvent) {
        ctx.send_up(DispatchUp::Result(event));
    }

    fn receive_result_completion(&self, ctx: &LayerContext<'_>, event: CompletionEvent) {
        ctx.send_up(DispatchUp::ResultCompletion(event));
    }

    fn receive_error(&self, ctx: &LayerContext<'_>, event: ErrorEvent) {
        ctx.send_up(DispatchUp::Error(event));
    }

    /// The owning process has produced its final completion; drop any state
    /// kept for it.
    fn finished_with(&self, _owning_process: &OwningProcess) {}

    /// Contribute properties to the monitor node for `owning_process`.
    ///
    /// Runs on the caller's thread and must not defer work: callers read
    /// the properties as soon as this returns.
    fn inject_properties_for(
        &self,
        _owning_process: &OwningProcess,
        _properties: &mut Vec<Arc<dyn MonitorableProperty>>,
    ) {
    }

    /// Declared reactions and their state effects.
    fn reactions(&self) -> Vec<LayerReaction> {
        Vec::new()
    }

    fn is_stateless(&self) -> bool {
        self.reactions().iter().all(LayerReaction::is_stateless)
    }
}

impl fmt::Debug for dyn DispatchLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchLayer").field("name", &self.name()).finish()
    }
}
