//! Ordered pipeline of dispatch layers.
//!
//! Position 0 is the bottom, nearest the activity being invoked. Messages
//! enter at the top through [`DispatchStack::submit`] and upward messages
//! leaving the top layer reach a sentinel that forwards them to the output
//! channel supplied at build time. The sentinel also closes out an owning
//! process when its final completion arrives: every layer gets
//! `finished_with` and the process' monitor node is deregistered. A
//! finished process stays finished; later submissions for it are dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use weft_observe::fields;
use weft_types::config::EngineConfig;
use weft_types::error::DispatchError;
use weft_types::job::OwningProcess;

use super::layer::{DispatchLayer, LayerContext};
use super::layers::{Invoke, Parallelize, Retry};
use super::message::{DispatchDown, DispatchUp};
use super::registry::LayerRegistry;
use crate::monitor::{Monitor, MonitorableProperty, WorkflowObject};

/// Receiving end of a stack's output.
pub type DispatchOutput = mpsc::UnboundedReceiver<DispatchUp>;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`DispatchStack`] bottom-up.
#[derive(Default)]
pub struct DispatchStackBuilder {
    layers: Vec<Arc<dyn DispatchLayer>>,
    monitor: Option<Arc<Monitor>>,
    workflow_object: Option<WorkflowObject>,
}

impl DispatchStackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `layer` on top of the layers added so far.
    pub fn layer(mut self, layer: Arc<dyn DispatchLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Report owning processes to `monitor`.
    pub fn monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Object attached to every monitor node the stack registers.
    pub fn workflow_object(mut self, object: WorkflowObject) -> Self {
        self.workflow_object = Some(object);
        self
    }

    /// Build the stack and the channel its output arrives on.
    ///
    /// # Errors
    ///
    /// `DispatchError::NoRuntime` when called outside a tokio runtime;
    /// delayed work is scheduled on the runtime current at this point.
    pub fn build(self) -> Result<(Arc<DispatchStack>, DispatchOutput), DispatchError> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let (output, rx) = mpsc::unbounded_channel();
        let stack = DispatchStack {
            layers: self.layers,
            output,
            monitor: self.monitor,
            workflow_object: self.workflow_object,
            lifecycle: Mutex::new(Lifecycle::default()),
            runtime,
        };
        Ok((Arc::new(stack), rx))
    }
}

// ---------------------------------------------------------------------------
// DispatchStack
// ---------------------------------------------------------------------------

/// Owning processes the stack has seen.
#[derive(Default)]
struct Lifecycle {
    /// Entered and not yet finished.
    live: HashSet<OwningProcess>,
    /// Final completion already emitted.
    finished: HashSet<OwningProcess>,
}

pub struct DispatchStack {
    layers: Vec<Arc<dyn DispatchLayer>>,
    output: mpsc::UnboundedSender<DispatchUp>,
    monitor: Option<Arc<Monitor>>,
    workflow_object: Option<WorkflowObject>,
    lifecycle: Mutex<Lifecycle>,
    runtime: Handle,
}

impl DispatchStack {
    pub fn builder() -> DispatchStackBuilder {
        DispatchStackBuilder::new()
    }

    /// Build a stack from `(layer name, configuration)` pairs, bottom first.
    pub fn from_spec(
        registry: &LayerRegistry,
        spec: &[(String, Value)],
        monitor: Option<Arc<Monitor>>,
    ) -> Result<(Arc<Self>, DispatchOutput), DispatchError> {
        let mut builder = DispatchStackBuilder::new();
        for (name, config) in spec {
            builder = builder.layer(registry.create(name, config)?);
        }
        if let Some(monitor) = monitor {
            builder = builder.monitor(monitor);
        }
        builder.build()
    }

    /// Parallelize over Retry over Invoke, configured from `config`.
    ///
    /// A fresh monitor is attached when `config.monitor.enabled`.
    pub fn standard(config: &EngineConfig) -> Result<(Arc<Self>, DispatchOutput), DispatchError> {
        let mut builder = DispatchStackBuilder::new()
            .layer(Arc::new(Invoke::new()))
            .layer(Arc::new(Retry::with_config(config.retry.clone())?))
            .layer(Arc::new(Parallelize::with_config(config.parallelize.clone())?));
        if config.monitor.enabled {
            builder = builder.monitor(Arc::new(Monitor::new()));
        }
        builder.build()
    }

    // -----------------------------------------------------------------------
    // Layer lookup
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layers, bottom first.
    pub fn layers(&self) -> &[Arc<dyn DispatchLayer>] {
        &self.layers
    }

    pub fn layer(&self, position: usize) -> Option<&Arc<dyn DispatchLayer>> {
        self.layers.get(position)
    }

    pub fn layer_above(&self, position: usize) -> Option<&Arc<dyn DispatchLayer>> {
        self.layers.get(position.checked_add(1)?)
    }

    pub fn layer_below(&self, position: usize) -> Option<&Arc<dyn DispatchLayer>> {
        self.layers.get(position.checked_sub(1)?)
    }

    /// Position of the first layer called `name`, counted from the bottom.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name() == name)
    }

    /// Layers that declare any state effect.
    pub fn stateful_layers(&self) -> Vec<&Arc<dyn DispatchLayer>> {
        self.layers.iter().filter(|l| !l.is_stateless()).collect()
    }

    pub fn monitor(&self) -> Option<&Arc<Monitor>> {
        self.monitor.as_ref()
    }

    /// Whether the final completion for `owning_process` has left the stack.
    ///
    /// Marked before any layer's `finished_with` runs, so a layer that
    /// creates per-process state and then finds this false can rely on
    /// `finished_with` still arriving after its insert.
    pub fn is_finished(&self, owning_process: &OwningProcess) -> bool {
        self.lifecycle
            .lock()
            .expect("dispatch lifecycle lock poisoned")
            .finished
            .contains(owning_process)
    }

    /// Number of owning processes entered and not yet finished.
    pub fn live_processes(&self) -> usize {
        self.lifecycle
            .lock()
            .expect("dispatch lifecycle lock poisoned")
            .live
            .len()
    }

    /// Runtime that delayed work is scheduled on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Every property the layers contribute for `owning_process`, collected
    /// bottom first on the calling thread.
    pub fn properties_for(&self, owning_process: &OwningProcess) -> Vec<Arc<dyn MonitorableProperty>> {
        let mut properties = Vec::new();
        for layer in &self.layers {
            layer.inject_properties_for(owning_process, &mut properties);
        }
        properties
    }

    // -----------------------------------------------------------------------
    // Message routing
    // -----------------------------------------------------------------------

    /// Push a message in at the top of the stack.
    ///
    /// The first message seen for an owning process registers its monitor
    /// node. Messages for a process whose final completion has already left
    /// the stack are dropped; this happens when a submission races the one
    /// that carried the final completion and loses.
    ///
    /// Monitor observers are notified under the lifecycle lock and must not
    /// submit into this stack from `notify`.
    pub fn submit(self: &Arc<Self>, message: DispatchDown) {
        let owning_process = message.owning_process().clone();
        let span = tracing::debug_span!(
            fields::SPAN_DISPATCH,
            weft.owning_process = %owning_process,
        );
        let _guard = span.enter();

        {
            let mut lifecycle = self.lifecycle.lock().expect("dispatch lifecycle lock poisoned");
            if lifecycle.finished.contains(&owning_process) {
                debug!("owning process already finished, dropping submission");
                return;
            }
            if lifecycle.live.insert(owning_process.clone()) {
                debug!(layers = self.layers.len(), "owning process entered dispatch stack");
                if let Some(monitor) = &self.monitor {
                    let properties = self.properties_for(&owning_process);
                    monitor.register_node(
                        self.workflow_object.clone(),
                        owning_process.clone(),
                        properties,
                    );
                }
            }
        }

        self.send_down_from(self.layers.len(), message);
    }

    /// Deliver `message` to the layer below `position`.
    pub fn send_down_from(self: &Arc<Self>, position: usize, message: DispatchDown) {
        let Some(target) = position.min(self.layers.len()).checked_sub(1) else {
            warn!(?message, "message sent below the bottom of the dispatch stack, dropping");
            return;
        };
        let layer = &self.layers[target];
        let ctx = LayerContext::new(self, target);
        match message {
            DispatchDown::JobQueue(event) => layer.receive_job_queue(&ctx, event),
            DispatchDown::Job(event) => layer.receive_job(&ctx, event),
        }
    }

    /// Deliver `message` to the layer above `position`, or out of the stack.
    pub fn send_up_from(self: &Arc<Self>, position: usize, message: DispatchUp) {
        let target = position.saturating_add(1);
        let Some(layer) = self.layers.get(target) else {
            self.emit(message);
            return;
        };
        let ctx = LayerContext::new(self, target);
        match message {
            DispatchUp::Result(event) => layer.receive_result(&ctx, event),
            DispatchUp::ResultCompletion(event) => layer.receive_result_completion(&ctx, event),
            DispatchUp::Error(event) => layer.receive_error(&ctx, event),
        }
    }

    fn emit(&self, message: DispatchUp) {
        if let DispatchUp::ResultCompletion(completion) = &message {
            if completion.is_final() {
                self.finish(&completion.owning_process);
            }
        }

        if self.output.send(message).is_err() {
            debug!("dispatch output receiver dropped");
        }
    }

    fn finish(&self, owning_process: &OwningProcess) {
        debug!(owning_process = %owning_process, "owning process finished");
        {
            let mut lifecycle = self.lifecycle.lock().expect("dispatch lifecycle lock poisoned");
            lifecycle.finished.insert(owning_process.clone());
            if lifecycle.live.remove(owning_process) {
                if let Some(monitor) = &self.monitor {
                    monitor.deregister_node(owning_process);
                }
            }
        }
        for layer in &self.layers {
            layer.finished_with(owning_process);
        }
    }
}

impl std::fmt::Debug for DispatchStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.layers.iter().map(|l| l.name()).collect();
        f.debug_struct("DispatchStack")
            .field("layers", &names)
            .field("monitored", &self.monitor.is_some())
            .field("live", &self.live_processes())
            .finish()
    }
}
