//! A processor: one iteration stack feeding one dispatch stack.
//!
//! Tokens arriving on input ports are combined by the iteration stack; every
//! event it emits is appended to the owning process' job queue and the
//! queue is (re)submitted to the dispatch stack together with the
//! processor's activities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::debug;
use weft_observe::fields;
use weft_types::error::IterationError;
use weft_types::job::{DataRef, IterationEvent, OwningProcess};

use crate::activity::Activity;
use crate::dispatch::{DispatchDown, DispatchStack, JobQueue, JobQueueEvent};
use crate::iteration::IterationStrategyStack;

pub struct Processor {
    name: String,
    iteration: Mutex<IterationStrategyStack>,
    dispatch: Arc<DispatchStack>,
    activities: Vec<Arc<dyn Activity>>,
    queues: DashMap<OwningProcess, JobQueue>,
}

impl Processor {
    pub fn new(
        name: impl Into<String>,
        iteration: IterationStrategyStack,
        dispatch: Arc<DispatchStack>,
        activities: Vec<Arc<dyn Activity>>,
    ) -> Self {
        Self {
            name: name.into(),
            iteration: Mutex::new(iteration),
            dispatch,
            activities,
            queues: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatch(&self) -> &Arc<DispatchStack> {
        &self.dispatch
    }

    pub fn activities(&self) -> &[Arc<dyn Activity>] {
        &self.activities
    }

    /// Iteration depth for the given input port depths.
    pub fn iteration_depth(&self, inputs: &HashMap<String, usize>) -> Result<usize, IterationError> {
        self.iteration
            .lock()
            .expect("iteration lock poisoned")
            .iteration_depth(inputs)
    }

    /// Push a data token arriving on `port`.
    pub fn receive_data(
        &self,
        port: &str,
        owning_process: &OwningProcess,
        index: &[usize],
        data: DataRef,
    ) -> Result<(), IterationError> {
        let span = tracing::debug_span!(
            fields::SPAN_ITERATION,
            weft.port = port,
            weft.owning_process = %owning_process,
        );
        let _guard = span.enter();

        let queued = {
            let mut iteration = self.iteration.lock().expect("iteration lock poisoned");
            let events = iteration.receive_data(port, owning_process, index, data)?;
            self.enqueue(owning_process, events)
        };
        self.dispatch_queue(owning_process, queued);
        Ok(())
    }

    /// Push a completion arriving on `port`.
    pub fn receive_completion(
        &self,
        port: &str,
        owning_process: &OwningProcess,
        index: &[usize],
    ) -> Result<(), IterationError> {
        let span = tracing::debug_span!(
            fields::SPAN_ITERATION,
            weft.port = port,
            weft.owning_process = %owning_process,
        );
        let _guard = span.enter();

        let queued = {
            let mut iteration = self.iteration.lock().expect("iteration lock poisoned");
            let events = iteration.receive_completion(port, owning_process, index)?;
            self.enqueue(owning_process, events)
        };
        self.dispatch_queue(owning_process, queued);
        Ok(())
    }

    /// Append events to the process' queue. Called with the iteration lock
    /// held so queue order matches emission order.
    fn enqueue(&self, owning_process: &OwningProcess, events: Vec<IterationEvent>) -> Option<JobQueue> {
        if events.is_empty() {
            return None;
        }
        let finished = events
            .iter()
            .any(|e| matches!(e, IterationEvent::Completion(c) if c.is_final()));

        let queue = self
            .queues
            .entry(owning_process.clone())
            .or_default()
            .clone();
        debug!(processor = %self.name, events = events.len(), "queueing iteration events");
        for event in events {
            queue.push(event);
        }
        if finished {
            self.queues.remove(owning_process);
        }
        Some(queue)
    }

    fn dispatch_queue(&self, owning_process: &OwningProcess, queue: Option<JobQueue>) {
        let Some(queue) = queue else {
            return;
        };
        self.dispatch.submit(DispatchDown::JobQueue(JobQueueEvent {
            owning_process: owning_process.clone(),
            queue,
            activities: self.activities.clone(),
        }));
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("name", &self.name)
            .field("dispatch", &self.dispatch)
            .field("activities", &self.activities)
            .finish()
    }
}
