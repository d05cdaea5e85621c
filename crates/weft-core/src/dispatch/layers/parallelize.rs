//! Bounded fan-out from a job queue.
//!
//! For each owning process the layer keeps the queue it was handed and
//! pulls from it while fewer than `maxJobs` jobs are in flight. A
//! completion pulled off the queue is held back until no in-flight job lies
//! under its prefix, so it never overtakes the results it closes.
//!
//! Pulling is re-entrant safe: a result arriving while the same process is
//! already being pumped (synchronous activities, or another thread) only
//! updates the bookkeeping and leaves the pulling to the active pump.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde_json::{Value, json};
use tracing::debug;
use weft_observe::fields;
use weft_types::config::ParallelizeConfig;
use weft_types::error::{DispatchError, PropertyError};
use weft_types::job::{IterationEvent, OwningProcess};

use crate::activity::Activity;
use crate::dispatch::layer::{DispatchLayer, LayerContext};
use crate::dispatch::message::{
    CompletionEvent, DispatchDown, DispatchUp, ErrorEvent, JobEvent, JobQueue, JobQueueEvent,
    LayerReaction, MessageKind, ResultEvent, StateEffect, StateScope,
};
use crate::monitor::{DynamicProperty, MonitorableProperty};

pub const PROPERTY_QUEUE_SIZE: &str = "dispatch:parallelize:queuesize";
pub const PROPERTY_SENT_JOBS: &str = "dispatch:parallelize:sentjobs";
pub const PROPERTY_COMPLETED_JOBS: &str = "dispatch:parallelize:completedjobs";
pub const PROPERTY_ERRORS: &str = "dispatch:parallelize:errors";

/// Per owning process bookkeeping.
struct ProcessState {
    queue: JobQueue,
    activities: Vec<Arc<dyn Activity>>,
    in_flight: HashSet<Vec<usize>>,
    deferred: Vec<CompletionEvent>,
    pumping: bool,
    sent_jobs: u64,
    completed_jobs: u64,
    errors: u64,
}

enum Pulled {
    Job(JobEvent),
    Completion(CompletionEvent),
}

impl ProcessState {
    fn new(queue: JobQueue, activities: Vec<Arc<dyn Activity>>) -> Self {
        Self {
            queue,
            activities,
            in_flight: HashSet::new(),
            deferred: Vec::new(),
            pumping: false,
            sent_jobs: 0,
            completed_jobs: 0,
            errors: 0,
        }
    }

    fn blocks(&self, prefix: &[usize]) -> bool {
        self.in_flight.iter().any(|index| index.starts_with(prefix))
    }

    /// Next thing to send, or `None` (clearing the pumping flag) when there
    /// is nothing to do right now.
    fn pull(&mut self, max_jobs: usize) -> Option<Pulled> {
        if let Some(pos) = self.deferred.iter().position(|c| !self.blocks(&c.index)) {
            return Some(Pulled::Completion(self.deferred.remove(pos)));
        }

        while self.in_flight.len() < max_jobs {
            match self.queue.pop() {
                Some(IterationEvent::Job(job)) => {
                    self.in_flight.insert(job.index.clone());
                    self.sent_jobs += 1;
                    return Some(Pulled::Job(JobEvent {
                        job,
                        activities: self.activities.clone(),
                    }));
                }
                Some(IterationEvent::Completion(c)) => {
                    let completion = CompletionEvent {
                        owning_process: c.owning_process,
                        index: c.index,
                    };
                    if !self.blocks(&completion.index) && self.deferred.is_empty() {
                        return Some(Pulled::Completion(completion));
                    }
                    self.deferred.push(completion);
                }
                None => break,
            }
        }

        self.pumping = false;
        None
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Completed,
    Failed,
}

/// Dispatch layer keeping at most `maxJobs` jobs in flight per process.
pub struct Parallelize {
    config: RwLock<ParallelizeConfig>,
    states: Arc<DashMap<OwningProcess, ProcessState>>,
}

impl Parallelize {
    pub fn new() -> Self {
        Self {
            config: RwLock::new(ParallelizeConfig::default()),
            states: Arc::new(DashMap::new()),
        }
    }

    pub fn with_config(config: ParallelizeConfig) -> Result<Self, DispatchError> {
        let layer = Self::new();
        layer.set_config(config)?;
        Ok(layer)
    }

    /// Build from a JSON configuration, see [`Parallelize::configure`].
    pub fn from_json(config: &Value) -> Result<Self, DispatchError> {
        let layer = Self::new();
        layer.configure(config)?;
        Ok(layer)
    }

    /// Replace the configuration with defaults overlaid by `partial`.
    ///
    /// On error the previous configuration stays in place.
    pub fn configure(&self, partial: &Value) -> Result<(), DispatchError> {
        let config = ParallelizeConfig::from_json(partial)?;
        *self.config.write().expect("parallelize config lock poisoned") = config;
        Ok(())
    }

    pub fn set_config(&self, config: ParallelizeConfig) -> Result<(), DispatchError> {
        config.validate()?;
        *self.config.write().expect("parallelize config lock poisoned") = config;
        Ok(())
    }

    pub fn config(&self) -> ParallelizeConfig {
        self.config
            .read()
            .expect("parallelize config lock poisoned")
            .clone()
    }

    fn max_jobs(&self) -> usize {
        usize::try_from(self.config().max_jobs).unwrap_or(1).max(1)
    }

    /// Number of jobs currently in flight for `owning_process`.
    pub fn in_flight(&self, owning_process: &OwningProcess) -> usize {
        self.states
            .get(owning_process)
            .map(|s| s.in_flight.len())
            .unwrap_or(0)
    }

    fn pump(&self, ctx: &LayerContext<'_>, owning_process: &OwningProcess) {
        match self.states.get_mut(owning_process) {
            Some(mut state) if !state.pumping => state.pumping = true,
            _ => return,
        }

        loop {
            let max_jobs = self.max_jobs();
            let pulled = match self.states.get_mut(owning_process) {
                Some(mut state) => state.pull(max_jobs),
                None => return,
            };
            match pulled {
                Some(Pulled::Job(job)) => {
                    debug!(
                        layer = fields::LAYER_PARALLELIZE,
                        owning_process = %owning_process,
                        index = ?job.job.index,
                        "sending job"
                    );
                    ctx.send_down(DispatchDown::Job(job));
                }
                Some(Pulled::Completion(completion)) => {
                    ctx.send_up(DispatchUp::ResultCompletion(completion));
                }
                None => return,
            }
        }
    }

    /// Retire an in-flight job. Returns whether it was in flight.
    fn retire(&self, owning_process: &OwningProcess, index: &[usize], outcome: Outcome) -> bool {
        let Some(mut state) = self.states.get_mut(owning_process) else {
            return false;
        };
        if !state.in_flight.remove(index) {
            return false;
        }
        match outcome {
            Outcome::Completed => state.completed_jobs += 1,
            Outcome::Failed => state.errors += 1,
        }
        true
    }

    fn counter(
        &self,
        name: &'static str,
        owning_process: &OwningProcess,
        read: fn(&ProcessState) -> Value,
    ) -> Arc<dyn MonitorableProperty> {
        let states = Arc::clone(&self.states);
        let process = owning_process.clone();
        DynamicProperty::shared(name, move || {
            states
                .get(&process)
                .map(|state| read(&state))
                .ok_or_else(|| PropertyError::NoSuchProperty(name.to_string()))
        })
    }
}

impl Default for Parallelize {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchLayer for Parallelize {
    fn name(&self) -> &str {
        fields::LAYER_PARALLELIZE
    }

    fn receive_job_queue(&self, ctx: &LayerContext<'_>, event: JobQueueEvent) {
        let JobQueueEvent {
            owning_process,
            queue,
            activities,
        } = event;
        self.states
            .entry(owning_process.clone())
            .and_modify(|state| {
                state.queue = queue.clone();
                state.activities = activities.clone();
            })
            .or_insert_with(|| ProcessState::new(queue, activities));
        // A submission that raced the final completion on another thread
        // must not leave state behind for a finished process.
        if ctx.stack().is_finished(&owning_process) {
            self.states.remove(&owning_process);
            return;
        }
        self.pump(ctx, &owning_process);
    }

    fn receive_result(&self, ctx: &LayerContext<'_>, event: ResultEvent) {
        let owning_process = event.owning_process.clone();
        let index = event.index.clone();
        let streaming = event.streaming;
        ctx.send_up(DispatchUp::Result(event));
        if !streaming && self.retire(&owning_process, &index, Outcome::Completed) {
            self.pump(ctx, &owning_process);
        }
    }

    fn receive_result_completion(&self, ctx: &LayerContext<'_>, event: CompletionEvent) {
        let owning_process = event.owning_process.clone();
        let index = event.index.clone();
        ctx.send_up(DispatchUp::ResultCompletion(event));
        if self.retire(&owning_process, &index, Outcome::Completed) {
            self.pump(ctx, &owning_process);
        }
    }

    fn receive_error(&self, ctx: &LayerContext<'_>, event: ErrorEvent) {
        let owning_process = event.owning_process.clone();
        let index = event.index.clone();
        ctx.send_up(DispatchUp::Error(event));
        if self.retire(&owning_process, &index, Outcome::Failed) {
            self.pump(ctx, &owning_process);
        }
    }

    fn finished_with(&self, owning_process: &OwningProcess) {
        self.states.remove(owning_process);
    }

    fn inject_properties_for(
        &self,
        owning_process: &OwningProcess,
        properties: &mut Vec<Arc<dyn MonitorableProperty>>,
    ) {
        properties.push(self.counter(PROPERTY_QUEUE_SIZE, owning_process, |s| {
            json!(s.queue.len())
        }));
        properties.push(self.counter(PROPERTY_SENT_JOBS, owning_process, |s| {
            json!(s.sent_jobs)
        }));
        properties.push(self.counter(PROPERTY_COMPLETED_JOBS, owning_process, |s| {
            json!(s.completed_jobs)
        }));
        properties.push(self.counter(PROPERTY_ERRORS, owning_process, |s| json!(s.errors)));
    }

    fn reactions(&self) -> Vec<LayerReaction> {
        let process = StateScope::Process;
        vec![
            LayerReaction::new(MessageKind::JobQueue, [StateEffect::Create(process)]),
            LayerReaction::new(MessageKind::Result, [StateEffect::Update(process)]),
            LayerReaction::new(MessageKind::ResultCompletion, [StateEffect::Update(process)]),
            LayerReaction::new(MessageKind::Error, [StateEffect::Update(process)]),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use weft_types::job::{Completion, DataRef, Job};

    use crate::activity::{ActivityCallback, DataMap};
    use crate::dispatch::layers::Invoke;
    use crate::dispatch::stack::DispatchStack;
    use crate::monitor::Monitor;

    /// Activity that parks callbacks until the test releases them.
    #[derive(Default)]
    struct Held {
        pending: Mutex<Vec<(DataMap, ActivityCallback)>>,
    }

    impl Held {
        fn pending(&self) -> usize {
            self.pending.lock().unwrap().len()
        }

        /// Answer the oldest parked call. The lock is released first, since
        /// answering can start the next job.
        fn release_one(&self, fail: bool) -> bool {
            let next = {
                let mut pending = self.pending.lock().unwrap();
                if pending.is_empty() {
                    None
                } else {
                    Some(pending.remove(0))
                }
            };
            match next {
                Some((inputs, callback)) if fail => {
                    drop(inputs);
                    callback.fail("held failure", None);
                    true
                }
                Some((inputs, callback)) => {
                    callback.receive_result(inputs, vec![]);
                    true
                }
                None => false,
            }
        }
    }

    impl Activity for Held {
        fn name(&self) -> &str {
            "held"
        }

        fn invoke(&self, inputs: DataMap, callback: ActivityCallback) {
            self.pending.lock().unwrap().push((inputs, callback));
        }
    }

    fn process() -> OwningProcess {
        OwningProcess::new(["df0", "p1"])
    }

    fn queue_with(events: Vec<IterationEvent>) -> JobQueue {
        let queue = JobQueue::new();
        for event in events {
            queue.push(event);
        }
        queue
    }

    fn job(index: Vec<usize>) -> IterationEvent {
        IterationEvent::Job(Job::single(process(), index, "in", DataRef::new("x")))
    }

    fn completion(index: Vec<usize>) -> IterationEvent {
        IterationEvent::Completion(Completion::new(process(), index))
    }

    fn drain(rx: &mut crate::dispatch::DispatchOutput) -> Vec<DispatchUp> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    #[test]
    fn test_configure_is_atomic() {
        let layer = Parallelize::new();
        layer.configure(&json!({"maxJobs": 4})).unwrap();
        assert!(layer.configure(&json!({"maxJobs": 0})).is_err());
        assert_eq!(layer.config().max_jobs, 4);

        layer.configure(&json!({})).unwrap();
        assert_eq!(layer.config().max_jobs, 1);
    }

    #[test]
    fn test_declares_process_state() {
        let layer = Parallelize::new();
        assert!(!layer.is_stateless());
        assert!(layer
            .reactions()
            .iter()
            .any(|r| r.message == MessageKind::JobQueue));
    }

    // -----------------------------------------------------------------------
    // Runtime
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_never_exceeds_max_jobs() {
        let held = Arc::new(Held::default());
        let layer = Arc::new(Parallelize::with_config(ParallelizeConfig { max_jobs: 2 }).unwrap());
        let (stack, mut rx) = DispatchStack::builder()
            .layer(Arc::new(Invoke::new()))
            .layer(layer.clone())
            .build()
            .unwrap();

        let mut events: Vec<IterationEvent> = (0..5).map(|i| job(vec![i])).collect();
        events.push(completion(vec![]));
        stack.submit(DispatchDown::JobQueue(JobQueueEvent {
            owning_process: process(),
            queue: queue_with(events),
            activities: vec![held.clone() as Arc<dyn Activity>],
        }));

        assert_eq!(held.pending(), 2);
        assert_eq!(layer.in_flight(&process()), 2);

        let mut released = 0;
        while held.release_one(false) {
            released += 1;
            assert!(held.pending() <= 2);
        }
        assert_eq!(released, 5);

        let out = drain(&mut rx);
        assert_eq!(out.len(), 6);
        assert!(out[..5].iter().all(|m| matches!(m, DispatchUp::Result(_))));
        assert!(matches!(&out[5], DispatchUp::ResultCompletion(c) if c.is_final()));
        assert_eq!(layer.in_flight(&process()), 0);
    }

    #[tokio::test]
    async fn test_partial_completion_waits_for_its_jobs() {
        let held = Arc::new(Held::default());
        let layer = Arc::new(Parallelize::with_config(ParallelizeConfig { max_jobs: 3 }).unwrap());
        let (stack, mut rx) = DispatchStack::builder()
            .layer(Arc::new(Invoke::new()))
            .layer(layer.clone())
            .build()
            .unwrap();

        let events = vec![
            job(vec![0, 0]),
            job(vec![0, 1]),
            completion(vec![0]),
            job(vec![1, 0]),
            completion(vec![1]),
            completion(vec![]),
        ];
        stack.submit(DispatchDown::JobQueue(JobQueueEvent {
            owning_process: process(),
            queue: queue_with(events),
            activities: vec![held.clone() as Arc<dyn Activity>],
        }));
        assert!(drain(&mut rx).is_empty());

        held.release_one(false);
        assert_eq!(drain(&mut rx).len(), 1);

        held.release_one(false);
        let out = drain(&mut rx);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], DispatchUp::ResultCompletion(c) if c.index == vec![0]));

        held.release_one(false);
        let out = drain(&mut rx);
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[1], DispatchUp::ResultCompletion(c) if c.index == vec![1]));
        assert!(matches!(&out[2], DispatchUp::ResultCompletion(c) if c.is_final()));
    }

    #[tokio::test]
    async fn test_queue_fed_in_several_submissions() {
        let held = Arc::new(Held::default());
        let (stack, mut rx) = DispatchStack::builder()
            .layer(Arc::new(Invoke::new()))
            .layer(Arc::new(Parallelize::new()))
            .build()
            .unwrap();

        let queue = JobQueue::new();
        let submit = |queue: &JobQueue| {
            stack.submit(DispatchDown::JobQueue(JobQueueEvent {
                owning_process: process(),
                queue: queue.clone(),
                activities: vec![held.clone() as Arc<dyn Activity>],
            }));
        };

        queue.push(job(vec![0]));
        submit(&queue);
        held.release_one(false);

        queue.push(job(vec![1]));
        queue.push(completion(vec![]));
        submit(&queue);
        held.release_one(false);

        let out = drain(&mut rx);
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[2], DispatchUp::ResultCompletion(c) if c.is_final()));
    }

    #[tokio::test]
    async fn test_properties_track_counts_and_expire() {
        let held = Arc::new(Held::default());
        let monitor = Arc::new(Monitor::new());
        let (stack, _rx) = DispatchStack::builder()
            .layer(Arc::new(Invoke::new()))
            .layer(Arc::new(Parallelize::new()))
            .monitor(monitor.clone())
            .build()
            .unwrap();

        stack.submit(DispatchDown::JobQueue(JobQueueEvent {
            owning_process: process(),
            queue: queue_with(vec![job(vec![0]), job(vec![1]), completion(vec![])]),
            activities: vec![held.clone() as Arc<dyn Activity>],
        }));

        let node = monitor.node(&process()).unwrap();
        let read = |name: &str| node.property(name).unwrap().value();
        assert_eq!(read(PROPERTY_SENT_JOBS).unwrap(), json!(1));
        assert_eq!(read(PROPERTY_QUEUE_SIZE).unwrap(), json!(2));

        held.release_one(true);
        assert_eq!(read(PROPERTY_ERRORS).unwrap(), json!(1));
        assert_eq!(read(PROPERTY_SENT_JOBS).unwrap(), json!(2));

        held.release_one(false);
        assert!(node.is_expired());
        assert!(matches!(
            read(PROPERTY_COMPLETED_JOBS),
            Err(PropertyError::NoSuchProperty(_))
        ));
    }

    #[tokio::test]
    async fn test_job_without_activity_becomes_error() {
        let (stack, mut rx) = DispatchStack::builder()
            .layer(Arc::new(Invoke::new()))
            .layer(Arc::new(Parallelize::new()))
            .build()
            .unwrap();

        stack.submit(DispatchDown::JobQueue(JobQueueEvent {
            owning_process: process(),
            queue: queue_with(vec![job(vec![0]), completion(vec![])]),
            activities: Vec::new(),
        }));

        let out = drain(&mut rx);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], DispatchUp::Error(e) if e.message == "no activity to invoke"));
        assert!(matches!(&out[1], DispatchUp::ResultCompletion(c) if c.is_final()));
    }

    #[tokio::test]
    async fn test_queue_arriving_after_finish_leaves_no_state() {
        let held = Arc::new(Held::default());
        let layer = Arc::new(Parallelize::new());
        let (stack, mut rx) = DispatchStack::builder()
            .layer(Arc::new(Invoke::new()))
            .layer(layer.clone())
            .build()
            .unwrap();

        let queue = queue_with(vec![job(vec![0]), completion(vec![])]);
        stack.submit(DispatchDown::JobQueue(JobQueueEvent {
            owning_process: process(),
            queue: queue.clone(),
            activities: vec![held.clone() as Arc<dyn Activity>],
        }));
        held.release_one(false);
        assert!(stack.is_finished(&process()));
        assert!(!layer.states.contains_key(&process()));

        // Delivered straight to the layer, as when the stack's own check ran
        // before the process finished on another thread.
        let ctx = LayerContext::new(&stack, 1);
        layer.receive_job_queue(
            &ctx,
            JobQueueEvent {
                owning_process: process(),
                queue,
                activities: vec![held.clone() as Arc<dyn Activity>],
            },
        );

        assert!(!layer.states.contains_key(&process()));
        assert_eq!(held.pending(), 0);
        assert_eq!(drain(&mut rx).len(), 2);
    }
}
