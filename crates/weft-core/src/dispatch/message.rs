//! Messages that travel through a dispatch stack, and the state-effect
//! vocabulary layers use to describe how they react to them.
//!
//! Downward: a job queue for an owning process, or one extracted job.
//! Upward: a result, a (partial) result completion, or an error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use weft_types::job::{IterationEvent, Job, OwningProcess};

use crate::activity::{Activity, DataMap};

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Shared FIFO of iteration events for one owning process.
///
/// The producer keeps pushing while layers pull; clones share the queue.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    events: Arc<Mutex<VecDeque<IterationEvent>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: IterationEvent) {
        self.events.lock().expect("job queue lock poisoned").push_back(event);
    }

    pub fn pop(&self) -> Option<IterationEvent> {
        self.events.lock().expect("job queue lock poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("job queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles refer to the same queue.
    pub fn same_queue(&self, other: &JobQueue) -> bool {
        Arc::ptr_eq(&self.events, &other.events)
    }
}

// ---------------------------------------------------------------------------
// Downward messages
// ---------------------------------------------------------------------------

/// A job queue plus the activities its jobs may run against.
#[derive(Debug, Clone)]
pub struct JobQueueEvent {
    pub owning_process: OwningProcess,
    pub queue: JobQueue,
    pub activities: Vec<Arc<dyn Activity>>,
}

/// One job extracted from a queue.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job: Job,
    pub activities: Vec<Arc<dyn Activity>>,
}

impl JobEvent {
    pub fn owning_process(&self) -> &OwningProcess {
        &self.job.owning_process
    }

    pub fn index(&self) -> &[usize] {
        &self.job.index
    }
}

#[derive(Debug, Clone)]
pub enum DispatchDown {
    JobQueue(JobQueueEvent),
    Job(JobEvent),
}

impl DispatchDown {
    pub fn owning_process(&self) -> &OwningProcess {
        match self {
            DispatchDown::JobQueue(e) => &e.owning_process,
            DispatchDown::Job(e) => e.owning_process(),
        }
    }
}

// ---------------------------------------------------------------------------
// Upward messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultEvent {
    pub owning_process: OwningProcess,
    pub index: Vec<usize>,
    pub data: DataMap,
    /// Partial result below the job's index; more may follow.
    pub streaming: bool,
}

/// No more results will arrive under `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub owning_process: OwningProcess,
    pub index: Vec<usize>,
}

impl CompletionEvent {
    pub fn is_final(&self) -> bool {
        self.index.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub owning_process: OwningProcess,
    pub index: Vec<usize>,
    pub message: String,
    pub cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchUp {
    Result(ResultEvent),
    ResultCompletion(CompletionEvent),
    Error(ErrorEvent),
}

impl DispatchUp {
    pub fn owning_process(&self) -> &OwningProcess {
        match self {
            DispatchUp::Result(e) => &e.owning_process,
            DispatchUp::ResultCompletion(e) => &e.owning_process,
            DispatchUp::Error(e) => &e.owning_process,
        }
    }

    pub fn index(&self) -> &[usize] {
        match self {
            DispatchUp::Result(e) => &e.index,
            DispatchUp::ResultCompletion(e) => &e.index,
            DispatchUp::Error(e) => &e.index,
        }
    }
}

// ---------------------------------------------------------------------------
// State effects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JobQueue,
    Job,
    Result,
    ResultCompletion,
    Error,
}

/// What a layer's state is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateScope {
    ProcessAndIndex,
    Process,
    Global,
}

/// How reacting to a message changes a layer's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEffect {
    None,
    Create(StateScope),
    Remove(StateScope),
    Update(StateScope),
}

/// A layer's declared reaction to one message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerReaction {
    pub message: MessageKind,
    pub effects: Vec<StateEffect>,
}

impl LayerReaction {
    pub fn new(message: MessageKind, effects: impl Into<Vec<StateEffect>>) -> Self {
        Self {
            message,
            effects: effects.into(),
        }
    }

    pub fn is_stateless(&self) -> bool {
        self.effects.iter().all(|e| *e == StateEffect::None)
    }
}
