//! Live execution-state tree with synchronous observer notification.
//!
//! One `Monitor` exists per workflow run and is handed explicitly to the
//! components that report into it. Nodes are keyed by `OwningProcess`; the
//! tree shape follows the process path (a node's parent is the node for the
//! path with its last component removed).
//!
//! Delivery is synchronous on the producer's thread. The observer list is
//! snapshotted at notify time, observers are called in subscription order,
//! and an observer that returns an error or panics is logged and skipped.

pub mod property;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;
use weft_observe::fields;
use weft_types::error::ObserverError;
use weft_types::job::OwningProcess;

pub use property::{DynamicProperty, MonitorableProperty, StaticProperty};

/// Opaque handle to the workflow object a node reports on.
pub type WorkflowObject = Arc<dyn Any + Send + Sync>;

// ---------------------------------------------------------------------------
// MonitorNode
// ---------------------------------------------------------------------------

/// One live entry in the monitor tree.
///
/// Clones share the expiry flag, so a clone handed out before
/// deregistration reports `is_expired() == true` afterwards.
#[derive(Clone)]
pub struct MonitorNode {
    workflow_object: Option<WorkflowObject>,
    owning_process: OwningProcess,
    properties: Vec<Arc<dyn MonitorableProperty>>,
    created_at: DateTime<Utc>,
    expired: Arc<AtomicBool>,
}

impl MonitorNode {
    pub fn workflow_object(&self) -> Option<&WorkflowObject> {
        self.workflow_object.as_ref()
    }

    pub fn owning_process(&self) -> &OwningProcess {
        &self.owning_process
    }

    pub fn properties(&self) -> &[Arc<dyn MonitorableProperty>] {
        &self.properties
    }

    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&Arc<dyn MonitorableProperty>> {
        self.properties.iter().find(|p| p.name() == name)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MonitorNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorNode")
            .field("owning_process", &self.owning_process)
            .field("properties", &self.properties)
            .field("created_at", &self.created_at)
            .field("expired", &self.is_expired())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Messages and observers
// ---------------------------------------------------------------------------

/// What the monitor broadcasts to observers.
#[derive(Clone)]
pub enum MonitorMessage {
    Register {
        workflow_object: Option<WorkflowObject>,
        owning_process: OwningProcess,
        properties: Vec<Arc<dyn MonitorableProperty>>,
    },
    AddProperties {
        owning_process: OwningProcess,
        new_properties: Vec<Arc<dyn MonitorableProperty>>,
    },
    Deregister {
        owning_process: OwningProcess,
    },
}

impl MonitorMessage {
    pub fn owning_process(&self) -> &OwningProcess {
        match self {
            MonitorMessage::Register { owning_process, .. }
            | MonitorMessage::AddProperties { owning_process, .. }
            | MonitorMessage::Deregister { owning_process } => owning_process,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            MonitorMessage::Register { .. } => "register",
            MonitorMessage::AddProperties { .. } => "add_properties",
            MonitorMessage::Deregister { .. } => "deregister",
        }
    }
}

/// Receives monitor messages.
///
/// Called synchronously on the thread that changed the monitor. Returning an
/// error (or panicking) only affects this observer's delivery.
pub trait MonitorObserver: Send + Sync {
    fn notify(&self, message: &MonitorMessage) -> Result<(), ObserverError>;
}

/// Handle returned by [`Monitor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Per-run register/notify hub.
pub struct Monitor {
    run_id: Uuid,
    created_at: DateTime<Utc>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn MonitorObserver>)>>,
    next_observer: AtomicU64,
    nodes: DashMap<OwningProcess, MonitorNode>,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::now_v7(),
            created_at: Utc::now(),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(0),
            nodes: DashMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn subscribe(&self, observer: Arc<dyn MonitorObserver>) -> ObserverId {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::SeqCst));
        self.observers
            .write()
            .expect("observer lock poisoned")
            .push((id, observer));
        id
    }

    /// Remove an observer. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write().expect("observer lock poisoned");
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().expect("observer lock poisoned").len()
    }

    // -----------------------------------------------------------------------
    // Tree updates
    // -----------------------------------------------------------------------

    /// Create a node for `owning_process` and announce it.
    ///
    /// Registering a process that is already live replaces its node.
    pub fn register_node(
        &self,
        workflow_object: Option<WorkflowObject>,
        owning_process: OwningProcess,
        properties: Vec<Arc<dyn MonitorableProperty>>,
    ) {
        let node = MonitorNode {
            workflow_object: workflow_object.clone(),
            owning_process: owning_process.clone(),
            properties: properties.clone(),
            created_at: Utc::now(),
            expired: Arc::new(AtomicBool::new(false)),
        };
        if let Some(previous) = self.nodes.insert(owning_process.clone(), node) {
            previous.expired.store(true, Ordering::SeqCst);
        }

        self.broadcast(MonitorMessage::Register {
            workflow_object,
            owning_process,
            properties,
        });
    }

    /// Append properties to a live node and announce them.
    ///
    /// The announcement goes out even if the node is not live.
    pub fn add_properties_to_node(
        &self,
        owning_process: &OwningProcess,
        new_properties: Vec<Arc<dyn MonitorableProperty>>,
    ) {
        if let Some(mut node) = self.nodes.get_mut(owning_process) {
            node.properties.extend(new_properties.iter().cloned());
        }

        self.broadcast(MonitorMessage::AddProperties {
            owning_process: owning_process.clone(),
            new_properties,
        });
    }

    /// Expire a node, drop it from the tree and announce it.
    pub fn deregister_node(&self, owning_process: &OwningProcess) {
        if let Some((_, node)) = self.nodes.remove(owning_process) {
            node.expired.store(true, Ordering::SeqCst);
        }

        self.broadcast(MonitorMessage::Deregister {
            owning_process: owning_process.clone(),
        });
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn node(&self, owning_process: &OwningProcess) -> Option<MonitorNode> {
        self.nodes.get(owning_process).map(|n| n.value().clone())
    }

    /// Live nodes directly beneath `owning_process`, ordered by path.
    pub fn children_of(&self, owning_process: &OwningProcess) -> Vec<MonitorNode> {
        let mut children: Vec<MonitorNode> = self
            .nodes
            .iter()
            .filter(|entry| entry.key().parent().as_ref() == Some(owning_process))
            .map(|entry| entry.value().clone())
            .collect();
        children.sort_by(|a, b| a.owning_process.cmp(&b.owning_process));
        children
    }

    /// Every live node, ordered by path.
    pub fn live_nodes(&self) -> Vec<MonitorNode> {
        let mut nodes: Vec<MonitorNode> =
            self.nodes.iter().map(|entry| entry.value().clone()).collect();
        nodes.sort_by(|a, b| a.owning_process.cmp(&b.owning_process));
        nodes
    }

    fn broadcast(&self, message: MonitorMessage) {
        let snapshot = self
            .observers
            .read()
            .expect("observer lock poisoned")
            .clone();

        let span = tracing::debug_span!(
            fields::SPAN_MONITOR_NOTIFY,
            weft.run_id = %self.run_id,
            weft.owning_process = %message.owning_process(),
        );
        let _guard = span.enter();
        debug!(kind = message.kind(), observers = snapshot.len(), "broadcasting monitor message");

        for (id, observer) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| observer.notify(&message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(observer = ?id, error = %e, "monitor observer failed"),
                Err(_) => warn!(observer = ?id, "monitor observer panicked"),
            }
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("run_id", &self.run_id)
            .field("created_at", &self.created_at)
            .field("observers", &self.observer_count())
            .field("live_nodes", &self.nodes.len())
            .finish()
    }
}
