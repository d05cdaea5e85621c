//! A single iteration strategy: one node tree plus its runtime caches.
//!
//! Tokens enter at a named input leaf and travel up the tree. Cross product
//! nodes keep every job per child and emit each new combination as soon as
//! it exists; dot product nodes keep one `TreeCache` per child and emit once
//! every child holds a job at the same index. Whatever reaches the terminal
//! is returned to the caller as `IterationEvent`s.

use std::collections::{BTreeMap, HashMap, HashSet};

use weft_types::error::IterationError;
use weft_types::job::{Completion, DataRef, IterationEvent, Job, OwningProcess};

use super::cache::TreeCache;
use super::node::{IterationTree, NodeId, NodeKind};

// ---------------------------------------------------------------------------
// Per-process combiner state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CrossState {
    cached: Vec<Vec<Job>>,
    complete: Vec<bool>,
    /// Partial completions from the first child waiting on the others.
    held: Vec<Completion>,
}

impl CrossState {
    fn fit(&mut self, arity: usize) {
        self.cached.resize_with(arity, Vec::new);
        self.complete.resize(arity, false);
    }

    fn rest_complete(&self) -> bool {
        self.complete[1..].iter().all(|&c| c)
    }
}

#[derive(Debug, Default)]
struct DotState {
    caches: Vec<TreeCache>,
    completed: Vec<HashSet<Vec<usize>>>,
}

impl DotState {
    fn fit(&mut self, arity: usize) {
        self.caches.resize_with(arity, TreeCache::new);
        self.completed.resize_with(arity, HashSet::new);
    }

    fn covers(&self, slot: usize, index: &[usize]) -> bool {
        self.completed[slot].iter().any(|p| index.starts_with(p))
    }
}

// ---------------------------------------------------------------------------
// IterationStrategy
// ---------------------------------------------------------------------------

/// Node tree plus the caches that reconcile out-of-order arrival.
///
/// All runtime operations take `&mut self`; one strategy belongs to one run.
#[derive(Debug, Default)]
pub struct IterationStrategy {
    tree: IterationTree,
    cross: HashMap<(NodeId, OwningProcess), CrossState>,
    dot: HashMap<(NodeId, OwningProcess), DotState>,
}

impl IterationStrategy {
    pub fn new(tree: IterationTree) -> Self {
        Self {
            tree,
            cross: HashMap::new(),
            dot: HashMap::new(),
        }
    }

    /// All `ports` (name, declared depth) combined by one cross product.
    pub fn cross_product<S: Into<String>>(ports: impl IntoIterator<Item = (S, usize)>) -> Self {
        Self::combined(ports, false)
    }

    /// All `ports` (name, declared depth) combined by one dot product.
    pub fn dot_product<S: Into<String>>(ports: impl IntoIterator<Item = (S, usize)>) -> Self {
        Self::combined(ports, true)
    }

    fn combined<S: Into<String>>(ports: impl IntoIterator<Item = (S, usize)>, dot: bool) -> Self {
        let mut tree = IterationTree::new();
        let combiner = if dot {
            tree.add_dot_product()
        } else {
            tree.add_cross_product()
        };
        let terminal = tree.terminal();
        // Fresh nodes on a fresh tree cannot violate structure.
        let _ = tree.insert_child(terminal, combiner, None);
        for (name, depth) in ports {
            let leaf = tree.add_named_input(name, depth);
            let _ = tree.insert_child(combiner, leaf, None);
        }
        Self::new(tree)
    }

    pub fn tree(&self) -> &IterationTree {
        &self.tree
    }

    /// Mutable access for structural edits. Edits are a construction-time
    /// concern; runtime state is keyed by node and survives them only if the
    /// arity of each combiner is unchanged.
    pub fn tree_mut(&mut self) -> &mut IterationTree {
        &mut self.tree
    }

    pub fn desired_depths(&self) -> BTreeMap<String, usize> {
        self.tree.desired_depths()
    }

    pub fn iteration_depth(&self, depths: &HashMap<String, usize>) -> Result<usize, IterationError> {
        self.tree.iteration_depth(depths)
    }

    /// Whether any combiner still buffers state for `process`.
    pub fn has_state_for(&self, process: &OwningProcess) -> bool {
        self.cross.keys().any(|(_, p)| p == process) || self.dot.keys().any(|(_, p)| p == process)
    }

    // -----------------------------------------------------------------------
    // Runtime
    // -----------------------------------------------------------------------

    /// Feed one token arriving on `port` and return what reaches the terminal.
    ///
    /// The token is already at the port's declared depth; `index` has one
    /// component per level of effective depth.
    pub fn receive_data(
        &mut self,
        port: &str,
        process: &OwningProcess,
        index: &[usize],
        data: DataRef,
    ) -> Result<Vec<IterationEvent>, IterationError> {
        let leaf = self
            .tree
            .named_input(port)
            .ok_or_else(|| IterationError::MissingInput(port.to_string()))?;
        let job = Job::single(process.clone(), index.to_vec(), port, data);
        let mut out = Vec::new();
        self.push_up(leaf, IterationEvent::Job(job), &mut out)?;
        Ok(out)
    }

    /// Signal that `port` will deliver nothing more under `index`.
    pub fn receive_completion(
        &mut self,
        port: &str,
        process: &OwningProcess,
        index: &[usize],
    ) -> Result<Vec<IterationEvent>, IterationError> {
        let leaf = self
            .tree
            .named_input(port)
            .ok_or_else(|| IterationError::MissingInput(port.to_string()))?;
        let completion = Completion::new(process.clone(), index.to_vec());
        let mut out = Vec::new();
        self.push_up(leaf, IterationEvent::Completion(completion), &mut out)?;
        Ok(out)
    }

    /// Drop every buffered job for `process`.
    pub fn discard(&mut self, process: &OwningProcess) {
        self.cross.retain(|(_, p), _| p != process);
        self.dot.retain(|(_, p), _| p != process);
    }

    fn push_up(
        &mut self,
        from: NodeId,
        event: IterationEvent,
        out: &mut Vec<IterationEvent>,
    ) -> Result<(), IterationError> {
        let Some(parent) = self.tree.parent(from) else {
            tracing::trace!(node = %from, "detached iteration node dropped event");
            return Ok(());
        };
        let slot = self
            .tree
            .position_of(parent, from)
            .ok_or(IterationError::UnknownNode(from.index()))?;
        match self.tree.kind(parent)?.clone() {
            NodeKind::Terminal => {
                out.push(event);
                Ok(())
            }
            NodeKind::CrossProduct => self.cross_receive(parent, slot, event, out),
            NodeKind::DotProduct => self.dot_receive(parent, slot, event, out),
            NodeKind::NamedInput { .. } => Ok(()),
        }
    }

    fn cross_receive(
        &mut self,
        node: NodeId,
        slot: usize,
        event: IterationEvent,
        out: &mut Vec<IterationEvent>,
    ) -> Result<(), IterationError> {
        let arity = self.tree.children(node).len();
        if arity == 1 {
            return self.push_up(node, event, out);
        }
        let key = (node, event.owning_process().clone());

        let emitted = match event {
            IterationEvent::Job(job) => {
                let state = self.cross.entry(key).or_default();
                state.fit(arity);
                state.cached[slot].push(job.clone());

                let mut combos: Vec<Vec<&Job>> = vec![Vec::new()];
                for (c, cached) in state.cached.iter().enumerate() {
                    let choices: Vec<&Job> = if c == slot {
                        vec![&job]
                    } else {
                        cached.iter().collect()
                    };
                    combos = combos
                        .into_iter()
                        .flat_map(|prefix| {
                            choices.iter().map(move |&choice| {
                                let mut next = prefix.clone();
                                next.push(choice);
                                next
                            })
                        })
                        .collect();
                }
                combos
                    .into_iter()
                    .map(|parts| IterationEvent::Job(merge(&job.owning_process, &parts)))
                    .collect::<Vec<_>>()
            }
            IterationEvent::Completion(completion) => {
                let state = self.cross.entry(key.clone()).or_default();
                state.fit(arity);
                if completion.is_final() {
                    state.complete[slot] = true;
                    let mut emitted = Vec::new();
                    if state.rest_complete() {
                        emitted.extend(state.held.drain(..).map(IterationEvent::Completion));
                    }
                    if state.complete.iter().all(|&c| c) {
                        self.cross.remove(&key);
                        emitted.push(IterationEvent::Completion(completion));
                    }
                    emitted
                } else if slot == 0 {
                    // Only the first child's index leads the combined index.
                    if state.rest_complete() {
                        vec![IterationEvent::Completion(completion)]
                    } else {
                        state.held.push(completion);
                        Vec::new()
                    }
                } else {
                    Vec::new()
                }
            }
        };

        for event in emitted {
            self.push_up(node, event, out)?;
        }
        Ok(())
    }

    fn dot_receive(
        &mut self,
        node: NodeId,
        slot: usize,
        event: IterationEvent,
        out: &mut Vec<IterationEvent>,
    ) -> Result<(), IterationError> {
        let arity = self.tree.children(node).len();
        if arity == 1 {
            return self.push_up(node, event, out);
        }
        let key = (node, event.owning_process().clone());

        let emitted = match event {
            IterationEvent::Job(job) => {
                let state = self.dot.entry(key).or_default();
                state.fit(arity);
                let index = job.index.clone();
                let process = job.owning_process.clone();
                state.caches[slot].insert_job(job)?;

                if state.caches.iter().all(|c| c.contains_location(&index)) {
                    let parts: Vec<&Job> = state
                        .caches
                        .iter()
                        .filter_map(|c| c.get(&index))
                        .collect();
                    let mut combined = merge(&process, &parts);
                    for cache in &mut state.caches {
                        cache.cut(&index);
                    }
                    // Every part sits at the same index.
                    combined.index = index;
                    Some(IterationEvent::Job(combined))
                } else {
                    None
                }
            }
            IterationEvent::Completion(completion) => {
                let state = self.dot.entry(key.clone()).or_default();
                state.fit(arity);
                state.completed[slot].insert(completion.index.clone());

                if (0..arity).all(|c| state.covers(c, &completion.index)) {
                    if completion.is_final() {
                        self.dot.remove(&key);
                    } else {
                        for cache in &mut state.caches {
                            cache.cut(&completion.index);
                        }
                        for done in &mut state.completed {
                            done.remove(&completion.index);
                        }
                    }
                    Some(IterationEvent::Completion(completion))
                } else {
                    None
                }
            }
        };

        if let Some(event) = emitted {
            self.push_up(node, event, out)?;
        }
        Ok(())
    }
}

/// Combine child jobs in child order: indices concatenate, data merges.
fn merge(process: &OwningProcess, parts: &[&Job]) -> Job {
    let mut index = Vec::new();
    let mut data = BTreeMap::new();
    for part in parts {
        index.extend_from_slice(&part.index);
        data.extend(part.data.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Job::new(process.clone(), index, data)
}
