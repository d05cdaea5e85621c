//! Job and completion tokens for nested iteration.
//!
//! A `Job` locates one unit of work in nested iteration space by its index
//! array and carries the opaque data references bound to each named input.
//! A `Completion` says that no further jobs will arrive under an index
//! prefix. Both are tagged with the `OwningProcess` they belong to.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// OwningProcess
// ---------------------------------------------------------------------------

/// A path of identifiers locating a token in the execution hierarchy.
///
/// Displayed colon-joined, e.g. `df0:p4:42`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwningProcess(Vec<String>);

impl OwningProcess {
    /// Build a process path from its components, outermost first.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// The path components, outermost first.
    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Number of components in the path.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Return a new path with `name` appended.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut parts = self.0.clone();
        parts.push(name.into());
        Self(parts)
    }

    /// The enclosing path, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Whether `self` is a strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &OwningProcess) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }
}

impl fmt::Display for OwningProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

impl FromStr for OwningProcess {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self::new(s.split(':')))
    }
}

// ---------------------------------------------------------------------------
// DataRef
// ---------------------------------------------------------------------------

/// Opaque identifier of a datum held by the reference service.
///
/// The engine only clones, compares and forwards these; it never resolves
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataRef(String);

impl DataRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Job / Completion
// ---------------------------------------------------------------------------

/// A unit of work at one coordinate of nested iteration space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// The process this job belongs to.
    pub owning_process: OwningProcess,
    /// One component per level of iteration, outermost first.
    pub index: Vec<usize>,
    /// Named inputs bound to opaque data references.
    pub data: BTreeMap<String, DataRef>,
}

impl Job {
    pub fn new(
        owning_process: OwningProcess,
        index: Vec<usize>,
        data: BTreeMap<String, DataRef>,
    ) -> Self {
        Self {
            owning_process,
            index,
            data,
        }
    }

    /// A job binding a single named input.
    pub fn single(
        owning_process: OwningProcess,
        index: Vec<usize>,
        port: impl Into<String>,
        data: DataRef,
    ) -> Self {
        let mut map = BTreeMap::new();
        map.insert(port.into(), data);
        Self::new(owning_process, index, map)
    }
}

/// Signal that no more jobs will arrive under `index` for a process.
///
/// An empty index means the whole process stream is finished.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Completion {
    pub owning_process: OwningProcess,
    pub index: Vec<usize>,
}

impl Completion {
    pub fn new(owning_process: OwningProcess, index: Vec<usize>) -> Self {
        Self {
            owning_process,
            index,
        }
    }

    /// Whether this completion closes the entire stream.
    pub fn is_final(&self) -> bool {
        self.index.is_empty()
    }
}

/// What the iteration system emits and a job queue carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IterationEvent {
    Job(Job),
    Completion(Completion),
}

impl IterationEvent {
    pub fn owning_process(&self) -> &OwningProcess {
        match self {
            IterationEvent::Job(job) => &job.owning_process,
            IterationEvent::Completion(c) => &c.owning_process,
        }
    }

    pub fn index(&self) -> &[usize] {
        match self {
            IterationEvent::Job(job) => &job.index,
            IterationEvent::Completion(c) => &c.index,
        }
    }
}
