//! Sparse job cache addressed by index arrays.
//!
//! Nested iteration sources deliver data out of order across dimensions, so
//! a dot product can only combine once every child holds a job at the same
//! coordinate. `TreeCache` buffers those jobs in an n-ary tree with one level
//! per index component, giving O(depth) insert and lookup.

use weft_types::error::IterationError;
use weft_types::job::Job;

/// Largest index component a cache accepts. Missing siblings are padded, so
/// this bounds the allocation a single insert can cause.
pub const MAX_INDEX_COMPONENT: usize = 1 << 24;

#[derive(Debug, Default, Clone)]
struct CacheNode {
    children: Vec<CacheNode>,
    job: Option<Job>,
}

impl CacheNode {
    fn is_empty(&self) -> bool {
        self.job.is_none() && self.children.iter().all(CacheNode::is_empty)
    }

    fn descend(&self, index: &[usize]) -> Option<&CacheNode> {
        let mut node = self;
        for &i in index {
            node = node.children.get(i)?;
        }
        Some(node)
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Job>) {
        if let Some(job) = &self.job {
            out.push(job);
        }
        for child in &self.children {
            child.collect(out);
        }
    }

    fn count(&self) -> usize {
        usize::from(self.job.is_some()) + self.children.iter().map(CacheNode::count).sum::<usize>()
    }
}

/// Sparse tree of jobs keyed by index array.
///
/// All jobs in one cache share an index length; the first insert fixes it.
/// Mutation takes `&mut self`, so the owner provides the single-writer
/// discipline.
#[derive(Debug, Default, Clone)]
pub struct TreeCache {
    root: CacheNode,
    index_len: Option<usize>,
}

impl TreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `job` at `job.index`, padding missing siblings with empty nodes.
    ///
    /// A job already present at that location is replaced. Nothing is
    /// stored when the index is rejected.
    pub fn insert_job(&mut self, job: Job) -> Result<(), IterationError> {
        if let Some(&component) = job.index.iter().find(|&&i| i > MAX_INDEX_COMPONENT) {
            return Err(IterationError::IndexOutOfRange {
                component,
                limit: MAX_INDEX_COMPONENT,
            });
        }
        match self.index_len {
            Some(expected) if expected != job.index.len() => {
                return Err(IterationError::IndexLengthMismatch {
                    expected,
                    found: job.index.len(),
                });
            }
            _ => self.index_len = Some(job.index.len()),
        }

        let mut node = &mut self.root;
        for &i in &job.index {
            if node.children.len() <= i {
                let len = i.checked_add(1).ok_or(IterationError::IndexOutOfRange {
                    component: i,
                    limit: MAX_INDEX_COMPONENT,
                })?;
                node.children.resize_with(len, CacheNode::default);
            }
            node = &mut node.children[i];
        }
        node.job = Some(job);
        Ok(())
    }

    /// The job stored exactly at `index`, if any.
    pub fn get(&self, index: &[usize]) -> Option<&Job> {
        self.root.descend(index)?.job.as_ref()
    }

    pub fn contains_location(&self, index: &[usize]) -> bool {
        self.get(index).is_some()
    }

    /// Remove the subtree addressed by `index`.
    ///
    /// The slot named by the last component is emptied in its parent; sibling
    /// positions are unaffected. Cutting the empty index clears the cache,
    /// index length included.
    pub fn cut(&mut self, index: &[usize]) {
        let Some((&last, prefix)) = index.split_last() else {
            self.root = CacheNode::default();
            self.index_len = None;
            return;
        };

        let mut node = &mut self.root;
        for &i in prefix {
            match node.children.get_mut(i) {
                Some(child) => node = child,
                None => return,
            }
        }
        if let Some(slot) = node.children.get_mut(last) {
            *slot = CacheNode::default();
        }
        while node.children.last().is_some_and(CacheNode::is_empty) {
            node.children.pop();
        }
    }

    /// Every job whose index extends `prefix`, in tree order.
    pub fn jobs_with_prefix(&self, prefix: &[usize]) -> Vec<&Job> {
        let mut out = Vec::new();
        if let Some(node) = self.root.descend(prefix) {
            node.collect(&mut out);
        }
        out
    }

    /// Number of jobs currently held.
    pub fn len(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}
