//! Iteration strategy node tree.
//!
//! Nodes live in an arena and are addressed by `NodeId` handles; a parent is
//! an `Option<NodeId>`. The root is always the terminal node. Leaves are
//! named input ports with a declared depth; internal nodes combine their
//! children by cross product (cartesian expansion) or dot product
//! (index-aligned pairing).

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use weft_types::error::IterationError;

/// Stable handle to a node in an `IterationTree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a node does with its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Tree root; passes its single child's output to the strategy.
    Terminal,
    /// Cartesian product of all children.
    CrossProduct,
    /// Index-aligned pairing of all children.
    DotProduct,
    /// Leaf bound to an input port consuming items of `depth`.
    NamedInput { name: String, depth: usize },
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena-backed iteration node tree rooted at a terminal node.
#[derive(Debug, Clone)]
pub struct IterationTree {
    nodes: Vec<Node>,
}

impl IterationTree {
    /// A tree holding only its terminal root.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Terminal,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn terminal(&self) -> NodeId {
        NodeId(0)
    }

    // -----------------------------------------------------------------------
    // Node creation and lookup
    // -----------------------------------------------------------------------

    pub fn add_named_input(&mut self, name: impl Into<String>, depth: usize) -> NodeId {
        self.push(NodeKind::NamedInput {
            name: name.into(),
            depth,
        })
    }

    pub fn add_cross_product(&mut self) -> NodeId {
        self.push(NodeKind::CrossProduct)
    }

    pub fn add_dot_product(&mut self) -> NodeId {
        self.push(NodeKind::DotProduct)
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    fn node(&self, id: NodeId) -> Result<&Node, IterationError> {
        self.nodes.get(id.0).ok_or(IterationError::UnknownNode(id.0))
    }

    pub fn kind(&self, id: NodeId) -> Result<&NodeKind, IterationError> {
        Ok(&self.node(id)?.kind)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id.0)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Position of `child` among `parent`'s children.
    pub fn position_of(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        self.children(parent).iter().position(|&c| c == child)
    }

    /// Whether `ancestor` lies on the parent chain above `node`.
    ///
    /// The walk is bounded by the arena size.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.parent(node);
        let mut steps = 0;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.nodes.len() {
                break;
            }
            current = self.parent(id);
        }
        false
    }

    /// Whether `node` hangs (transitively) under the terminal.
    pub fn is_attached(&self, node: NodeId) -> bool {
        node == self.terminal() || self.is_ancestor(self.terminal(), node)
    }

    /// The attached leaf bound to `port`.
    pub fn named_input(&self, port: &str) -> Option<NodeId> {
        self.leaves()
            .into_iter()
            .find(|&id| matches!(&self.nodes[id.0].kind, NodeKind::NamedInput { name, .. } if name == port))
    }

    /// Attached leaves in tree order.
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.terminal()];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if matches!(node.kind, NodeKind::NamedInput { .. }) {
                out.push(id);
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// Declared depth of every attached input port.
    pub fn desired_depths(&self) -> BTreeMap<String, usize> {
        self.leaves()
            .into_iter()
            .filter_map(|id| match &self.nodes[id.0].kind {
                NodeKind::NamedInput { name, depth } => Some((name.clone(), *depth)),
                _ => None,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Structural edits
    // -----------------------------------------------------------------------

    /// Insert `child` under `parent` at `position` (append when `None`).
    ///
    /// Re-inserting a child at its current position, or appending a child that
    /// is already present, is a no-op. Inserting at another position moves it.
    /// A child held by another parent is detached from it first. On error the
    /// tree is unchanged.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        child: NodeId,
        position: Option<usize>,
    ) -> Result<(), IterationError> {
        self.check_insert(parent, child)?;

        if self.nodes[child.0].parent == Some(parent) {
            let current = self
                .position_of(parent, child)
                .ok_or(IterationError::UnknownNode(child.0))?;
            let Some(target) = position else {
                return Ok(());
            };
            let siblings = &mut self.nodes[parent.0].children;
            let target = target.min(siblings.len() - 1);
            if target != current {
                siblings.remove(current);
                siblings.insert(target, child);
            }
            return Ok(());
        }

        self.detach(child);
        let siblings = &mut self.nodes[parent.0].children;
        match position {
            Some(p) => siblings.insert(p.min(siblings.len()), child),
            None => siblings.push(child),
        }
        self.nodes[child.0].parent = Some(parent);
        Ok(())
    }

    /// Re-parent `child`, or detach it when `parent` is `None`.
    ///
    /// Setting the current parent again keeps the child's position.
    pub fn set_parent(
        &mut self,
        child: NodeId,
        parent: Option<NodeId>,
    ) -> Result<(), IterationError> {
        self.node(child)?;
        match parent {
            Some(p) => self.insert_child(p, child, None),
            None => {
                self.detach(child);
                Ok(())
            }
        }
    }

    /// Remove `child` from `parent`. Returns `true` if it was a child.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        if self.parent(child) != Some(parent) {
            return false;
        }
        self.detach(child);
        true
    }

    fn check_insert(&self, parent: NodeId, child: NodeId) -> Result<(), IterationError> {
        let parent_node = self.node(parent)?;
        self.node(child)?;

        if parent == child {
            return Err(IterationError::IllegalArgument(format!(
                "node {child} cannot be its own child"
            )));
        }
        if child == self.terminal() {
            return Err(IterationError::IllegalArgument(
                "the terminal node cannot be a child".to_string(),
            ));
        }
        if self.is_ancestor(child, parent) {
            return Err(IterationError::IllegalArgument(format!(
                "inserting {child} under {parent} would create a cycle"
            )));
        }
        match parent_node.kind {
            NodeKind::NamedInput { ref name, .. } => Err(IterationError::IllegalState(format!(
                "named input '{name}' cannot have children"
            ))),
            NodeKind::Terminal
                if parent_node.children.iter().any(|&c| c != child) =>
            {
                Err(IterationError::IllegalState(
                    "terminal node already has a child".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    fn detach(&mut self, child: NodeId) {
        if let Some(old) = self.nodes[child.0].parent.take() {
            self.nodes[old.0].children.retain(|&c| c != child);
        }
    }

    /// Splice out cross/dot nodes with a single child and drop empty ones.
    pub fn normalize(&mut self) {
        loop {
            let candidate = self.attached_internal().into_iter().find(|&id| {
                self.nodes[id.0].children.len() <= 1
            });
            let Some(id) = candidate else { break };
            let Some(parent) = self.nodes[id.0].parent else { break };
            let position = self.position_of(parent, id).unwrap_or(0);
            let only_child = self.nodes[id.0].children.first().copied();
            self.detach(id);
            if let Some(child) = only_child {
                self.detach(child);
                self.nodes[parent.0].children.insert(position, child);
                self.nodes[child.0].parent = Some(parent);
            }
        }
    }

    fn attached_internal(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![self.terminal()];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if matches!(node.kind, NodeKind::CrossProduct | NodeKind::DotProduct) {
                out.push(id);
            }
            stack.extend(node.children.iter().rev());
        }
        out
    }

    // -----------------------------------------------------------------------
    // Depth computation
    // -----------------------------------------------------------------------

    /// Iteration depth produced at the terminal for the supplied data depths.
    pub fn iteration_depth(&self, depths: &HashMap<String, usize>) -> Result<usize, IterationError> {
        self.depth_of(self.terminal(), depths)
    }

    /// Iteration depth produced by the subtree at `id`.
    pub fn depth_of(
        &self,
        id: NodeId,
        depths: &HashMap<String, usize>,
    ) -> Result<usize, IterationError> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::NamedInput { name, depth } => {
                let supplied = depths
                    .get(name)
                    .ok_or_else(|| IterationError::MissingInput(name.clone()))?;
                Ok(supplied.saturating_sub(*depth))
            }
            NodeKind::Terminal => match node.children.first() {
                Some(&child) => self.depth_of(child, depths),
                None => Ok(0),
            },
            NodeKind::CrossProduct => node
                .children
                .iter()
                .map(|&c| self.depth_of(c, depths))
                .sum(),
            NodeKind::DotProduct => {
                let mut shared: Option<usize> = None;
                for &c in &node.children {
                    let d = self.depth_of(c, depths)?;
                    match shared {
                        None => shared = Some(d),
                        Some(expected) if expected != d => {
                            return Err(IterationError::TypeMismatch { expected, found: d });
                        }
                        Some(_) => {}
                    }
                }
                Ok(shared.unwrap_or(0))
            }
        }
    }
}

impl Default for IterationTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depths(pairs: &[(&str, usize)]) -> HashMap<String, usize> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// terminal -> combiner(a: da, b: db)
    fn binary(dot: bool, da: usize, db: usize) -> IterationTree {
        let mut tree = IterationTree::new();
        let comb = if dot {
            tree.add_dot_product()
        } else {
            tree.add_cross_product()
        };
        let a = tree.add_named_input("a", da);
        let b = tree.add_named_input("b", db);
        tree.insert_child(tree.terminal(), comb, None).unwrap();
        tree.insert_child(comb, a, None).unwrap();
        tree.insert_child(comb, b, None).unwrap();
        tree
    }

    // -----------------------------------------------------------------------
    // Depth
    // -----------------------------------------------------------------------

    #[test]
    fn test_dot_product_depths() {
        let tree = binary(true, 0, 0);
        assert_eq!(tree.iteration_depth(&depths(&[("a", 1), ("b", 1)])).unwrap(), 1);
        assert_eq!(tree.iteration_depth(&depths(&[("a", 2), ("b", 2)])).unwrap(), 2);
        let tree01 = binary(true, 0, 1);
        assert_eq!(tree01.iteration_depth(&depths(&[("a", 1), ("b", 2)])).unwrap(), 1);
    }

    #[test]
    fn test_dot_product_mismatch() {
        let tree = binary(true, 0, 0);
        let err = tree
            .iteration_depth(&depths(&[("a", 1), ("b", 2)]))
            .unwrap_err();
        assert!(matches!(err, IterationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_cross_product_depths() {
        let tree = binary(false, 0, 0);
        assert_eq!(tree.iteration_depth(&depths(&[("a", 1), ("b", 1)])).unwrap(), 2);
        assert_eq!(tree.iteration_depth(&depths(&[("a", 2), ("b", 2)])).unwrap(), 4);
        assert_eq!(tree.iteration_depth(&depths(&[("a", 1), ("b", 2)])).unwrap(), 3);
        let tree01 = binary(false, 0, 1);
        assert_eq!(tree01.iteration_depth(&depths(&[("a", 1), ("b", 2)])).unwrap(), 2);
    }

    #[test]
    fn test_missing_input_depth() {
        let tree = binary(false, 0, 0);
        let err = tree.iteration_depth(&depths(&[("a", 1)])).unwrap_err();
        assert_eq!(err, IterationError::MissingInput("b".to_string()));
    }

    #[test]
    fn test_shallow_input_is_depth_zero() {
        let tree = binary(false, 2, 0);
        assert_eq!(tree.iteration_depth(&depths(&[("a", 1), ("b", 0)])).unwrap(), 0);
    }

    #[test]
    fn test_empty_terminal_depth_zero() {
        let tree = IterationTree::new();
        assert_eq!(tree.iteration_depth(&HashMap::new()).unwrap(), 0);
    }

    #[test]
    fn test_nested_dot_inside_cross() {
        // cross(dot(a, b), c)
        let mut tree = IterationTree::new();
        let cross = tree.add_cross_product();
        let dot = tree.add_dot_product();
        let a = tree.add_named_input("a", 0);
        let b = tree.add_named_input("b", 0);
        let c = tree.add_named_input("c", 1);
        tree.insert_child(tree.terminal(), cross, None).unwrap();
        tree.insert_child(cross, dot, None).unwrap();
        tree.insert_child(cross, c, None).unwrap();
        tree.insert_child(dot, a, None).unwrap();
        tree.insert_child(dot, b, None).unwrap();
        let d = tree
            .iteration_depth(&depths(&[("a", 1), ("b", 1), ("c", 3)]))
            .unwrap();
        assert_eq!(d, 3);
        assert_eq!(
            tree.desired_depths().into_iter().collect::<Vec<_>>(),
            vec![("a".to_string(), 0), ("b".to_string(), 0), ("c".to_string(), 1)]
        );
    }

    // -----------------------------------------------------------------------
    // Structural edits
    // -----------------------------------------------------------------------

    #[test]
    fn test_terminal_rejects_second_child() {
        let mut tree = IterationTree::new();
        let a = tree.add_named_input("a", 0);
        let b = tree.add_named_input("b", 0);
        tree.insert_child(tree.terminal(), a, None).unwrap();
        let err = tree.insert_child(tree.terminal(), b, None).unwrap_err();
        assert!(matches!(err, IterationError::IllegalState(_)));
        assert_eq!(tree.children(tree.terminal()), &[a]);
        assert_eq!(tree.parent(b), None);
        // Re-inserting the existing child is fine.
        tree.insert_child(tree.terminal(), a, None).unwrap();
        assert_eq!(tree.children(tree.terminal()), &[a]);
    }

    #[test]
    fn test_named_input_rejects_children() {
        let mut tree = IterationTree::new();
        let a = tree.add_named_input("a", 0);
        let b = tree.add_named_input("b", 0);
        let err = tree.insert_child(a, b, None).unwrap_err();
        assert!(matches!(err, IterationError::IllegalState(_)));
        assert!(tree.children(a).is_empty());
    }

    #[test]
    fn test_self_insert_rejected_and_tree_unchanged() {
        let mut tree = binary(false, 0, 0);
        let cross = tree.children(tree.terminal())[0];
        let before_children = tree.children(cross).to_vec();
        let before_parent = tree.parent(cross);

        let err = tree.insert_child(cross, cross, None).unwrap_err();
        assert!(matches!(err, IterationError::IllegalArgument(_)));
        let err = tree.set_parent(cross, Some(cross)).unwrap_err();
        assert!(matches!(err, IterationError::IllegalArgument(_)));

        assert_eq!(tree.children(cross), before_children.as_slice());
        assert_eq!(tree.parent(cross), before_parent);
    }

    #[test]
    fn test_ancestor_cycle_rejected() {
        let mut tree = IterationTree::new();
        let outer = tree.add_cross_product();
        let inner = tree.add_dot_product();
        tree.insert_child(tree.terminal(), outer, None).unwrap();
        tree.insert_child(outer, inner, None).unwrap();
        let err = tree.insert_child(inner, outer, None).unwrap_err();
        assert!(matches!(err, IterationError::IllegalArgument(_)));
        assert_eq!(tree.parent(outer), Some(tree.terminal()));
        assert_eq!(tree.children(inner), &[] as &[NodeId]);
        // The terminal can never become a child.
        let err = tree.insert_child(inner, tree.terminal(), None).unwrap_err();
        assert!(matches!(err, IterationError::IllegalArgument(_)));
    }

    #[test]
    fn test_duplicate_insert_is_noop_and_reposition_moves() {
        let mut tree = IterationTree::new();
        let cross = tree.add_cross_product();
        let a = tree.add_named_input("a", 0);
        let b = tree.add_named_input("b", 0);
        let c = tree.add_named_input("c", 0);
        for n in [a, b, c] {
            tree.insert_child(cross, n, None).unwrap();
        }

        tree.insert_child(cross, b, Some(1)).unwrap();
        assert_eq!(tree.children(cross), &[a, b, c]);
        tree.insert_child(cross, b, None).unwrap();
        assert_eq!(tree.children(cross), &[a, b, c]);

        tree.insert_child(cross, c, Some(0)).unwrap();
        assert_eq!(tree.children(cross), &[c, a, b]);
        tree.insert_child(cross, c, Some(10)).unwrap();
        assert_eq!(tree.children(cross), &[a, b, c]);
        assert_eq!(tree.parent(c), Some(cross));
    }

    #[test]
    fn test_set_parent_moves_between_parents() {
        let mut tree = IterationTree::new();
        let x = tree.add_cross_product();
        let y = tree.add_dot_product();
        let a = tree.add_named_input("a", 0);
        tree.insert_child(x, a, None).unwrap();
        tree.set_parent(a, Some(y)).unwrap();
        assert!(tree.children(x).is_empty());
        assert_eq!(tree.children(y), &[a]);
        tree.set_parent(a, None).unwrap();
        assert_eq!(tree.parent(a), None);
        assert!(tree.children(y).is_empty());
        assert!(!tree.remove_child(y, a));
    }

    #[test]
    fn test_named_input_lookup_requires_attachment() {
        let mut tree = IterationTree::new();
        let a = tree.add_named_input("a", 0);
        assert_eq!(tree.named_input("a"), None);
        tree.insert_child(tree.terminal(), a, None).unwrap();
        assert_eq!(tree.named_input("a"), Some(a));
        assert!(tree.is_attached(a));
    }

    #[test]
    fn test_normalize_splices_single_child_nodes() {
        let mut tree = IterationTree::new();
        let cross = tree.add_cross_product();
        let dot = tree.add_dot_product();
        let empty = tree.add_dot_product();
        let a = tree.add_named_input("a", 0);
        let b = tree.add_named_input("b", 0);
        tree.insert_child(tree.terminal(), cross, None).unwrap();
        tree.insert_child(cross, dot, None).unwrap();
        tree.insert_child(cross, b, None).unwrap();
        tree.insert_child(cross, empty, None).unwrap();
        tree.insert_child(dot, a, None).unwrap();

        tree.normalize();
        assert_eq!(tree.children(cross), &[a, b]);
        assert_eq!(tree.parent(a), Some(cross));
        assert_eq!(tree.parent(dot), None);
        assert_eq!(tree.parent(empty), None);
    }
}
