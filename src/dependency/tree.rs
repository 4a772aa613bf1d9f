//! Arena storage for dependency nodes.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::{ContextValue, DependencyNode, NodeId};
use crate::error::{HmrError, Result};

/// All live nodes, keyed by id, with the root created up front.
#[derive(Debug)]
pub struct DependencyTree {
    nodes: FxHashMap<NodeId, DependencyNode>,
    root: NodeId,
}

impl DependencyTree {
    pub fn new(max_listeners: usize) -> Self {
        let root = DependencyNode::root(max_listeners);
        let id = root.id.clone();
        let mut nodes = FxHashMap::default();
        nodes.insert(id.clone(), root);
        Self { nodes, root: id }
    }

    pub fn root_id(&self) -> &NodeId {
        &self.root
    }

    pub fn get(&self, id: &NodeId) -> Option<&DependencyNode> {
        self.nodes.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &NodeId) -> Option<&mut DependencyNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // =========================================================================
    // Structure
    // =========================================================================

    /// Insert `node` as a child of `parent`, at `slot` or at the end.
    pub(crate) fn attach(
        &mut self,
        parent: &NodeId,
        mut node: DependencyNode,
        slot: Option<usize>,
    ) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(HmrError::Construct {
                path: node.path().map(Path::to_path_buf).unwrap_or_default(),
                cause: format!("node {} is already mounted", node.id).into(),
            });
        }
        let Some(parent_node) = self.nodes.get_mut(parent) else {
            return Err(HmrError::NodeNotFound(parent.clone()));
        };
        let index = slot
            .unwrap_or(parent_node.children.len())
            .min(parent_node.children.len());
        parent_node.children.insert(index, node.id.clone());
        node.parent = Some(parent.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Parent id and index of `id` among its siblings.
    pub fn position(&self, id: &NodeId) -> Option<(NodeId, usize)> {
        let parent = self.nodes.get(id)?.parent.clone()?;
        let index = self
            .nodes
            .get(&parent)?
            .children
            .iter()
            .position(|c| c == id)?;
        Some((parent, index))
    }

    /// Unlink `id` from its parent. The node stays in the arena.
    pub(crate) fn detach(&mut self, id: &NodeId) -> Option<(NodeId, usize)> {
        let position = self.position(id);
        if let Some((parent, index)) = &position
            && let Some(parent_node) = self.nodes.get_mut(parent)
        {
            parent_node.children.remove(*index);
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = None;
        }
        position
    }

    /// Drop `id` from the arena. Callers detach and empty it first.
    pub(crate) fn remove(&mut self, id: &NodeId) -> Option<DependencyNode> {
        let node = self.nodes.remove(id)?;
        debug_assert!(node.children.is_empty(), "removed {id} with live children");
        Some(node)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Nearest context named `name`, starting at `from` and walking to the root.
    pub fn lookup(&self, from: &NodeId, name: &str) -> Result<ContextValue> {
        if !self.nodes.contains_key(from) {
            return Err(HmrError::NodeNotFound(from.clone()));
        }
        let mut current = Some(from);
        while let Some(id) = current {
            let Some(node) = self.nodes.get(id) else {
                break;
            };
            if let Some(entry) = node.context(name) {
                return Ok(Arc::clone(&entry.value));
            }
            current = node.parent.as_ref();
        }
        Err(HmrError::ContextNotFound {
            name: name.to_string(),
            from: from.clone(),
        })
    }

    /// Typed [`lookup`](Self::lookup).
    pub fn lookup_as<T: Any + Send + Sync>(&self, from: &NodeId, name: &str) -> Result<Arc<T>> {
        downcast(self.lookup(from, name)?, name)
    }

    /// Node backed by `path` (expected normalized), if mounted.
    pub fn find_by_path(&self, path: &Path) -> Option<NodeId> {
        let id = NodeId::from_path(path);
        self.nodes.contains_key(&id).then_some(id)
    }

    /// First node named `name` in depth-first pre-order from the root.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        let mut stack = vec![self.root.clone()];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if !id.is_root() && node.name == name {
                return Some(id);
            }
            stack.extend(node.children.iter().rev().cloned());
        }
        None
    }

    /// `id` and its descendants, children before parents.
    pub fn post_order(&self, id: &NodeId) -> Vec<NodeId> {
        fn visit(tree: &DependencyTree, id: &NodeId, out: &mut Vec<NodeId>) {
            if let Some(node) = tree.nodes.get(id) {
                for child in &node.children {
                    visit(tree, child, out);
                }
                out.push(id.clone());
            }
        }
        let mut out = Vec::new();
        visit(self, id, &mut out);
        out
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(id).and_then(|n| n.parent.clone());
        while let Some(parent) = current {
            current = self.nodes.get(&parent).and_then(|n| n.parent.clone());
            out.push(parent);
        }
        out
    }

    /// Verify parent/child links agree and every node is reachable from the root.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        for (id, node) in &self.nodes {
            let mut seen = FxHashSet::default();
            for child in &node.children {
                if !seen.insert(child) {
                    return Err(format!("{id} lists child {child} twice"));
                }
                match self.nodes.get(child) {
                    Some(c) if c.parent.as_ref() == Some(id) => {}
                    Some(_) => return Err(format!("{child} does not point back to {id}")),
                    None => return Err(format!("{id} lists missing child {child}")),
                }
            }
            if let Some(parent) = &node.parent
                && !self
                    .nodes
                    .get(parent)
                    .is_some_and(|p| p.children.contains(id))
            {
                return Err(format!("{parent} does not list child {id}"));
            }
        }
        if self.nodes.contains_key(&self.root) {
            let reachable = self.post_order(&self.root).len();
            if reachable != self.nodes.len() {
                return Err(format!(
                    "{} of {} nodes reachable from root",
                    reachable,
                    self.nodes.len()
                ));
            }
        }
        Ok(())
    }
}

pub(crate) fn downcast<T: Any + Send + Sync>(value: ContextValue, name: &str) -> Result<Arc<T>> {
    value.downcast::<T>().map_err(|_| HmrError::ContextType {
        name: name.to_string(),
    })
}
