use std::path::Path;
use std::sync::Arc;

use super::{ContextEntry, EventBus, FileIdentity, NodeId, NodeStatus, Teardown};
use crate::loader::Artifact;

/// One hot-reloadable unit in the tree.
///
/// Owns its contexts and side effects. Parent and children are ids into
/// the arena, so a node never outlives its entry in [`DependencyTree`](super::DependencyTree).
pub struct DependencyNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) file: Option<FileIdentity>,
    pub(crate) artifact: Option<Artifact>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) contexts: Vec<ContextEntry>,
    pub(crate) side_effects: Vec<Teardown>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) status: NodeStatus,
    pub(crate) last_error: Option<String>,
}

impl DependencyNode {
    pub(crate) fn root(max_listeners: usize) -> Self {
        Self {
            id: NodeId::root(),
            name: "root".to_string(),
            file: None,
            artifact: None,
            parent: None,
            children: Vec::new(),
            contexts: Vec::new(),
            side_effects: Vec::new(),
            bus: Arc::new(EventBus::new(max_listeners)),
            status: NodeStatus::Active,
            last_error: None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    pub fn file(&self) -> Option<&FileIdentity> {
        self.file.as_ref()
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Names of the contexts this node provides, in registration order.
    pub fn context_names(&self) -> impl Iterator<Item = &str> {
        self.contexts.iter().map(|c| c.name.as_str())
    }

    pub(crate) fn context(&self, name: &str) -> Option<&ContextEntry> {
        self.contexts.iter().find(|c| c.name == name)
    }
}

impl std::fmt::Debug for DependencyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("contexts", &self.context_names().collect::<Vec<_>>())
            .field("side_effects", &self.side_effects.len())
            .finish()
    }
}
