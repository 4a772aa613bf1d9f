//! Construction of a node by the host factory.

use std::any::Any;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use super::context::upsert;
use super::tree::downcast;
use super::{
    Context, ContextEntry, DependencyNode, EventBus, FileIdentity, ListenerId, MountInfo, NodeId,
    NodeStatus, SharedTree, Teardown,
};
use crate::error::{BoxError, HmrError, Result};
use crate::freshness::ContentHash;
use crate::loader::{Artifact, LoadedModule, Version};

/// Builds a node from a freshly evaluated module.
///
/// Called on every import and on every successful reload of the backing
/// file. A returned error rolls the whole construction back.
pub trait NodeFactory: Send + Sync {
    fn create(&self, setup: &mut NodeSetup) -> std::result::Result<(), BoxError>;
}

impl<F> NodeFactory for F
where
    F: Fn(&mut NodeSetup) -> std::result::Result<(), BoxError> + Send + Sync,
{
    fn create(&self, setup: &mut NodeSetup) -> std::result::Result<(), BoxError> {
        self(setup)
    }
}

/// Nested import declared during construction, mounted after commit.
#[derive(Debug, Clone)]
pub(crate) struct PendingChild {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
}

/// Construction context for one node.
///
/// Nothing here is visible in the tree until the factory returns `Ok`.
/// Lookups see the node's own contexts first, then the mounted ancestors.
pub struct NodeSetup {
    info: MountInfo,
    module: LoadedModule,
    parent: NodeId,
    tree: SharedTree,
    bus: Arc<EventBus>,
    contexts: Vec<ContextEntry>,
    replaced: Vec<ContextEntry>,
    side_effects: Vec<Teardown>,
    children: Vec<PendingChild>,
}

impl NodeSetup {
    pub(crate) fn new(
        tree: SharedTree,
        parent: NodeId,
        name: String,
        module: LoadedModule,
        max_listeners: usize,
        forward: &[String],
    ) -> Result<Self> {
        let parent_bus = tree
            .read()
            .get(&parent)
            .map(|p| Arc::clone(&p.bus))
            .ok_or_else(|| HmrError::NodeNotFound(parent.clone()))?;

        let bus = Arc::new(EventBus::new(max_listeners));
        bus.forward_to(&parent_bus, forward)?;

        Ok(Self {
            info: MountInfo {
                id: NodeId::from_path(&module.path),
                name,
                path: Some(module.path.clone()),
            },
            module,
            parent,
            tree,
            bus,
            contexts: Vec::new(),
            replaced: Vec::new(),
            side_effects: Vec::new(),
            children: Vec::new(),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn path(&self) -> &Path {
        &self.module.path
    }

    pub fn parent(&self) -> &NodeId {
        &self.parent
    }

    pub fn version(&self) -> Version {
        self.module.version
    }

    pub fn hash(&self) -> ContentHash {
        self.module.hash
    }

    /// The evaluated module.
    pub fn artifact(&self) -> &Artifact {
        &self.module.artifact
    }

    pub fn artifact_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.module.artifact).downcast::<T>().ok()
    }

    /// Mount `context` on this node and return its value.
    ///
    /// A second registration under the same name replaces the first; the
    /// replaced value is disposed once the node is committed.
    pub fn register<T: Any + Send + Sync>(&mut self, context: Context<T>) -> Result<Arc<T>> {
        let (entry, value) = context
            .mount(&self.info)
            .map_err(|cause| HmrError::Construct {
                path: self.module.path.clone(),
                cause,
            })?;
        if let Some(old) = upsert(&mut self.contexts, entry) {
            self.replaced.push(old);
        }
        Ok(value)
    }

    /// Nearest context named `name`: this node first, then its ancestors.
    pub fn lookup<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        if let Some(entry) = self.contexts.iter().find(|c| c.name == name) {
            return downcast(Arc::clone(&entry.value), name);
        }
        match self.tree.read().lookup_as::<T>(&self.parent, name) {
            Err(HmrError::ContextNotFound { name, .. }) => Err(HmrError::ContextNotFound {
                name,
                from: self.info.id.clone(),
            }),
            other => other,
        }
    }

    /// Register cleanup to run when the node is disposed. Runs in reverse order.
    pub fn add_side_effect<F, Fut>(&mut self, teardown: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.side_effects
            .push(Box::new(move || Box::pin(teardown())));
    }

    /// Subscribe on this node's bus.
    pub fn on<F>(&self, event: &str, handler: F) -> Result<ListenerId>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.bus.on(event, Arc::new(handler))
    }

    /// Emit on this node's bus. Forwarded events reach the mounted parent.
    pub fn emit(&self, event: &str, payload: &Value) -> usize {
        self.bus.emit(event, payload)
    }

    /// Declare a child node, mounted under this one after it commits.
    ///
    /// Relative paths resolve against this file's directory.
    pub fn import(&mut self, name: impl Into<String>, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let path = if path.is_relative() {
            self.module
                .path
                .parent()
                .map_or_else(|| path.to_path_buf(), |dir| dir.join(path))
        } else {
            path.to_path_buf()
        };
        self.children.push(PendingChild {
            name: name.into(),
            path,
        });
    }

    /// Turn the setup into a node ready to attach.
    ///
    /// Also returns contexts replaced during setup (to dispose) and pending children.
    pub(crate) fn finish(self) -> (DependencyNode, Vec<ContextEntry>, Vec<PendingChild>) {
        let node = DependencyNode {
            id: self.info.id,
            name: self.info.name,
            file: Some(FileIdentity {
                path: self.module.path,
                hash: self.module.hash,
                version: self.module.version,
            }),
            artifact: Some(self.module.artifact),
            parent: None,
            children: Vec::new(),
            contexts: self.contexts,
            side_effects: self.side_effects,
            bus: self.bus,
            status: NodeStatus::Active,
            last_error: None,
        };
        (node, self.replaced, self.children)
    }

    /// Give back everything registered so far, for teardown after a failed factory.
    pub(crate) fn abandon(self) -> (NodeId, Vec<Teardown>, Vec<ContextEntry>) {
        self.bus.clear();
        let mut contexts = self.replaced;
        contexts.extend(self.contexts);
        (self.info.id, self.side_effects, contexts)
    }
}
