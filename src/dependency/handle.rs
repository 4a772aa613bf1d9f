use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::context::upsert;
use super::{
    Context, ContextValue, FileIdentity, MountInfo, NodeId, NodeStatus, SharedTree, Subscription,
};
use crate::error::{BoxError, DisposeError, HmrError, Result, TeardownStep};
use crate::loader::Version;

/// Snapshot of a node for display and serialization.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub file: Option<FileIdentity>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub contexts: Vec<String>,
    pub status: NodeStatus,
    pub last_error: Option<String>,
}

/// Host handle to a node.
///
/// Holds the id, not the node: after a reload the same handle sees the
/// replacement, and after removal every accessor reports the node gone.
#[derive(Clone)]
pub struct NodeRef {
    tree: SharedTree,
    id: NodeId,
}

impl NodeRef {
    pub(crate) fn new(tree: SharedTree, id: NodeId) -> Self {
        Self { tree, id }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn info(&self) -> Option<NodeInfo> {
        let tree = self.tree.read();
        let node = tree.get(&self.id)?;
        Some(NodeInfo {
            id: node.id.clone(),
            name: node.name.clone(),
            file: node.file.clone(),
            parent: node.parent.clone(),
            children: node.children.clone(),
            contexts: node.context_names().map(str::to_string).collect(),
            status: node.status,
            last_error: node.last_error.clone(),
        })
    }

    /// `Disposed` once the node has left the tree.
    pub fn status(&self) -> NodeStatus {
        self.tree
            .read()
            .get(&self.id)
            .map_or(NodeStatus::Disposed, |n| n.status)
    }

    pub fn is_mounted(&self) -> bool {
        self.tree.read().contains(&self.id)
    }

    pub fn name(&self) -> Option<String> {
        self.tree.read().get(&self.id).map(|n| n.name.clone())
    }

    pub fn version(&self) -> Option<Version> {
        self.tree
            .read()
            .get(&self.id)
            .and_then(|n| n.file.as_ref().map(|f| f.version))
    }

    /// Nearest context named `name`, from this node up to the root.
    pub fn lookup<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        self.tree.read().lookup_as(&self.id, name)
    }

    pub fn lookup_value(&self, name: &str) -> Result<ContextValue> {
        self.tree.read().lookup(&self.id, name)
    }

    /// The evaluated module this node was built from.
    pub fn artifact<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let artifact = self.tree.read().get(&self.id)?.artifact.clone()?;
        artifact.downcast::<T>().ok()
    }

    pub fn parent(&self) -> Option<NodeRef> {
        let parent = self.tree.read().get(&self.id)?.parent.clone()?;
        Some(Self::new(Arc::clone(&self.tree), parent))
    }

    pub fn children(&self) -> Vec<NodeRef> {
        let tree = self.tree.read();
        tree.get(&self.id)
            .map(|n| {
                n.children
                    .iter()
                    .map(|c| Self::new(Arc::clone(&self.tree), c.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn on<F>(&self, event: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let bus = self.bus()?;
        bus.subscribe(event, Arc::new(handler))
    }

    pub fn emit(&self, event: &str, payload: &Value) -> Result<usize> {
        let bus = self.bus()?;
        Ok(bus.emit(event, payload))
    }

    /// Mount a context on an already running node.
    ///
    /// A context of the same name is replaced and its disposer awaited.
    pub async fn register<T: Any + Send + Sync>(&self, context: Context<T>) -> Result<Arc<T>> {
        let info = {
            let tree = self.tree.read();
            let node = self.live(&tree)?;
            MountInfo {
                id: node.id.clone(),
                name: node.name.clone(),
                path: node.path().map(|p| p.to_path_buf()),
            }
        };
        let name = context.name().to_string();
        let (entry, value) = context.mount(&info).map_err(|cause| HmrError::Construct {
            path: info.path.clone().unwrap_or_default(),
            cause,
        })?;

        let replaced = {
            let mut tree = self.tree.write();
            match tree.get_mut(&self.id) {
                Some(node) if node.status.is_live() => Ok(upsert(&mut node.contexts, entry)),
                _ => Err(entry),
            }
        };
        match replaced {
            Ok(None) => Ok(value),
            Ok(Some(old)) => old.dispose().await.map(|()| value).map_err(|cause| {
                DisposeError {
                    node: self.id.clone(),
                    step: TeardownStep::Context(name),
                    cause,
                }
                .into()
            }),
            Err(orphan) => {
                // Node went away while mounting: nobody else will dispose this.
                let _ = orphan.dispose().await;
                Err(HmrError::NodeNotFound(self.id.clone()))
            }
        }
    }

    pub fn add_side_effect<F, Fut>(&self, teardown: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let mut tree = self.tree.write();
        match tree.get_mut(&self.id) {
            Some(node) if node.status.is_live() => {
                node.side_effects
                    .push(Box::new(move || Box::pin(teardown())));
                Ok(())
            }
            _ => Err(HmrError::NodeNotFound(self.id.clone())),
        }
    }

    fn bus(&self) -> Result<Arc<super::EventBus>> {
        self.tree
            .read()
            .get(&self.id)
            .map(|n| Arc::clone(&n.bus))
            .ok_or_else(|| HmrError::NodeNotFound(self.id.clone()))
    }

    fn live<'t>(&self, tree: &'t super::DependencyTree) -> Result<&'t super::DependencyNode> {
        tree.get(&self.id)
            .filter(|n| n.status.is_live())
            .ok_or_else(|| HmrError::NodeNotFound(self.id.clone()))
    }
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NodeRef").field(&self.id).finish()
    }
}
