//! Dependency tree: hot-reloadable units, their named contexts and teardown.
//!
//! The tree is an arena (`NodeId → DependencyNode`) where each node stores
//! its parent id and an ordered list of child ids. Only the reload worker
//! mutates the structure; lookups take a short read lock.
//!
//! ```text
//! root ─┬─ plugins/a.mod ── plugins/a-child.mod
//!       └─ plugins/b.mod
//! ```
//!
//! # Module Structure
//!
//! - `bus` - Per-node publish/subscribe with explicit parent forwarding
//! - `context` - Named context registration and mounted entries
//! - `node` - The node record
//! - `tree` - Arena operations (attach, detach, lookup, traversal)
//! - `setup` - Construction context handed to the host factory
//! - `dispose` - Post-order asynchronous teardown
//! - `handle` - `NodeRef`, the host-facing handle

mod bus;
mod context;
mod dispose;
mod handle;
mod node;
mod setup;
mod tree;


use std::any::Any;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Serialize, Serializer};

use crate::error::BoxError;
use crate::freshness::ContentHash;
use crate::loader::Version;

pub use bus::{EventBus, Handler, ListenerId, Subscription};
pub use context::{Context, MountInfo};
pub use dispose::DisposeReport;
pub use handle::{NodeInfo, NodeRef};
pub use node::DependencyNode;
pub use setup::{NodeFactory, NodeSetup};
pub use tree::DependencyTree;

pub(crate) use context::ContextEntry;
pub(crate) use dispose::{DisposeCtx, dispose_subtree, run_teardown};
pub(crate) use setup::PendingChild;

/// Boxed, sendable future used for asynchronous teardown callbacks.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Value produced by a context's `mounted` factory.
pub type ContextValue = Arc<dyn Any + Send + Sync>;

/// Teardown callback registered as a side effect.
pub type Teardown = Box<dyn FnOnce() -> BoxFuture<Result<(), BoxError>> + Send + Sync>;

/// Tree shared between the worker (writer) and readers.
pub type SharedTree = Arc<RwLock<DependencyTree>>;

/// Event emitted on a node's own bus right before it is dropped.
pub const DISPOSE_EVENT: &str = "dispose";

// =============================================================================
// NodeId
// =============================================================================

/// Stable node identity, derived from the normalized file path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Arc<str>);

impl NodeId {
    const ROOT: &'static str = "<root>";

    /// Identity of the node backed by `path` (expected normalized).
    pub fn from_path(path: &Path) -> Self {
        Self(Arc::from(path.to_string_lossy().as_ref()))
    }

    /// Identity of the tree root.
    pub fn root() -> Self {
        Self(Arc::from(Self::ROOT))
    }

    pub fn is_root(&self) -> bool {
        &*self.0 == Self::ROOT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

// =============================================================================
// Status / FileIdentity
// =============================================================================

/// Lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Under construction by the host factory.
    Loading,
    Active,
    Disposing,
    Disposed,
    /// Still mounted, but its latest reload failed.
    Error,
}

impl NodeStatus {
    /// Whether the node still holds its contexts and may be disposed.
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Loading | Self::Active | Self::Error)
    }
}

/// Which file version a node was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIdentity {
    pub path: PathBuf,
    #[serde(serialize_with = "serialize_hash")]
    pub hash: ContentHash,
    pub version: Version,
}

fn serialize_hash<S: Serializer>(hash: &ContentHash, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hash.to_hex())
}
