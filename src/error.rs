//! Error taxonomy for the orchestrator.
//!
//! Recoverable failures (a single load, a single watch root, a single
//! teardown callback) carry the file path and the underlying cause so that
//! they can be reported as one log line and one `error` event.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::dependency::NodeId;

/// Error type returned by host-supplied callbacks.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Code at `path` failed to read or evaluate. The previous artifact stays active.
#[derive(Debug, Error)]
#[error("failed to load `{}`: {cause}", path.display())]
pub struct LoadError {
    pub path: PathBuf,
    #[source]
    pub cause: BoxError,
}

impl LoadError {
    pub fn new(path: impl Into<PathBuf>, cause: impl Into<BoxError>) -> Self {
        Self {
            path: path.into(),
            cause: cause.into(),
        }
    }
}

/// A watched directory became inaccessible or could not be attached.
#[derive(Debug, Error)]
#[error("watch root `{}` unavailable: {cause}", path.display())]
pub struct WatchError {
    pub path: PathBuf,
    pub cause: String,
}

/// Which teardown step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownStep {
    SideEffect(usize),
    Context(String),
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SideEffect(i) => write!(f, "side effect #{i}"),
            Self::Context(name) => write!(f, "context `{name}`"),
        }
    }
}

/// A context or side-effect teardown callback failed.
///
/// Never aborts the remaining teardown.
#[derive(Debug, Error)]
#[error("dispose of {node} failed at {step}: {cause}")]
pub struct DisposeError {
    pub node: NodeId,
    pub step: TeardownStep,
    #[source]
    pub cause: BoxError,
}

/// Public error type of the orchestrator API.
#[derive(Debug, Error)]
pub enum HmrError {
    #[error("context `{name}` not found from {from}")]
    ContextNotFound { name: String, from: NodeId },

    #[error("context `{name}` has a different type")]
    ContextType { name: String },

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("listener limit reached for `{event}` (max {max})")]
    ListenerLimit { event: String, max: usize },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("failed to construct `{}`: {cause}", path.display())]
    Construct {
        path: PathBuf,
        #[source]
        cause: BoxError,
    },

    #[error(transparent)]
    Dispose(#[from] DisposeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("orchestrator is disposed")]
    Disposed,
}

pub type Result<T, E = HmrError> = std::result::Result<T, E>;
