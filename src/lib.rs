//! hotmount - dependency lifecycle and hot reload for in-process plugin trees.
//!
//! A tree of plugin nodes is built from files by a host factory. Each node
//! owns named contexts (visible to its descendants) and teardown callbacks.
//! When a backing file changes, the node is rebuilt from the new content and
//! swapped in place; a failed edit leaves the previous version running.
//!
//! ```ignore
//! let hmr = Hmr::builder(HmrConfig::default()).start()?;
//! let auth = hmr.import("auth", "plugins/auth.mod").await?;
//! let ttl = auth.lookup::<toml::Value>("token_ttl")?;
//! hmr.dispose().await;
//! ```
//!
//! # Module Structure
//!
//! - `dependency` - Nodes, contexts, event buses and teardown
//! - `loader` - Content-hashed module versions and evaluators
//! - `watch` - Debounced file watching
//! - `reload` - Reload queue and the single tree writer
//! - `monitor` - Reload timings and memory samples
//! - `orchestrator` - The [`Hmr`] facade

#[macro_use]
pub mod logger;

pub mod config;
pub mod core;
pub mod dependency;
pub mod error;
pub mod event;
pub mod freshness;
pub mod loader;
pub mod monitor;
pub mod orchestrator;
pub mod reload;
pub mod utils;
pub mod watch;

pub use config::HmrConfig;
pub use core::HmrState;
pub use dependency::{Context, NodeFactory, NodeRef, NodeSetup};
pub use error::{BoxError, HmrError, Result};
pub use event::HmrEvent;
pub use loader::{Evaluator, FactoryRegistry};
pub use orchestrator::{Hmr, HmrBuilder, ReloadStatus};
