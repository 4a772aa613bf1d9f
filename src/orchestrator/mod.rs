//! The orchestrator facade.
//!
//! [`HmrBuilder::start`] wires the pieces together and returns an [`Hmr`]:
//!
//! ```text
//! FileWatcher ──→ ReloadManager ──→ ReloadWorker ──→ DependencyTree
//!                      ↑                 │  ├──→ ModuleLoader
//!                 request_reload         │  └──→ PerformanceMonitor
//!                                        └──→ HmrEvent broadcast → host
//! ```
//!
//! Every tree mutation runs on the worker. Calls on [`Hmr`] that mutate
//! (`import`, `remove`, `dispose`) are sent to it as commands; reads go
//! straight to the tree under a short read lock.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{CONFIG_CHANGED, HmrConfig};
use crate::core::{HmrState, StateCell};
use crate::dependency::{DependencyTree, DisposeReport, NodeFactory, NodeRef, SharedTree};
use crate::error::{HmrError, Result};
use crate::event::{self, EventSink, HmrEvent};
use crate::loader::{Evaluator, ManifestEvaluator, ManifestFactory, ModuleLoader};
use crate::logger::{ConsoleLogger, Logger};
use crate::monitor::{PerformanceMonitor, PerformanceStats};
use crate::reload::{Command, Enqueued, QueueSnapshot, ReloadManager, ReloadWorker};
use crate::utils::path::normalize_path;
use crate::watch::{ChangeKind, FileWatcher, WatchOptions, scan_files};

const COMMAND_BUFFER: usize = 32;

/// Snapshot returned by [`Hmr::reload_status`].
#[derive(Debug, Clone, Serialize)]
pub struct ReloadStatus {
    pub state: HmrState,
    pub queue: QueueSnapshot,
    /// Mounted nodes, not counting the root.
    pub nodes: usize,
    /// Entries in the module version table.
    pub modules: usize,
    pub watch_dirs: Vec<PathBuf>,
}

// =============================================================================
// Builder
// =============================================================================

/// Configures and starts an [`Hmr`].
pub struct HmrBuilder {
    config: HmrConfig,
    logger: Option<Arc<dyn Logger>>,
    evaluator: Option<Arc<dyn Evaluator>>,
    factory: Option<Arc<dyn NodeFactory>>,
}

impl HmrBuilder {
    pub fn new(config: HmrConfig) -> Self {
        Self {
            config,
            logger: None,
            evaluator: None,
            factory: None,
        }
    }

    /// Log through `logger` instead of the console.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Evaluate module sources with `evaluator` instead of [`ManifestEvaluator`].
    pub fn with_evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    /// Build nodes with `factory` instead of [`ManifestFactory`].
    pub fn with_factory(mut self, factory: impl NodeFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Start watching. Must be called inside a tokio runtime.
    ///
    /// Relative directories are resolved against the current directory.
    pub fn start(self) -> Result<Hmr> {
        let Self {
            mut config,
            logger,
            evaluator,
            factory,
        } = self;

        if let Ok(cwd) = std::env::current_dir() {
            config.finalize(&cwd);
        }
        config.validate()?;

        let logger = logger.unwrap_or_else(|| Arc::new(ConsoleLogger::new(config.debug)));
        let evaluator = evaluator.unwrap_or_else(|| Arc::new(ManifestEvaluator));
        let factory = factory.unwrap_or_else(|| Arc::new(ManifestFactory));

        let state = Arc::new(StateCell::new());
        let events = event::channel();
        let tree: SharedTree = Arc::new(RwLock::new(DependencyTree::new(config.max_listeners)));
        let loader = Arc::new(ModuleLoader::new(
            evaluator,
            config.algorithm,
            Arc::clone(&logger),
        ));
        let manager = ReloadManager::new(Arc::clone(&logger));

        let monitor = Arc::new(PerformanceMonitor::new());
        if let Some(ms) = config.memory_sample_interval {
            monitor.start_sampler(Duration::from_millis(ms));
        }

        // Forwarded `config-changed` events surface to the host
        let root_bus = {
            let tree = tree.read();
            let root = tree.root_id().clone();
            tree.get(&root)
                .map(|n| Arc::clone(n.bus()))
                .ok_or(HmrError::NodeNotFound(root))?
        };
        let sink = events.clone();
        root_bus.on(
            CONFIG_CHANGED,
            Arc::new(move |payload: &Value| {
                let _ = sink.send(HmrEvent::ConfigChanged {
                    payload: payload.clone(),
                });
            }),
        )?;

        let watcher = FileWatcher::spawn(
            WatchOptions {
                roots: config.dirs.clone(),
                extensions: config.extensions.clone(),
                debounce: config.debounce_window(),
            },
            Arc::new(manager.clone()),
            events.clone(),
            Arc::clone(&logger),
        )?;

        let dirs = config.dirs.len();
        let config = Arc::new(ArcSwap::from_pointee(config));
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let worker = ReloadWorker {
            commands: command_rx,
            manager: manager.clone(),
            tree: Arc::clone(&tree),
            loader: Arc::clone(&loader),
            factory,
            monitor: Arc::clone(&monitor),
            events: events.clone(),
            logger: Arc::clone(&logger),
            state: Arc::clone(&state),
            config: Arc::clone(&config),
            retry: FxHashMap::default(),
            removed: FxHashSet::default(),
        };
        let worker = tokio::spawn(worker.run());

        state.transition(HmrState::Initializing, HmrState::Watching);
        debug!(logger, "hmr"; "watching {} dir(s)", dirs);

        Ok(Hmr {
            config,
            tree,
            loader,
            manager,
            monitor,
            events,
            state,
            logger,
            watcher,
            commands,
            worker: Mutex::new(Some(worker)),
        })
    }
}

// =============================================================================
// Hmr
// =============================================================================

/// A running hot-reload orchestrator.
pub struct Hmr {
    config: Arc<ArcSwap<HmrConfig>>,
    tree: SharedTree,
    loader: Arc<ModuleLoader>,
    manager: ReloadManager,
    monitor: Arc<PerformanceMonitor>,
    events: EventSink,
    state: Arc<StateCell>,
    logger: Arc<dyn Logger>,
    watcher: FileWatcher,
    commands: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Hmr {
    /// Start with `config` and the default logger, evaluator and factory.
    pub fn start(config: HmrConfig) -> Result<Self> {
        HmrBuilder::new(config).start()
    }

    pub fn builder(config: HmrConfig) -> HmrBuilder {
        HmrBuilder::new(config)
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Load `path` and mount it under the root as `name`.
    ///
    /// The file's directory is added to the watch roots unless already covered.
    /// Importing an already mounted path returns the existing node.
    pub async fn import(&self, name: &str, path: impl AsRef<Path>) -> Result<NodeRef> {
        let root = self.root();
        self.import_into(&root, name, path).await
    }

    /// Like [`import`](Self::import), under `parent` instead of the root.
    pub async fn import_into(
        &self,
        parent: &NodeRef,
        name: &str,
        path: impl AsRef<Path>,
    ) -> Result<NodeRef> {
        self.ensure_live()?;
        let path = normalize_path(path.as_ref());
        self.ensure_watched(&path).await?;

        let id = self
            .request(|reply| Command::Import {
                parent: parent.id().clone(),
                name: name.to_string(),
                path,
                reply,
            })
            .await??;
        Ok(NodeRef::new(Arc::clone(&self.tree), id))
    }

    /// Dispose the first node named `name` and its subtree.
    ///
    /// Returns `None` if no node has that name. Later changes to its file are ignored.
    pub async fn remove(&self, name: &str) -> Result<Option<DisposeReport>> {
        self.ensure_live()?;
        let Some(node) = self.find_plugin_by_name(name) else {
            return Ok(None);
        };
        let report = self
            .request(|reply| Command::Remove {
                id: node.id().clone(),
                reply,
            })
            .await??;
        Ok(Some(report))
    }

    /// First node named `name`, depth-first from the root.
    pub fn find_plugin_by_name(&self, name: &str) -> Option<NodeRef> {
        let id = self.tree.read().find_by_name(name)?;
        Some(NodeRef::new(Arc::clone(&self.tree), id))
    }

    pub fn root(&self) -> NodeRef {
        let id = self.tree.read().root_id().clone();
        NodeRef::new(Arc::clone(&self.tree), id)
    }

    // =========================================================================
    // Watch roots
    // =========================================================================

    /// Watch `dir`. Returns false if it was already watched.
    pub async fn add_watch_dir(&self, dir: impl AsRef<Path>) -> Result<bool> {
        self.ensure_live()?;
        let dir = normalize_path(dir.as_ref());
        let previous = self.config.rcu(|current| {
            let mut next = HmrConfig::clone(current);
            if !next.dirs.contains(&dir) {
                next.dirs.push(dir.clone());
            }
            next
        });
        if previous.dirs.contains(&dir) {
            return Ok(false);
        }
        self.watcher.add_root(dir.clone()).await;
        debug!(self.logger, "hmr"; "watching {}", dir.display());
        Ok(true)
    }

    /// Stop watching `dir`. Returns false if it was not watched.
    pub async fn remove_watch_dir(&self, dir: impl AsRef<Path>) -> Result<bool> {
        self.ensure_live()?;
        let dir = normalize_path(dir.as_ref());
        let previous = self.config.rcu(|current| {
            let mut next = HmrConfig::clone(current);
            next.dirs.retain(|d| d != &dir);
            next
        });
        if !previous.dirs.contains(&dir) {
            return Ok(false);
        }
        self.watcher.remove_root(dir.clone()).await;
        debug!(self.logger, "hmr"; "stopped watching {}", dir.display());
        Ok(true)
    }

    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        self.config.load().dirs.clone()
    }

    /// Existing files under the watch roots with a watched extension.
    pub fn scan_plugins(&self) -> Vec<PathBuf> {
        let config = self.config.load();
        scan_files(&config.dirs, &config.extensions)
    }

    // =========================================================================
    // Reloads
    // =========================================================================

    /// Queue `path` as if the watcher had reported it.
    pub fn request_reload(&self, path: impl AsRef<Path>) -> Result<Enqueued> {
        self.ensure_live()?;
        let path = normalize_path(path.as_ref());
        let kind = if path.exists() {
            ChangeKind::Modified
        } else {
            ChangeKind::Removed
        };
        self.manager.enqueue(path, kind).ok_or(HmrError::Disposed)
    }

    /// Resolve once no reload is queued or running.
    pub async fn wait_idle(&self) {
        self.manager.wait_idle().await;
    }

    pub fn reload_status(&self) -> ReloadStatus {
        ReloadStatus {
            state: self.state.get(),
            queue: self.manager.snapshot(),
            nodes: self.tree.read().len().saturating_sub(1),
            modules: self.loader.len(),
            watch_dirs: self.watch_dirs(),
        }
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<HmrEvent> {
        self.events.subscribe()
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.monitor.stats()
    }

    pub fn performance_report(&self) -> String {
        self.monitor.report()
    }

    pub fn state(&self) -> HmrState {
        self.state.get()
    }

    pub fn config(&self) -> Arc<HmrConfig> {
        self.config.load_full()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop watching, cancel queued reloads and dispose the whole tree.
    ///
    /// A reload already running finishes first. Calling it again is a no-op.
    pub async fn dispose(&self) -> DisposeReport {
        if self.state.dispose() == HmrState::Disposed {
            return DisposeReport::default();
        }

        let cancelled = self.manager.close();
        self.watcher.shutdown().await;
        self.monitor.stop_sampler();

        let report = self
            .request(|reply| Command::Shutdown { reply })
            .await
            .unwrap_or_default();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        info!(self.logger, "hmr"; "disposed {} node(s), cancelled {} reload(s)", report.disposed.len(), cancelled);
        report
    }

    async fn ensure_watched(&self, path: &Path) -> Result<()> {
        let covered = self
            .config
            .load()
            .dirs
            .iter()
            .any(|dir| path.starts_with(dir));
        if !covered && let Some(dir) = path.parent() {
            self.add_watch_dir(dir).await?;
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state.is_disposed() {
            Err(HmrError::Disposed)
        } else {
            Ok(())
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| HmrError::Disposed)?;
        reply_rx.await.map_err(|_| HmrError::Disposed)
    }
}

impl Drop for Hmr {
    fn drop(&mut self) {
        // The worker disposes the tree itself once the command channel closes.
        self.state.dispose();
        self.manager.close();
        self.monitor.stop_sampler();
    }
}

impl std::fmt::Debug for Hmr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hmr")
            .field("state", &self.state.get())
            .field("nodes", &self.tree.read().len())
            .field("watch_dirs", &self.config.load().dirs)
            .finish_non_exhaustive()
    }
}

