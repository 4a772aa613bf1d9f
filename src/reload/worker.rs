//! The reload worker.
//!
//! Owns every tree mutation. Host commands and queued reload tasks are
//! interleaved one at a time; a task is never interrupted, so disposing
//! the orchestrator waits for the current one to reach its end.
//!
//! Replacing a node is make-before-break: the new version is constructed
//! next to the mounted one and the old subtree is only disposed once the
//! factory succeeded. A failed edit leaves the old node serving lookups.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;

use super::{Command, ReloadManager, ReloadTask, TaskState};
use crate::config::HmrConfig;
use crate::core::StateCell;
use crate::dependency::{
    ContextEntry, DependencyNode, DisposeCtx, DisposeReport, NodeFactory, NodeId, NodeSetup,
    NodeStatus, PendingChild, SharedTree, dispose_subtree, run_teardown,
};
use crate::error::{HmrError, Result};
use crate::event::{EventSink, HmrEvent};
use crate::loader::{LoadedModule, ModuleLoader, ReloadOutcome};
use crate::logger::Logger;
use crate::monitor::PerformanceMonitor;
use crate::utils::path::normalize_path;
use crate::watch::ChangeKind;

type ImportFuture<'a> = Pin<Box<dyn Future<Output = Result<NodeId>> + Send + 'a>>;

/// A constructed node that is not in the tree yet.
struct Built {
    node: DependencyNode,
    replaced: Vec<ContextEntry>,
    children: Vec<PendingChild>,
}

pub(crate) struct ReloadWorker {
    pub(crate) commands: mpsc::Receiver<Command>,
    pub(crate) manager: ReloadManager,
    pub(crate) tree: SharedTree,
    pub(crate) loader: Arc<ModuleLoader>,
    pub(crate) factory: Arc<dyn NodeFactory>,
    pub(crate) monitor: Arc<PerformanceMonitor>,
    pub(crate) events: EventSink,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) config: Arc<ArcSwap<HmrConfig>>,
    /// Paths whose import failed or whose file was deleted, with the parent
    /// and name to import them under when they change again.
    pub(crate) retry: FxHashMap<PathBuf, (NodeId, String)>,
    /// Paths the host removed explicitly. Changes to them are ignored.
    pub(crate) removed: FxHashSet<PathBuf>,
}

impl ReloadWorker {
    pub(crate) async fn run(mut self) {
        let manager = self.manager.clone();
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        // Facade dropped without dispose
                        self.shutdown().await;
                        break;
                    }
                },
                () = manager.notified() => {}
            }

            if let Some(task) = manager.start_next() {
                self.process(task).await;
            }
            if manager.has_pending() {
                manager.wake();
            }
        }
        debug!(self.logger, "reload"; "worker stopped");
    }

    /// Returns false once the worker should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Import {
                parent,
                name,
                path,
                reply,
            } => {
                self.removed.remove(&normalize_path(&path));
                let result = self.import(parent, name, path).await;
                let _ = reply.send(result);
                true
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.remove(id).await);
                true
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(self.shutdown().await);
                false
            }
        }
    }

    async fn process(&mut self, task: ReloadTask) {
        let began = self.state.begin_reload();
        let path = normalize_path(&task.path);
        let (state, affected) = match task.kind {
            ChangeKind::Removed => self.handle_removed(&path).await,
            ChangeKind::Created | ChangeKind::Modified => self.handle_changed(&path).await,
        };
        if began {
            self.state.end_reload();
        }
        self.manager.finish(state, affected);
    }

    // =========================================================================
    // Change handling
    // =========================================================================

    async fn handle_changed(&mut self, path: &Path) -> (TaskState, Vec<NodeId>) {
        if self.config.load().is_protected(path) {
            self.restart_required(path);
            return (TaskState::Done, Vec::new());
        }

        let tracked = self.tree.read().find_by_path(path);
        if let Some(id) = tracked {
            return self.replace(id, path).await;
        }

        if let Some((parent, name)) = self.retry.get(path).cloned() {
            debug!(self.logger, "reload"; "{} is not mounted, importing as `{}`", path.display(), name);
            return match self.import(parent, name, path.to_path_buf()).await {
                Ok(id) => (TaskState::Done, vec![id]),
                Err(_) => (TaskState::Failed, Vec::new()),
            };
        }

        if self.removed.contains(path) {
            debug!(self.logger, "reload"; "ignoring removed {}", path.display());
            return (TaskState::Done, Vec::new());
        }

        self.restart_required(path);
        (TaskState::Done, Vec::new())
    }

    /// Swap node `id` for a freshly loaded version of `path`.
    async fn replace(&mut self, id: NodeId, path: &Path) -> (TaskState, Vec<NodeId>) {
        let timer = self.monitor.create_timer();

        let (previous, current) = match self.loader.reload(path) {
            Ok(ReloadOutcome::Unchanged(module)) => {
                debug!(self.logger, "reload"; "{} unchanged at {}", path.display(), module.version);
                return (TaskState::Done, Vec::new());
            }
            Ok(ReloadOutcome::Reloaded { previous, current }) => (previous, current),
            Err(err) => {
                self.mark_error(&id, &err.to_string());
                self.report_failure(path, &err);
                return (TaskState::Failed, vec![id]);
            }
        };

        let Some((parent, name, from)) = ({
            let tree = self.tree.read();
            tree.get(&id).and_then(|node| {
                let parent = node.parent()?.clone();
                let from = node.file()?.version;
                Some((parent, node.name().to_string(), from))
            })
        }) else {
            return (TaskState::Cancelled, Vec::new());
        };

        let built = match self.construct(parent, name.clone(), current.clone()).await {
            Ok(built) => built,
            Err(err) => {
                self.loader.restore(previous, &current);
                self.mark_error(&id, &err.to_string());
                self.report_failure(path, &err);
                return (TaskState::Failed, vec![id]);
            }
        };

        let Some((parent, slot)) = self.tree.read().position(&id) else {
            return (TaskState::Cancelled, Vec::new());
        };
        let report = dispose_subtree(self.dispose_ctx(), id.clone()).await;

        let mut affected = report.disposed;
        for descendant in affected.iter().filter(|d| **d != id) {
            self.loader.forget(Path::new(descendant.as_str()));
        }
        let to = current.version;
        let children = match self.commit(&parent, Some(slot), built).await {
            Ok(children) => children,
            Err(err) => {
                self.report_failure(path, &err);
                return (TaskState::Failed, affected);
            }
        };

        let elapsed = timer.stop();
        self.monitor.record_reload_time(elapsed);
        let _ = self.events.send(HmrEvent::Change {
            id: id.clone(),
            name: name.clone(),
            path: path.to_path_buf(),
            from,
            to,
        });
        debug!(self.logger, "reload"; "{} {} → {} in {:.1}ms", name, from, to, elapsed.as_secs_f64() * 1000.0);

        for child in children {
            // Failures are reported by the nested import
            let _ = self.import(id.clone(), child.name, child.path).await;
        }
        // Descendants the new version no longer imports behave like host removals
        for descendant in affected.iter().filter(|d| **d != id) {
            let still_mounted = self.tree.read().contains(descendant);
            let path = PathBuf::from(descendant.as_str());
            if !still_mounted && !self.retry.contains_key(&path) {
                self.removed.insert(path);
            }
        }

        if !affected.contains(&id) {
            affected.push(id);
        }
        let state = if report.errors.is_empty() {
            TaskState::Done
        } else {
            TaskState::Failed
        };
        (state, affected)
    }

    async fn handle_removed(&mut self, path: &Path) -> (TaskState, Vec<NodeId>) {
        let tracked = self.tree.read().find_by_path(path);
        let Some(id) = tracked else {
            debug!(self.logger, "reload"; "untracked {} removed", path.display());
            return (TaskState::Done, Vec::new());
        };

        let (parent, name) = {
            let tree = self.tree.read();
            let Some(node) = tree.get(&id) else {
                return (TaskState::Done, Vec::new());
            };
            (node.parent().cloned(), node.name().to_string())
        };

        let report = self.unmount(&id, path, &name).await;
        if let Some(parent) = parent {
            // Re-created later: import again under the same parent
            self.retry.insert(path.to_path_buf(), (parent, name));
        }

        let state = if report.is_clean() {
            TaskState::Done
        } else {
            TaskState::Failed
        };
        (state, report.disposed)
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Load `path`, construct it under `parent`, then mount its declared children.
    ///
    /// Importing a path that is already mounted returns the existing node.
    fn import(&mut self, parent: NodeId, name: String, path: PathBuf) -> ImportFuture<'_> {
        Box::pin(async move {
            let path = normalize_path(&path);
            let existing = self.tree.read().find_by_path(&path);
            if let Some(id) = existing {
                return Ok(id);
            }
            if !self.tree.read().contains(&parent) {
                return Err(HmrError::NodeNotFound(parent));
            }

            let module = match self.loader.load(&name, &path) {
                Ok(module) => module,
                Err(err) => {
                    self.report_failure(&path, &err);
                    self.retry.insert(path, (parent, name));
                    return Err(err.into());
                }
            };

            let built = match self.construct(parent.clone(), name.clone(), module.clone()).await {
                Ok(built) => built,
                Err(err) => {
                    self.loader.restore(None, &module);
                    self.report_failure(&path, &err);
                    self.retry.insert(path, (parent, name));
                    return Err(err);
                }
            };

            let id = built.node.id().clone();
            let children = self.commit(&parent, None, built).await?;
            self.retry.remove(&path);
            self.removed.remove(&path);

            debug!(self.logger, "reload"; "mounted `{}` {} under {}", name, module.version, parent);
            let _ = self.events.send(HmrEvent::Add {
                id: id.clone(),
                name,
                path,
                version: module.version,
            });

            for child in children {
                // Failures are reported by the nested import
                let _ = self.import(id.clone(), child.name, child.path).await;
            }
            Ok(id)
        })
    }

    async fn remove(&mut self, id: NodeId) -> Result<DisposeReport> {
        if id.is_root() {
            return Err(HmrError::NodeNotFound(id));
        }
        let (path, name) = {
            let tree = self.tree.read();
            let node = tree
                .get(&id)
                .ok_or_else(|| HmrError::NodeNotFound(id.clone()))?;
            (
                node.path().map(Path::to_path_buf).unwrap_or_default(),
                node.name().to_string(),
            )
        };

        let report = self.unmount(&id, &path, &name).await;
        self.retry.remove(&path);
        self.removed.insert(path);
        Ok(report)
    }

    async fn shutdown(&mut self) -> DisposeReport {
        let cancelled = self.manager.close();
        if cancelled > 0 {
            debug!(self.logger, "reload"; "cancelled {} queued reload(s)", cancelled);
        }
        let root = self.tree.read().root_id().clone();
        let report = dispose_subtree(self.dispose_ctx(), root).await;
        self.loader.clear();
        report
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Run the host factory for `module`. Nothing touches the tree.
    ///
    /// On failure everything the factory registered is torn down again.
    async fn construct(&self, parent: NodeId, name: String, module: LoadedModule) -> Result<Built> {
        let (max_listeners, forward) = {
            let config = self.config.load();
            (config.max_listeners, config.forward_events.clone())
        };
        let path = module.path.clone();
        let mut setup = NodeSetup::new(
            Arc::clone(&self.tree),
            parent,
            name,
            module,
            max_listeners,
            &forward,
        )?;

        match self.factory.create(&mut setup) {
            Ok(()) => {
                let (node, replaced, children) = setup.finish();
                Ok(Built {
                    node,
                    replaced,
                    children,
                })
            }
            Err(cause) => {
                let (id, side_effects, contexts) = setup.abandon();
                run_teardown(&id, side_effects, contexts, &*self.logger).await;
                Err(HmrError::Construct { path, cause })
            }
        }
    }

    /// Attach a constructed node and dispose the contexts it replaced during setup.
    ///
    /// A node that cannot be attached is torn down before returning the error.
    async fn commit(
        &self,
        parent: &NodeId,
        slot: Option<usize>,
        built: Built,
    ) -> Result<Vec<PendingChild>> {
        let Built {
            node,
            replaced,
            children,
        } = built;
        let id = node.id().clone();

        let rejected = {
            let mut tree = self.tree.write();
            if !tree.contains(parent) {
                Some((node, HmrError::NodeNotFound(parent.clone())))
            } else if tree.contains(&id) {
                let err = HmrError::Construct {
                    path: node.path().map(Path::to_path_buf).unwrap_or_default(),
                    cause: format!("node {id} is already mounted").into(),
                };
                Some((node, err))
            } else {
                tree.attach(parent, node, slot)?;
                None
            }
        };

        if let Some((node, err)) = rejected {
            node.bus.clear();
            let mut contexts = replaced;
            contexts.extend(node.contexts);
            run_teardown(&id, node.side_effects, contexts, &*self.logger).await;
            return Err(err);
        }

        run_teardown(&id, Vec::new(), replaced, &*self.logger).await;
        Ok(children)
    }

    /// Dispose the subtree at `id`, drop its modules and emit `remove`.
    async fn unmount(&mut self, id: &NodeId, path: &Path, name: &str) -> DisposeReport {
        let report = dispose_subtree(self.dispose_ctx(), id.clone()).await;
        for disposed in &report.disposed {
            self.loader.forget(Path::new(disposed.as_str()));
        }
        debug!(self.logger, "reload"; "removed `{}` ({} node(s))", name, report.disposed.len());
        let _ = self.events.send(HmrEvent::Remove {
            id: id.clone(),
            name: name.to_string(),
            path: path.to_path_buf(),
        });
        report
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// One log line, one counter tick and one `error` event per failure.
    fn report_failure(&self, path: &Path, err: &dyn std::error::Error) {
        self.monitor.record_error();
        error!(self.logger, "reload"; "{}", err);
        let _ = self.events.send(HmrEvent::Error {
            path: path.to_path_buf(),
            message: err.to_string(),
        });
    }

    fn mark_error(&self, id: &NodeId, message: &str) {
        let mut tree = self.tree.write();
        if let Some(node) = tree.get_mut(id)
            && node.status.is_live()
        {
            node.status = NodeStatus::Error;
            node.last_error = Some(message.to_string());
        }
    }

    fn restart_required(&self, path: &Path) {
        warn!(self.logger, "reload"; "{} changed, restart required", path.display());
        let _ = self.events.send(HmrEvent::RestartRequired {
            path: path.to_path_buf(),
        });
    }

    fn dispose_ctx(&self) -> DisposeCtx {
        DisposeCtx {
            tree: Arc::clone(&self.tree),
            policy: self.config.load().dispose_policy,
            logger: Arc::clone(&self.logger),
            events: self.events.clone(),
        }
    }
}
