//! Reload Manager
//!
//! One queue, one worker. The watcher (and the host, through
//! `request_reload`) enqueue paths; the [`worker`] drains them one at a
//! time and is the only writer of the dependency tree.
//!
//! ```text
//! FileWatcher ─┐                      ┌─ Command (import / remove / shutdown)
//!              ├→ ReloadManager.enqueue│
//! host ────────┘        │ notify       ▼
//!                       └──────→ ReloadWorker → tree, loader, monitor, events
//! ```
//!
//! # Module Structure
//!
//! - `queue` - Per-path coalescing FIFO with a single running slot
//! - `worker` - Task processing: dispose, reload, reconstruct, rollback

mod queue;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot, watch};

use crate::dependency::{DisposeReport, NodeId};
use crate::error::Result;
use crate::logger::Logger;
use crate::watch::{ChangeKind, ChangeSink, FileChange};

pub use queue::{Enqueued, QueueSnapshot, ReloadQueue, ReloadTask, TaskState};
pub(crate) use worker::ReloadWorker;

/// Requests from the facade that must run on the worker.
pub(crate) enum Command {
    Import {
        parent: NodeId,
        name: String,
        path: PathBuf,
        reply: oneshot::Sender<Result<NodeId>>,
    },
    Remove {
        id: NodeId,
        reply: oneshot::Sender<Result<DisposeReport>>,
    },
    Shutdown {
        reply: oneshot::Sender<DisposeReport>,
    },
}

/// Shared handle to the reload queue.
#[derive(Clone)]
pub struct ReloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<ReloadQueue>,
    wake: Notify,
    /// Queued plus running, for `wait_idle`.
    outstanding: watch::Sender<usize>,
    accepting: AtomicBool,
    logger: Arc<dyn Logger>,
}

impl ReloadManager {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(ReloadQueue::new()),
                wake: Notify::new(),
                outstanding: watch::Sender::new(0),
                accepting: AtomicBool::new(true),
                logger,
            }),
        }
    }

    /// Queue a reload of `path`. Returns `None` once the manager is closed.
    pub fn enqueue(&self, path: PathBuf, kind: ChangeKind) -> Option<Enqueued> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            debug!(self.inner.logger, "reload"; "closed, dropping {} ({})", path.display(), kind.label());
            return None;
        }
        let (result, outstanding) = {
            let mut queue = self.inner.queue.lock();
            let result = queue.push(path.clone(), kind);
            (result, queue.outstanding())
        };
        debug!(self.inner.logger, "reload"; "{} {}: {:?}", kind.label(), path.display(), result);
        self.inner.outstanding.send_replace(outstanding);
        self.inner.wake.notify_one();
        Some(result)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.queue.lock().snapshot()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting changes and cancel everything still queued.
    ///
    /// A running task is left to finish. Returns the number cancelled.
    pub fn close(&self) -> usize {
        self.inner.accepting.store(false, Ordering::Release);
        let (cancelled, outstanding) = {
            let mut queue = self.inner.queue.lock();
            (queue.cancel_all(), queue.outstanding())
        };
        self.inner.outstanding.send_replace(outstanding);
        self.inner.wake.notify_one();
        cancelled
    }

    pub(crate) fn start_next(&self) -> Option<ReloadTask> {
        self.inner.queue.lock().start_next()
    }

    pub(crate) fn finish(&self, state: TaskState, affected: Vec<NodeId>) -> Option<ReloadTask> {
        let (task, outstanding) = {
            let mut queue = self.inner.queue.lock();
            let task = queue.finish(state, affected);
            (task, queue.outstanding())
        };
        self.inner.outstanding.send_replace(outstanding);
        task
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.inner.queue.lock().has_pending()
    }

    pub(crate) async fn notified(&self) {
        self.inner.wake.notified().await;
    }

    pub(crate) fn wake(&self) {
        self.inner.wake.notify_one();
    }
}

impl ChangeSink for ReloadManager {
    fn changed(&self, change: FileChange) {
        self.enqueue(change.path, change.kind);
    }
}
