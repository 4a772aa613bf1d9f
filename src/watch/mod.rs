//! File watcher
//!
//! Watches the configured roots and hands debounced, filtered changes to a
//! [`ChangeSink`]. Implements the "Watcher-First" pattern: the notify
//! watcher is live before [`FileWatcher::spawn`] returns, so nothing written
//! during startup is missed.
//!
//! Architecture:
//! ```text
//! notify (thread) → bridge (thread) → actor task → Debouncer → ChangeSink
//!                                          ↑
//!                                 WatchCommand (add/remove root)
//! ```

// Pure timing and deduplication.
mod debouncer;
// Initial directory scan.
mod scan;
// Shared watch types.
mod types;
// Watch root attach/re-attach lifecycle.
mod watch_roots;


use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::RecommendedWatcher;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::WatchError;
use crate::event::{EventSink, HmrEvent};
use crate::logger::Logger;

use debouncer::Debouncer;
use watch_roots::WatchRoots;

pub use scan::scan_files;
pub use types::{ChangeKind, ChangeSink, FileChange};

/// Upper bound on idle sleeps, so lost roots are noticed without events.
const MAINTAIN_INTERVAL: Duration = Duration::from_millis(1000);

/// Raw event buffer between the notify thread and the actor.
const RAW_EVENT_BUFFER: usize = 256;

/// What to watch.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub roots: Vec<PathBuf>,
    pub extensions: Vec<String>,
    pub debounce: Duration,
}

enum WatchCommand {
    Add(PathBuf, oneshot::Sender<bool>),
    Remove(PathBuf, oneshot::Sender<bool>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the running watcher task.
pub struct FileWatcher {
    ctl_tx: mpsc::Sender<WatchCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileWatcher {
    /// Start watching. Must be called inside a tokio runtime.
    ///
    /// Fails only if the platform watcher cannot be created; missing or
    /// unreadable roots are logged and retried.
    pub fn spawn(
        options: WatchOptions,
        sink: Arc<dyn ChangeSink>,
        events: EventSink,
        logger: Arc<dyn Logger>,
    ) -> Result<Self, WatchError> {
        // Create sync channel for notify (it doesn't support async)
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = notify_tx.send(res);
        })
        .map_err(|e| WatchError {
            path: options.roots.first().cloned().unwrap_or_default(),
            cause: e.to_string(),
        })?;

        let mut roots = WatchRoots::new(options.roots);
        roots.attach_existing(&mut watcher, &*logger);

        let (raw_tx, raw_rx) = mpsc::channel(RAW_EVENT_BUFFER);
        std::thread::Builder::new()
            .name("hotmount-notify".into())
            .spawn(move || {
                while let Ok(result) = notify_rx.recv() {
                    if raw_tx.blocking_send(result).is_err() {
                        break; // Actor gone
                    }
                }
            })
            .map_err(|e| WatchError {
                path: PathBuf::new(),
                cause: format!("failed to start notify bridge: {e}"),
            })?;

        let (ctl_tx, ctl_rx) = mpsc::channel(16);
        let actor = WatchActor {
            watcher,
            roots,
            debouncer: Debouncer::new(options.debounce, options.extensions, Arc::clone(&logger)),
            raw_rx,
            ctl_rx,
            sink,
            events,
            logger,
        };
        let task = tokio::spawn(actor.run());

        Ok(Self {
            ctl_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// Add a root at runtime. Returns false if it was already watched.
    pub async fn add_root(&self, path: PathBuf) -> bool {
        self.request(|reply| WatchCommand::Add(path, reply))
            .await
            .unwrap_or(false)
    }

    /// Remove a root at runtime. Returns false if it was not watched.
    pub async fn remove_root(&self, path: PathBuf) -> bool {
        self.request(|reply| WatchCommand::Remove(path, reply))
            .await
            .unwrap_or(false)
    }

    /// Stop the actor and release the platform watcher. Idempotent.
    pub async fn shutdown(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        let _ = self.request(WatchCommand::Shutdown).await;
        let _ = task.await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> WatchCommand) -> Option<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ctl_tx.send(make(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// The watcher task. Owns the platform watcher.
struct WatchActor {
    watcher: RecommendedWatcher,
    roots: WatchRoots,
    debouncer: Debouncer,
    raw_rx: mpsc::Receiver<notify::Result<notify::Event>>,
    ctl_rx: mpsc::Receiver<WatchCommand>,
    sink: Arc<dyn ChangeSink>,
    events: EventSink,
    logger: Arc<dyn Logger>,
}

impl WatchActor {
    async fn run(mut self) {
        debug!(self.logger, "watch"; "watching {} root(s)", self.roots.desired().len());

        loop {
            let sleep = self
                .debouncer
                .sleep_duration(Instant::now())
                .map_or(MAINTAIN_INTERVAL, |d| d.min(MAINTAIN_INTERVAL));

            tokio::select! {
                biased;
                cmd = self.ctl_rx.recv() => match cmd {
                    Some(WatchCommand::Add(path, reply)) => {
                        let (added, _) = self.roots.add(path, &mut self.watcher, &*self.logger);
                        let _ = reply.send(added);
                    }
                    Some(WatchCommand::Remove(path, reply)) => {
                        let _ = reply.send(self.roots.remove(&path, &mut self.watcher));
                    }
                    Some(WatchCommand::Shutdown(reply)) => {
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                raw = self.raw_rx.recv() => match raw {
                    Some(Ok(event)) => self.debouncer.add_event(&event),
                    Some(Err(e)) => warn!(self.logger, "watch"; "notify error: {}", e),
                    None => {
                        let message = "file watcher stopped delivering events".to_string();
                        error!(self.logger, "watch"; "{}", message);
                        let _ = self.events.send(HmrEvent::Fatal { message });
                        break;
                    }
                },
                _ = tokio::time::sleep(sleep) => self.flush(),
            }
        }

        debug!(self.logger, "watch"; "watcher stopped");
    }

    /// Maintain roots, then deliver every change whose window elapsed.
    fn flush(&mut self) {
        self.roots.maintain(&mut self.watcher, &*self.logger);

        for change in self.debouncer.take_ready(Instant::now()) {
            debug!(self.logger, "watch"; "{}: {}", change.kind.label(), change.path.display());
            self.sink.changed(change);
        }
    }
}
