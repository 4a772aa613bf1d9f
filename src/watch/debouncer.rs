use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::types::{ChangeKind, FileChange};
use crate::logger::Logger;
use crate::utils::path::{has_extension, normalize_path};

struct Pending {
    kind: ChangeKind,
    last_event: Instant,
}

/// Per-path debouncer: timing, deduplication and extension filtering.
///
/// Each path has its own quiet window. A new raw event for a path restarts
/// only that path's window, so a busy file never holds back a quiet one.
pub(super) struct Debouncer {
    window: Duration,
    extensions: Vec<String>,
    pending: FxHashMap<PathBuf, Pending>,
    logger: Arc<dyn Logger>,
}

impl Debouncer {
    pub(super) fn new(window: Duration, extensions: Vec<String>, logger: Arc<dyn Logger>) -> Self {
        Self {
            window,
            extensions,
            pending: FxHashMap::default(),
            logger,
        }
    }

    /// Add a notify event, applying dedup rules:
    /// - Remove + Create/Modify → Create/Modify (file was restored)
    /// - Modify + Remove → Remove (file was deleted)
    /// - Create + Remove → nothing (appeared then vanished)
    /// - otherwise: first kind wins
    pub(super) fn add_event(&mut self, event: &notify::Event) {
        use notify::EventKind;

        let kind = match event.kind {
            EventKind::Create(_) => ChangeKind::Created,
            EventKind::Remove(_) => ChangeKind::Removed,
            EventKind::Modify(modify) => {
                // Metadata-only changes (mtime/chmod) never change content
                if matches!(modify, notify::event::ModifyKind::Metadata(_)) {
                    return;
                }
                ChangeKind::Modified
            }
            _ => return,
        };

        debug!(self.logger, "watch"; "raw notify: {:?} {:?}", event.kind, event.paths);

        let now = Instant::now();
        for path in &event.paths {
            if is_temp_file(path) || !has_extension(path, &self.extensions) {
                continue;
            }
            self.record(normalize_path(path), kind, now);
        }
    }

    /// Record one change of an already normalized path at `now`.
    pub(super) fn record(&mut self, path: PathBuf, kind: ChangeKind, now: Instant) {
        let Some(existing) = self.pending.get_mut(&path) else {
            debug!(self.logger, "watch"; "event {}: {}", kind.label(), path.display());
            self.pending.insert(path, Pending { kind, last_event: now });
            return;
        };

        match (existing.kind, kind) {
            (ChangeKind::Removed, ChangeKind::Created | ChangeKind::Modified) => {
                debug!(self.logger, "watch"; "restore removed->{}: {}", kind.label(), path.display());
                existing.kind = kind;
            }
            (ChangeKind::Modified, ChangeKind::Removed) => {
                debug!(self.logger, "watch"; "upgrade modified->removed: {}", path.display());
                existing.kind = ChangeKind::Removed;
            }
            (ChangeKind::Created, ChangeKind::Removed) => {
                debug!(self.logger, "watch"; "discard created+removed: {}", path.display());
                self.pending.remove(&path);
                return;
            }
            _ => {}
        }
        existing.last_event = now;
    }

    /// Take every path whose window elapsed by `now`, sorted by path.
    ///
    /// Kinds are reconciled with the filesystem: an atomic save reported as
    /// `Removed` for a file that exists again becomes `Modified`.
    pub(super) fn take_ready(&mut self, now: Instant) -> Vec<FileChange> {
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_event) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();

        let mut changes = Vec::with_capacity(ready.len());
        for path in ready {
            let Some(pending) = self.pending.remove(&path) else {
                continue;
            };
            let exists = path.exists();
            let kind = match pending.kind {
                ChangeKind::Created | ChangeKind::Modified if !exists => {
                    if pending.kind == ChangeKind::Created {
                        debug!(self.logger, "watch"; "discard created (gone): {}", path.display());
                        continue;
                    }
                    ChangeKind::Removed
                }
                ChangeKind::Removed if exists => ChangeKind::Modified,
                kind => kind,
            };
            if kind != ChangeKind::Removed && path.is_dir() {
                continue;
            }
            changes.push(FileChange { path, kind });
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }

    /// Time until the earliest pending window elapses, or `None` when idle.
    pub(super) fn sleep_duration(&self, now: Instant) -> Option<Duration> {
        self.pending
            .values()
            .map(|p| {
                self.window
                    .saturating_sub(now.saturating_duration_since(p.last_event))
            })
            .min()
            .map(|d| d.max(Duration::from_millis(1)))
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(super) fn kind_of(&self, path: &Path) -> Option<ChangeKind> {
        self.pending.get(path).map(|p| p.kind)
    }
}

/// Check if path is a temp/backup file (editor artifacts).
pub(super) fn is_temp_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    matches!(ext, "bck" | "bak" | "backup" | "swp" | "swo" | "tmp")
        || name.ends_with('~')
        || name.starts_with('.')
}
