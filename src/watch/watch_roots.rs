use std::path::{Path, PathBuf};

use notify::{RecursiveMode, Watcher};
use rustc_hash::FxHashSet;

use crate::error::WatchError;
use crate::logger::Logger;

/// Watch-root consistency manager.
///
/// Responsibility:
/// - Attach existing roots at startup and on `add`
/// - Unwatch and report roots that disappear (once per loss)
/// - Re-attach roots that were removed and recreated
pub(super) struct WatchRoots {
    desired: Vec<PathBuf>,
    attached: FxHashSet<PathBuf>,
    /// Roots already reported as unavailable.
    lost: FxHashSet<PathBuf>,
}

impl WatchRoots {
    pub(super) fn new(paths: Vec<PathBuf>) -> Self {
        let mut desired = Vec::with_capacity(paths.len());
        for path in paths {
            if !desired.contains(&path) {
                desired.push(path);
            }
        }
        Self {
            desired,
            attached: FxHashSet::default(),
            lost: FxHashSet::default(),
        }
    }

    pub(super) fn desired(&self) -> &[PathBuf] {
        &self.desired
    }

    #[cfg(test)]
    pub(super) fn is_attached(&self, path: &Path) -> bool {
        self.attached.contains(path)
    }

    /// Attach every desired root that exists. Missing roots wait for `maintain`.
    pub(super) fn attach_existing(
        &mut self,
        watcher: &mut impl Watcher,
        logger: &dyn Logger,
    ) -> Vec<WatchError> {
        let pending: Vec<PathBuf> = self.desired.clone();
        pending
            .iter()
            .filter_map(|path| self.attach(path, watcher, logger))
            .collect()
    }

    /// Start watching `path`. Returns false if it was already a root.
    pub(super) fn add(
        &mut self,
        path: PathBuf,
        watcher: &mut impl Watcher,
        logger: &dyn Logger,
    ) -> (bool, Option<WatchError>) {
        if self.desired.contains(&path) {
            return (false, None);
        }
        self.desired.push(path.clone());
        (true, self.attach(&path, watcher, logger))
    }

    /// Stop watching `path`. Returns false if it was not a root.
    pub(super) fn remove(&mut self, path: &Path, watcher: &mut impl Watcher) -> bool {
        let Some(index) = self.desired.iter().position(|p| p == path) else {
            return false;
        };
        self.desired.remove(index);
        self.lost.remove(path);
        if self.attached.remove(path) {
            // The directory may already be gone, in which case notify dropped it.
            let _ = watcher.unwatch(path);
        }
        true
    }

    /// Detach lost roots and re-attach recreated ones.
    ///
    /// Returns the roots newly found unavailable.
    pub(super) fn maintain(
        &mut self,
        watcher: &mut impl Watcher,
        logger: &dyn Logger,
    ) -> Vec<WatchError> {
        let mut errors = Vec::new();

        let gone: Vec<PathBuf> = self
            .attached
            .iter()
            .filter(|path| !path.is_dir())
            .cloned()
            .collect();
        for path in gone {
            self.attached.remove(&path);
            let _ = watcher.unwatch(&path);
            if self.lost.insert(path.clone()) {
                let err = WatchError {
                    path,
                    cause: "directory no longer exists".to_string(),
                };
                warn!(logger, "watch"; "{}", err);
                errors.push(err);
            }
        }

        let candidates: Vec<PathBuf> = self
            .desired
            .iter()
            .filter(|path| !self.attached.contains(*path) && path.is_dir())
            .cloned()
            .collect();
        for path in candidates {
            let was_lost = self.lost.contains(&path);
            if let Some(err) = self.attach(&path, watcher, logger) {
                errors.push(err);
            } else if was_lost && self.attached.contains(&path) {
                debug!(logger, "watch"; "re-attached watch: {}", path.display());
            }
        }

        errors
    }

    fn attach(
        &mut self,
        path: &Path,
        watcher: &mut impl Watcher,
        logger: &dyn Logger,
    ) -> Option<WatchError> {
        if !path.is_dir() {
            debug!(logger, "watch"; "root not present yet: {}", path.display());
            return None;
        }
        match watcher.watch(path, RecursiveMode::Recursive) {
            Ok(()) => {
                self.attached.insert(path.to_path_buf());
                self.lost.remove(path);
                None
            }
            Err(e) => {
                if !self.lost.insert(path.to_path_buf()) {
                    // Already reported
                    return None;
                }
                let err = WatchError {
                    path: path.to_path_buf(),
                    cause: e.to_string(),
                };
                warn!(logger, "watch"; "{}", err);
                Some(err)
            }
        }
    }
}
