//! Versioned module table: the single source of truth for what is loaded.

use dashmap::DashMap;
use std::path::{Path, PathBuf};

use super::LoadedModule;
use crate::freshness::ContentHash;

struct ModuleEntry {
    module: LoadedModule,
    /// Hash of the latest content that failed to load or construct.
    failed: Option<ContentHash>,
}

/// Path → active module (thread-safe). Writes replace whole entries.
pub(crate) struct ModuleTable {
    entries: DashMap<PathBuf, ModuleEntry>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, path: &Path) -> Option<LoadedModule> {
        self.entries.get(path).map(|e| e.module.clone())
    }

    pub fn failed_hash(&self, path: &Path) -> Option<ContentHash> {
        self.entries.get(path).and_then(|e| e.failed)
    }

    /// Make `module` the active version of its path.
    pub fn insert(&self, module: LoadedModule) -> Option<LoadedModule> {
        let path = module.path.clone();
        self.entries
            .insert(path, ModuleEntry { module, failed: None })
            .map(|e| e.module)
    }

    /// Remember a failing hash without touching the active version.
    pub fn mark_failed(&self, path: &Path, hash: ContentHash) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.failed = Some(hash);
        }
    }

    pub fn clear_failed(&self, path: &Path) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.failed = None;
        }
    }

    pub fn remove(&self, path: &Path) -> Option<LoadedModule> {
        self.entries.remove(path).map(|(_, e)| e.module)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
