//! Module loading with content-hash identities.
//!
//! Every successful evaluation gets a fresh [`Version`] from a monotonic
//! counter. A file whose bytes hash the same as the active version is never
//! re-evaluated, and neither is content that already failed once.
//!
//! # Module Structure
//!
//! - `table` - Path → active version table
//! - `evaluate` - [`Evaluator`] trait and [`FactoryRegistry`]
//! - `manifest` - TOML manifest evaluator and node factory

mod evaluate;
mod manifest;
mod table;

use std::any::Any;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::LoadError;
use crate::freshness::{ContentHash, HashAlgorithm};
use crate::logger::Logger;

pub use evaluate::{Evaluator, FactoryRegistry, ModuleFactory};
pub use manifest::{Manifest, ManifestEvaluator, ManifestFactory, ManifestImport};

use table::ModuleTable;

/// An evaluated module, opaque to the orchestrator.
pub type Artifact = Arc<dyn Any + Send + Sync>;

/// Monotonic module version. Never reused within one loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One evaluated version of a file.
#[derive(Clone)]
pub struct LoadedModule {
    pub name: String,
    pub path: PathBuf,
    pub hash: ContentHash,
    pub version: Version,
    pub artifact: Artifact,
    pub load_duration: Duration,
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("hash", &format_args!("{}", self.hash))
            .field("version", &self.version)
            .field("load_duration", &self.load_duration)
            .finish()
    }
}

/// Result of [`ModuleLoader::reload`].
#[derive(Debug, Clone)]
pub enum ReloadOutcome {
    /// Same content as the active version, or as the last failure.
    Unchanged(LoadedModule),
    /// A new version is now active.
    Reloaded {
        previous: Option<LoadedModule>,
        current: LoadedModule,
    },
}

/// Reads, hashes and evaluates module files.
pub struct ModuleLoader {
    table: ModuleTable,
    evaluator: Arc<dyn Evaluator>,
    algorithm: HashAlgorithm,
    next_version: AtomicU64,
    logger: Arc<dyn Logger>,
}

impl ModuleLoader {
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        algorithm: HashAlgorithm,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            table: ModuleTable::new(),
            evaluator,
            algorithm,
            next_version: AtomicU64::new(1),
            logger,
        }
    }

    /// Load `path` (expected normalized) under `name`.
    ///
    /// Returns the active version as-is when the content is unchanged.
    pub fn load(&self, name: &str, path: &Path) -> Result<LoadedModule, LoadError> {
        let source = read_source(path)?;
        let hash = self.algorithm.digest(&source);

        if let Some(active) = self.table.get(path)
            && active.hash == hash
        {
            return Ok(active);
        }

        let module = self.evaluate(name, path, &source, hash)?;
        self.table.insert(module.clone());
        Ok(module)
    }

    /// Re-read `path` and evaluate it if its content changed.
    ///
    /// On failure the active version (if any) is untouched and the failing
    /// hash is remembered, so touching the same broken file is a no-op.
    pub fn reload(&self, path: &Path) -> Result<ReloadOutcome, LoadError> {
        let source = read_source(path)?;
        let hash = self.algorithm.digest(&source);
        let previous = self.table.get(path);

        if let Some(active) = &previous {
            if active.hash == hash {
                // Reverting to the active content also clears a failure.
                self.table.clear_failed(path);
                return Ok(ReloadOutcome::Unchanged(active.clone()));
            }
            if self.table.failed_hash(path) == Some(hash) {
                debug!(self.logger, "loader"; "{} still at failing content {}", path.display(), hash);
                return Ok(ReloadOutcome::Unchanged(active.clone()));
            }
        }

        let name = previous
            .as_ref()
            .map_or_else(|| module_name(path), |m| m.name.clone());
        let current = self.evaluate(&name, path, &source, hash)?;
        self.table.insert(current.clone());
        Ok(ReloadOutcome::Reloaded { previous, current })
    }

    /// Put `previous` back after `failed` could not be constructed.
    ///
    /// `failed`'s hash is remembered like an evaluation failure.
    pub fn restore(&self, previous: Option<LoadedModule>, failed: &LoadedModule) {
        match previous {
            Some(previous) => {
                self.table.insert(previous);
                self.table.mark_failed(&failed.path, failed.hash);
            }
            None => {
                self.table.remove(&failed.path);
            }
        }
    }

    /// Active version of `path`.
    pub fn get(&self, path: &Path) -> Option<LoadedModule> {
        self.table.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.table.contains(path)
    }

    /// Drop `path` from the table.
    pub fn forget(&self, path: &Path) -> Option<LoadedModule> {
        self.table.remove(path)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.table.clear();
    }

    fn evaluate(
        &self,
        name: &str,
        path: &Path,
        source: &[u8],
        hash: ContentHash,
    ) -> Result<LoadedModule, LoadError> {
        let start = Instant::now();
        let artifact = match self.evaluator.evaluate(path, source) {
            Ok(artifact) => artifact,
            Err(cause) => {
                self.table.mark_failed(path, hash);
                return Err(LoadError::new(path, cause));
            }
        };
        let load_duration = start.elapsed();
        let version = Version(self.next_version.fetch_add(1, Ordering::Relaxed));

        debug!(self.logger, "loader"; "evaluated {} {} ({}) in {:?}", name, version, hash, load_duration);

        Ok(LoadedModule {
            name: name.to_string(),
            path: path.to_path_buf(),
            hash,
            version,
            artifact,
            load_duration,
        })
    }
}

fn read_source(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path).map_err(|err| LoadError::new(path, err))
}

/// Default module name: the file stem.
pub fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NullLogger;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Evaluator that fails on sources containing "!" and counts calls.
    fn loader() -> (ModuleLoader, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let evaluator = move |_: &Path, source: &[u8]| -> Result<Artifact, crate::error::BoxError> {
            counter.fetch_add(1, Ordering::SeqCst);
            let text = String::from_utf8_lossy(source).into_owned();
            if text.contains('!') {
                return Err(format!("syntax error in {text}").into());
            }
            Ok(Arc::new(text))
        };
        let loader = ModuleLoader::new(
            Arc::new(evaluator),
            HashAlgorithm::Blake3,
            Arc::new(NullLogger),
        );
        (loader, calls)
    }

    #[test]
    fn test_load_assigns_version_and_reuses_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mod");
        fs::write(&path, "one").unwrap();
        let (loader, calls) = loader();

        let first = loader.load("a", &path).unwrap();
        let again = loader.load("a", &path).unwrap();
        assert_eq!(first.version, again.version);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*first.artifact.downcast::<String>().unwrap(), "one");
    }

    #[test]
    fn test_reload_bumps_version_on_change_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mod");
        fs::write(&path, "one").unwrap();
        let (loader, _) = loader();
        let first = loader.load("a", &path).unwrap();

        assert!(matches!(loader.reload(&path).unwrap(), ReloadOutcome::Unchanged(_)));

        fs::write(&path, "two").unwrap();
        let ReloadOutcome::Reloaded { previous, current } = loader.reload(&path).unwrap() else {
            panic!("expected reload");
        };
        assert_eq!(previous.unwrap().version, first.version);
        assert!(current.version > first.version);
        assert_eq!(current.name, "a");
        assert_eq!(loader.get(&path).unwrap().version, current.version);
    }

    #[test]
    fn test_failed_reload_keeps_previous_and_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mod");
        fs::write(&path, "good").unwrap();
        let (loader, calls) = loader();
        let good = loader.load("a", &path).unwrap();

        fs::write(&path, "bad!").unwrap();
        let err = loader.reload(&path).unwrap_err();
        assert_eq!(err.path, path);
        assert_eq!(loader.get(&path).unwrap().version, good.version);

        // Touch with identical broken content: no second evaluation
        assert!(matches!(loader.reload(&path).unwrap(), ReloadOutcome::Unchanged(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Fixing the file evaluates again
        fs::write(&path, "fixed").unwrap();
        assert!(matches!(
            loader.reload(&path).unwrap(),
            ReloadOutcome::Reloaded { .. }
        ));
    }

    #[test]
    fn test_restore_reinstates_previous() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.mod");
        fs::write(&path, "one").unwrap();
        let (loader, _) = loader();
        let first = loader.load("a", &path).unwrap();

        fs::write(&path, "two").unwrap();
        let ReloadOutcome::Reloaded { previous, current } = loader.reload(&path).unwrap() else {
            panic!("expected reload");
        };
        loader.restore(previous, &current);
        assert_eq!(loader.get(&path).unwrap().version, first.version);
        // The rejected content is not retried on a touch
        assert!(matches!(loader.reload(&path).unwrap(), ReloadOutcome::Unchanged(_)));
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let dir = TempDir::new().unwrap();
        let (loader, _) = loader();
        let err = loader.load("ghost", &dir.path().join("ghost.mod")).unwrap_err();
        assert!(err.to_string().contains("ghost.mod"));
    }

    #[test]
    fn test_module_name_is_stem() {
        assert_eq!(module_name(Path::new("/p/auth.mod")), "auth");
    }
}
