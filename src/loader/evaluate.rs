//! Turning source bytes into an artifact.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;

use super::Artifact;
use crate::error::BoxError;

/// Evaluates one module version.
///
/// Called on first load and again for every content change. A returned
/// error leaves the previously active version in place.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, path: &Path, source: &[u8]) -> Result<Artifact, BoxError>;
}

impl<F> Evaluator for F
where
    F: Fn(&Path, &[u8]) -> Result<Artifact, BoxError> + Send + Sync,
{
    fn evaluate(&self, path: &Path, source: &[u8]) -> Result<Artifact, BoxError> {
        self(path, source)
    }
}

/// Factory function registered for one module identity.
pub type ModuleFactory = Arc<dyn Fn(&Path, &[u8]) -> Result<Artifact, BoxError> + Send + Sync>;

/// Evaluator dispatching on the module's file stem.
///
/// Every version bump re-invokes the registered factory with the new bytes.
/// Modules without a factory go to the fallback evaluator, if any.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: DashMap<String, ModuleFactory>,
    fallback: Option<Arc<dyn Evaluator>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, fallback: impl Evaluator + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Register (or replace) the factory for modules named `stem`.
    pub fn register<F>(&self, stem: impl Into<String>, factory: F)
    where
        F: Fn(&Path, &[u8]) -> Result<Artifact, BoxError> + Send + Sync + 'static,
    {
        self.factories.insert(stem.into(), Arc::new(factory));
    }

    pub fn contains(&self, stem: &str) -> bool {
        self.factories.contains_key(stem)
    }
}

impl Evaluator for FactoryRegistry {
    fn evaluate(&self, path: &Path, source: &[u8]) -> Result<Artifact, BoxError> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        // Clone out of the map so the factory runs without a shard lock.
        let factory = self.factories.get(&stem).map(|f| Arc::clone(f.value()));
        match (factory, &self.fallback) {
            (Some(factory), _) => factory(path, source),
            (None, Some(fallback)) => fallback.evaluate(path, source),
            (None, None) => Err(format!("no factory registered for `{stem}`").into()),
        }
    }
}
