//! TOML plugin manifests, the built-in module format.
//!
//! ```toml
//! name = "auth"
//!
//! [provides]
//! token_ttl = 3600
//!
//! [[imports]]
//! name = "session"
//! path = "session.mod"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Artifact, Evaluator};
use crate::dependency::{Context, NodeFactory, NodeSetup};
use crate::error::BoxError;

/// Parsed plugin manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    /// Display name; defaults to the file stem.
    pub name: Option<String>,

    /// Contexts provided to descendants, one per key.
    pub provides: toml::Table,

    /// Nested plugins mounted under this one.
    pub imports: Vec<ManifestImport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestImport {
    pub name: String,
    /// Relative to the manifest's directory.
    pub path: PathBuf,
}

impl Manifest {
    pub fn parse(source: &[u8]) -> Result<Self, BoxError> {
        let text = std::str::from_utf8(source)?;
        Ok(toml::from_str(text)?)
    }
}

/// Evaluates sources as [`Manifest`]s. Malformed TOML is an evaluation error.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestEvaluator;

impl Evaluator for ManifestEvaluator {
    fn evaluate(&self, _path: &Path, source: &[u8]) -> Result<Artifact, BoxError> {
        Ok(Arc::new(Manifest::parse(source)?))
    }
}

/// Builds nodes from [`Manifest`] artifacts.
///
/// Each `provides` entry becomes a context holding the raw `toml::Value`,
/// and each `imports` entry becomes a child node.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestFactory;

impl NodeFactory for ManifestFactory {
    fn create(&self, setup: &mut NodeSetup) -> Result<(), BoxError> {
        let Some(manifest) = setup.artifact_as::<Manifest>() else {
            return Err(format!("{} is not a manifest", setup.path().display()).into());
        };
        for (key, value) in &manifest.provides {
            setup.register(Context::value(key.clone(), value.clone()))?;
        }
        for import in &manifest.imports {
            setup.import(import.name.clone(), &import.path);
        }
        Ok(())
    }
}
