//! Orchestrator configuration (`hotmount.toml`).
//!
//! # Example
//!
//! ```toml
//! dirs = ["plugins", "~/.hotmount/plugins"]
//! extensions = ["mod"]
//! debounce = 100              # ms of quiet before a change is emitted
//! algorithm = "blake3"        # or "fxhash"
//! max_listeners = 10          # per event name on a node bus, 0 = unlimited
//! debug = false
//! protected = ["secrets.toml"]   # changes require a full restart
//! dispose_policy = "sequential"  # or "concurrent" for sibling teardown
//! memory_sample_interval = 5000  # ms, omit to disable sampling
//! forward_events = ["config-changed"]
//! ```
//!
//! The `logger` option is supplied programmatically through
//! [`crate::HmrBuilder::with_logger`].

mod error;

pub use error::ConfigError;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::freshness::HashAlgorithm;
use crate::utils::path::normalize_path;

/// Default config file name, searched in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "hotmount.toml";

/// Event forwarded from a node's bus to its parent's by default.
pub const CONFIG_CHANGED: &str = "config-changed";

/// How siblings are torn down when their parent is disposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisposePolicy {
    /// One sibling at a time, in insertion order.
    #[default]
    Sequential,
    /// All siblings at once; each sibling still disposes its own children first.
    Concurrent,
}

/// Root configuration structure representing hotmount.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HmrConfig {
    /// Absolute path to the config file (internal use only)
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// Watch roots.
    pub dirs: Vec<PathBuf>,

    /// Watched file suffixes, without the leading dot.
    pub extensions: Vec<String>,

    /// Debounce window in milliseconds.
    pub debounce: u64,

    /// Content hash algorithm.
    pub algorithm: HashAlgorithm,

    /// Cap on subscribers per event name on a node bus (0 = unlimited).
    pub max_listeners: usize,

    /// Log successful operations too.
    pub debug: bool,

    /// Sources that are never hot-reloaded; a change asks the host to restart.
    pub protected: Vec<PathBuf>,

    /// Sibling teardown policy.
    pub dispose_policy: DisposePolicy,

    /// Memory sampling period in milliseconds.
    pub memory_sample_interval: Option<u64>,

    /// Node bus events re-emitted on the parent's bus.
    pub forward_events: Vec<String>,
}

impl Default for HmrConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            dirs: vec![PathBuf::from("plugins")],
            extensions: vec!["mod".to_string()],
            debounce: 100,
            algorithm: HashAlgorithm::default(),
            max_listeners: 10,
            debug: false,
            protected: Vec::new(),
            dispose_policy: DisposePolicy::default(),
            memory_sample_interval: None,
            forward_events: vec![CONFIG_CHANGED.to_string()],
        }
    }
}

impl HmrConfig {
    /// Parse configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from file path.
    ///
    /// Returns the unknown keys alongside the config so the caller can warn
    /// through its own logger.
    pub fn from_path(path: &Path) -> Result<(Self, Vec<String>), ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;

        let (mut config, ignored) = Self::parse_with_ignored(&content)?;
        let path = normalize_path(path);
        let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        config.config_path = Some(path);
        config.finalize(&root);
        config.validate()?;

        Ok((config, ignored))
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    /// Resolve paths against `root` and normalize extensions.
    ///
    /// Idempotent: running it twice leaves the config unchanged.
    pub fn finalize(&mut self, root: &Path) {
        self.dirs = self
            .dirs
            .iter()
            .map(|dir| resolve_dir(dir, root))
            .collect();
        dedupe(&mut self.dirs);

        self.protected = self
            .protected
            .iter()
            .map(|p| resolve_dir(p, root))
            .collect();
        if let Some(config_path) = &self.config_path
            && !self.protected.contains(config_path)
        {
            self.protected.push(config_path.clone());
        }
        dedupe(&mut self.protected);

        self.extensions = self
            .extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self.extensions.dedup();
    }

    /// Validate semantic constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.debounce == 0 {
            problems.push("`debounce` must be greater than 0".to_string());
        }
        if self.extensions.iter().any(|e| e.is_empty()) {
            problems.push("`extensions` contains an empty entry".to_string());
        }
        if self.memory_sample_interval == Some(0) {
            problems.push("`memory_sample_interval` must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }

    /// Debounce window as a duration.
    #[inline]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce)
    }

    /// Whether `path` is a protected (restart-only) source.
    pub fn is_protected(&self, path: &Path) -> bool {
        self.protected.iter().any(|p| p == path)
    }
}

/// Expand `~` and make `path` absolute relative to `root`.
fn resolve_dir(path: &Path, root: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    let expanded = PathBuf::from(shellexpand::tilde(&raw).as_ref());
    if expanded.is_absolute() {
        normalize_path(&expanded)
    } else {
        normalize_path(&root.join(expanded))
    }
}

fn dedupe(paths: &mut Vec<PathBuf>) {
    let mut seen = rustc_hash::FxHashSet::default();
    paths.retain(|p| seen.insert(p.clone()));
}

// ============================================================================
// tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = HmrConfig::default();
        assert_eq!(config.debounce, 100);
        assert_eq!(config.extensions, vec!["mod"]);
        assert_eq!(config.algorithm, HashAlgorithm::Blake3);
        assert_eq!(config.dispose_policy, DisposePolicy::Sequential);
        assert_eq!(config.forward_events, vec![CONFIG_CHANGED]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str() {
        let config = HmrConfig::from_str(
            "dirs = [\"/plugins\"]\nextensions = [\".mod\", \"toml\"]\ndebounce = 50\nalgorithm = \"fxhash\"\ndispose_policy = \"concurrent\"",
        )
        .unwrap();
        assert_eq!(config.dirs, vec![PathBuf::from("/plugins")]);
        assert_eq!(config.debounce, 50);
        assert_eq!(config.algorithm, HashAlgorithm::Fxhash);
        assert_eq!(config.dispose_policy, DisposePolicy::Concurrent);
    }

    #[test]
    fn test_from_str_invalid_toml() {
        assert!(HmrConfig::from_str("[base\ndebounce = 1").is_err());
        assert!(HmrConfig::from_str("algorithm = \"md5\"").is_err());
    }

    #[test]
    fn test_unknown_fields_detected() {
        let (config, ignored) =
            HmrConfig::parse_with_ignored("debounce = 10\nwatch_everything = true").unwrap();
        assert_eq!(config.debounce, 10);
        assert_eq!(ignored, vec!["watch_everything".to_string()]);
    }

    #[test]
    fn test_from_path_resolves_and_protects_itself() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("plugins")).unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "dirs = [\"plugins\"]\nextensions = [\".MOD\"]").unwrap();

        let (config, ignored) = HmrConfig::from_path(&path).unwrap();
        assert!(ignored.is_empty());

        let root = normalize_path(dir.path());
        assert_eq!(config.dirs, vec![root.join("plugins")]);
        assert_eq!(config.extensions, vec!["mod"]);
        assert!(config.is_protected(&root.join(DEFAULT_CONFIG_FILE)));
    }

    #[test]
    fn test_validation_collects_problems() {
        let config = HmrConfig {
            debounce: 0,
            extensions: vec![String::new()],
            ..HmrConfig::default()
        };
        let Err(ConfigError::Validation(problems)) = config.validate() else {
            panic!("expected validation error");
        };
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut config = HmrConfig {
            dirs: vec![PathBuf::from("a"), PathBuf::from("a")],
            ..HmrConfig::default()
        };
        config.finalize(dir.path());
        let once = config.dirs.clone();
        config.finalize(dir.path());
        assert_eq!(config.dirs, once);
        assert_eq!(once.len(), 1);
    }
}
