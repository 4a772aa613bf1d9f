//! Command-line interface module.

mod args;
pub mod watch;

pub use args::{Cli, Commands, WatchArgs};

use std::path::Path;

use anyhow::{Context as _, Result};
use hotmount::config::HmrConfig;

/// Load `path` if it exists, otherwise start from defaults.
///
/// Returns the unknown keys found in the file.
pub fn load_config(path: &Path) -> Result<(HmrConfig, Vec<String>)> {
    if !path.exists() {
        return Ok((HmrConfig::default(), Vec::new()));
    }
    HmrConfig::from_path(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Apply command-line overrides on top of the file configuration.
pub fn apply_overrides(config: &mut HmrConfig, args: &WatchArgs) -> Result<()> {
    if !args.dirs.is_empty() {
        config.dirs.clone_from(&args.dirs);
    }
    if !args.extensions.is_empty() {
        config.extensions.clone_from(&args.extensions);
    }
    if let Some(debounce) = args.debounce {
        config.debounce = debounce;
    }
    config.debug |= args.verbose;

    let cwd = std::env::current_dir()?;
    config.finalize(&cwd);
    config.validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_overrides_replace_file_values() {
        let cli = Cli::parse_from([
            "hotmount", "watch", "--dir", "/srv/plugins", "--ext", ".TOML", "--debounce", "250",
        ]);
        let Commands::Watch { args } = cli.command;

        let mut config = HmrConfig::default();
        apply_overrides(&mut config, &args).unwrap();

        assert_eq!(config.dirs.len(), 1);
        assert!(config.dirs[0].ends_with("plugins"));
        assert_eq!(config.extensions, vec!["toml".to_string()]);
        assert_eq!(config.debounce, 250);
        assert_eq!(cli.config, Path::new("hotmount.toml"));
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let (config, ignored) = load_config(&dir.path().join("hotmount.toml")).unwrap();
        assert_eq!(config.debounce, HmrConfig::default().debounce);
        assert!(ignored.is_empty());
    }

    #[test]
    fn test_zero_debounce_is_rejected() {
        let mut config = HmrConfig::default();
        let args = WatchArgs {
            dirs: Vec::new(),
            extensions: Vec::new(),
            debounce: Some(0),
            verbose: false,
            stats: false,
        };
        assert!(apply_overrides(&mut config, &args).is_err());
    }
}
