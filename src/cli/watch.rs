//! `hotmount watch`: mount every plugin found, then reload on change until Ctrl+C.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use crossbeam::channel;
use rustc_hash::FxHashSet;
use tokio::sync::broadcast::error::RecvError;

use hotmount::config::HmrConfig;
use hotmount::event::HmrEvent;
use hotmount::loader::{Manifest, module_name};
use hotmount::logger::{ConsoleLogger, Logger, status_error, status_success, status_warning};
use hotmount::orchestrator::Hmr;
use hotmount::{debug, info, warn};

use super::WatchArgs;

pub fn run(config: HmrConfig, ignored: &[String], args: &WatchArgs) -> Result<()> {
    let logger: Arc<dyn Logger> = Arc::new(ConsoleLogger::new(config.debug));
    if !ignored.is_empty() {
        warn!(logger, "config"; "unknown keys ignored: {}", ignored.join(", "));
    }

    let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .map_err(|e| anyhow!("failed to set Ctrl+C handler: {}", e))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    rt.block_on(async {
        let hmr = Hmr::builder(config)
            .with_logger(Arc::clone(&logger))
            .start()?;

        let plugins = top_level(hmr.scan_plugins());
        for path in &plugins {
            // Failures are already logged and stay queued for retry
            if let Ok(node) = hmr.import(&module_name(path), path).await {
                debug!(logger, "hmr"; "mounted {}", node.id());
            }
        }
        info!(logger, "hmr"; "{} plugin(s) mounted, watching {} dir(s)", plugins.len(), hmr.watch_dirs().len());

        let printer = tokio::spawn(print_events(hmr.subscribe()));
        let _ = tokio::task::spawn_blocking(move || shutdown_rx.recv()).await;

        info!(logger, "hmr"; "shutting down...");
        let report = hmr.dispose().await;
        printer.abort();
        if !report.is_clean() {
            warn!(logger, "hmr"; "{} teardown error(s)", report.errors.len());
        }

        if args.stats {
            println!("{}", serde_json::to_string_pretty(&hmr.performance_stats())?);
        } else {
            debug!(logger, "hmr"; "{}", hmr.performance_report());
        }
        Ok::<(), anyhow::Error>(())
    })
}

/// Plugins that no other plugin imports; the rest are mounted by their parents.
fn top_level(files: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut imported = FxHashSet::default();
    for file in &files {
        let Ok(source) = std::fs::read(file) else {
            continue;
        };
        let Ok(manifest) = Manifest::parse(&source) else {
            continue;
        };
        let dir = file.parent().unwrap_or(Path::new(""));
        for import in manifest.imports {
            imported.insert(hotmount::utils::path::normalize_path(&dir.join(import.path)));
        }
    }
    files
        .into_iter()
        .filter(|f| !imported.contains(f))
        .collect()
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<HmrEvent>) {
    loop {
        match events.recv().await {
            Ok(HmrEvent::Change { name, from, to, .. }) => {
                status_success(&format!("reloaded {name} ({from} → {to})"));
            }
            Ok(HmrEvent::Add { name, .. }) => status_success(&format!("mounted {name}")),
            Ok(HmrEvent::Remove { name, .. }) => status_warning(&format!("removed {name}")),
            Ok(HmrEvent::RestartRequired { path }) => {
                status_warning(&format!("{} changed, restart to apply", path.display()));
            }
            Ok(HmrEvent::Fatal { message }) => status_error("watcher stopped", &message),
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_top_level_skips_imported_plugins() {
        let dir = TempDir::new().unwrap();
        let root = hotmount::utils::path::normalize_path(dir.path());
        std::fs::write(
            root.join("app.mod"),
            "[[imports]]\nname = \"child\"\npath = \"child.mod\"\n",
        )
        .unwrap();
        std::fs::write(root.join("child.mod"), "").unwrap();
        std::fs::write(root.join("broken.mod"), "[[imports").unwrap();

        let files = vec![
            root.join("app.mod"),
            root.join("broken.mod"),
            root.join("child.mod"),
        ];
        assert_eq!(
            top_level(files),
            vec![root.join("app.mod"), root.join("broken.mod")]
        );
    }
}
