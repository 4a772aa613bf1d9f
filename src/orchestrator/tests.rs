use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;

use super::*;
use crate::dependency::{Context, NodeSetup, NodeStatus};
use crate::error::BoxError;
use crate::loader::{Artifact, Manifest};
use crate::logger::{Level, MemoryLogger};

fn config(root: &Path) -> HmrConfig {
    HmrConfig {
        dirs: vec![root.to_path_buf()],
        debounce: 50,
        ..HmrConfig::default()
    }
}

fn fixture() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let root = normalize_path(dir.path());
    (dir, root)
}

fn start(root: &Path) -> (Hmr, Arc<MemoryLogger>) {
    let logger = Arc::new(MemoryLogger::new(false));
    let hmr = Hmr::builder(config(root))
        .with_logger(logger.clone())
        .start()
        .unwrap();
    (hmr, logger)
}

async fn settle(hmr: &Hmr) {
    tokio::time::timeout(Duration::from_secs(5), hmr.wait_idle())
        .await
        .unwrap();
}

fn drain(rx: &mut broadcast::Receiver<HmrEvent>) -> Vec<HmrEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn named<'a>(events: &'a [HmrEvent], name: &str) -> Vec<&'a HmrEvent> {
    events.iter().filter(|e| e.name() == name).collect()
}

fn greeting(node: &NodeRef) -> Option<String> {
    node.lookup::<toml::Value>("greeting")
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_import_mounts_active_node() {
    let (_dir, root) = fixture();
    let file = root.join("a.mod");
    fs::write(&file, "name = \"A\"\n[provides]\ngreeting = \"hello\"\n").unwrap();

    let (hmr, _) = start(&root);
    let node = hmr.import("A", &file).await.unwrap();

    assert_eq!(node.status(), NodeStatus::Active);
    assert_eq!(greeting(&node).as_deref(), Some("hello"));
    assert!(hmr.watch_dirs().contains(&root));
    assert_eq!(hmr.find_plugin_by_name("A").unwrap().id(), node.id());
    assert_eq!(node.parent().unwrap().id(), hmr.root().id());

    // Same path again returns the mounted node
    let again = hmr.import("A", &file).await.unwrap();
    assert_eq!(again.id(), node.id());
    assert_eq!(hmr.reload_status().nodes, 1);

    hmr.dispose().await;
}

#[tokio::test]
async fn test_identical_write_reloads_once() {
    let (_dir, root) = fixture();
    let file = root.join("a.mod");
    fs::write(&file, "[provides]\ngreeting = \"one\"\n").unwrap();

    let (hmr, _) = start(&root);
    let node = hmr.import("A", &file).await.unwrap();
    let first = node.version().unwrap();

    fs::write(&file, "[provides]\ngreeting = \"two\"\n").unwrap();
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;
    let second = node.version().unwrap();

    fs::write(&file, "[provides]\ngreeting = \"two\"\n").unwrap();
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;

    assert!(second > first);
    assert_eq!(node.version(), Some(second));
    assert_eq!(greeting(&node).as_deref(), Some("two"));
    assert_eq!(hmr.performance_stats().reload_count, 1);

    hmr.dispose().await;
}

#[tokio::test]
async fn test_evaluation_failure_keeps_previous_version() {
    let (_dir, root) = fixture();
    let file = root.join("a.mod");
    fs::write(&file, "[provides]\ngreeting = \"hello\"\n").unwrap();

    let (hmr, logger) = start(&root);
    let node = hmr.import("A", &file).await.unwrap();
    let version = node.version();
    let mut events = hmr.subscribe();

    fs::write(&file, "[provides]\ngreeting = ").unwrap();
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;

    assert_eq!(node.version(), version);
    assert_eq!(greeting(&node).as_deref(), Some("hello"));
    assert_eq!(node.status(), NodeStatus::Error);
    assert!(node.info().unwrap().last_error.is_some());
    assert_eq!(hmr.performance_stats().error_count, 1);

    let events = drain(&mut events);
    assert_eq!(named(&events, "error").len(), 1);
    assert!(named(&events, "change").is_empty());
    assert_eq!(logger.at_least(Level::Error).len(), 1);

    // Touching the broken file again is a no-op
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;
    assert_eq!(hmr.performance_stats().error_count, 1);

    hmr.dispose().await;
}

#[tokio::test]
async fn test_dispose_cancels_queued_reloads() {
    let (_dir, root) = fixture();
    let a = root.join("a.mod");
    let b = root.join("b.mod");
    fs::write(&a, "[provides]\ngreeting = \"a\"\n").unwrap();
    fs::write(&b, "[provides]\ngreeting = \"b\"\n").unwrap();

    let (hmr, _) = start(&root);
    let node_a = hmr.import("A", &a).await.unwrap();
    hmr.import("B", &b).await.unwrap();

    fs::write(&a, "[provides]\ngreeting = \"a2\"\n").unwrap();
    fs::write(&b, "[provides]\ngreeting = \"b2\"\n").unwrap();
    hmr.request_reload(&a).unwrap();
    hmr.request_reload(&b).unwrap();

    let report = hmr.dispose().await;
    assert!(report.is_clean());

    let status = hmr.reload_status();
    assert_eq!(status.state, HmrState::Disposed);
    assert!(status.queue.queued.is_empty());
    assert!(status.queue.running.is_none());
    assert_eq!(status.nodes, 0);
    assert_eq!(node_a.status(), NodeStatus::Disposed);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!hmr.root().is_mounted());
    assert!(matches!(hmr.request_reload(&a), Err(HmrError::Disposed)));
    assert!(matches!(hmr.import("A", &a).await, Err(HmrError::Disposed)));
    assert!(hmr.dispose().await.disposed.is_empty());
}

// =============================================================================
// Reload behavior
// =============================================================================

#[tokio::test]
async fn test_concurrent_requests_load_once() {
    let (_dir, root) = fixture();
    let file = root.join("a.mod");
    fs::write(&file, "[provides]\ngreeting = \"one\"\n").unwrap();

    let evaluations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&evaluations);
    let hmr = Hmr::builder(config(&root))
        .with_logger(Arc::new(MemoryLogger::new(false)))
        .with_evaluator(move |path: &Path, source: &[u8]| -> std::result::Result<Artifact, BoxError> {
            counter.fetch_add(1, Ordering::SeqCst);
            ManifestEvaluator.evaluate(path, source)
        })
        .start()
        .unwrap();
    hmr.import("A", &file).await.unwrap();

    fs::write(&file, "[provides]\ngreeting = \"two\"\n").unwrap();
    hmr.request_reload(&file).unwrap();
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;

    assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    assert_eq!(hmr.performance_stats().reload_count, 1);
    assert_eq!(hmr.reload_status().nodes, 1);

    hmr.dispose().await;
}

/// Factory that mounts `greeting` with a counted disposer and fails on `fail = true`.
fn counting_factory(disposed: Arc<AtomicUsize>) -> impl NodeFactory + 'static {
    move |setup: &mut NodeSetup| -> std::result::Result<(), BoxError> {
        let manifest = setup
            .artifact_as::<Manifest>()
            .ok_or("not a manifest")?;
        let value = manifest.provides.get("greeting").cloned();
        let disposed = Arc::clone(&disposed);
        setup.register(
            Context::value("greeting", value.unwrap_or(toml::Value::from("")))
                .on_dispose(move |_| async move {
                    disposed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )?;
        if manifest.provides.contains_key("fail") {
            return Err("refusing to construct".into());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_construct_failure_rolls_back() {
    let (_dir, root) = fixture();
    let file = root.join("a.mod");
    fs::write(&file, "[provides]\ngreeting = \"good\"\n").unwrap();

    let disposed = Arc::new(AtomicUsize::new(0));
    let hmr = Hmr::builder(config(&root))
        .with_logger(Arc::new(MemoryLogger::new(false)))
        .with_factory(counting_factory(Arc::clone(&disposed)))
        .start()
        .unwrap();
    let node = hmr.import("A", &file).await.unwrap();
    let mut events = hmr.subscribe();

    fs::write(&file, "[provides]\ngreeting = \"bad\"\nfail = true\n").unwrap();
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;

    // The half-built replacement was torn down, the old node kept serving
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(greeting(&node).as_deref(), Some("good"));
    assert_eq!(node.status(), NodeStatus::Error);
    assert_eq!(named(&drain(&mut events), "error").len(), 1);

    fs::write(&file, "[provides]\ngreeting = \"fixed\"\n").unwrap();
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;

    assert_eq!(disposed.load(Ordering::SeqCst), 2);
    assert_eq!(greeting(&node).as_deref(), Some("fixed"));
    assert_eq!(node.status(), NodeStatus::Active);
    let events = drain(&mut events);
    assert_eq!(named(&events, "change").len(), 1);
    assert_eq!(named(&events, "dispose").len(), 1);

    hmr.dispose().await;
    assert_eq!(disposed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_deleted_file_unmounts_and_reimports() {
    let (_dir, root) = fixture();
    let file = root.join("a.mod");
    fs::write(&file, "[provides]\ngreeting = \"hello\"\n").unwrap();

    let (hmr, _) = start(&root);
    let node = hmr.import("A", &file).await.unwrap();
    let mut events = hmr.subscribe();

    fs::remove_file(&file).unwrap();
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;

    assert!(!node.is_mounted());
    assert_eq!(hmr.reload_status().modules, 0);
    assert_eq!(named(&drain(&mut events), "remove").len(), 1);

    fs::write(&file, "[provides]\ngreeting = \"back\"\n").unwrap();
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;

    // Same identity, same handle
    assert!(node.is_mounted());
    assert_eq!(greeting(&node).as_deref(), Some("back"));
    assert_eq!(named(&drain(&mut events), "add").len(), 1);

    hmr.dispose().await;
}

#[tokio::test]
async fn test_failed_import_is_retried_on_change() {
    let (_dir, root) = fixture();
    let file = root.join("a.mod");
    fs::write(&file, "[provides\n").unwrap();

    let (hmr, _) = start(&root);
    let err = hmr.import("A", &file).await.unwrap_err();
    assert!(matches!(err, HmrError::Load(_)));
    assert!(hmr.find_plugin_by_name("A").is_none());

    fs::write(&file, "[provides]\ngreeting = \"ok\"\n").unwrap();
    hmr.request_reload(&file).unwrap();
    settle(&hmr).await;

    let node = hmr.find_plugin_by_name("A").unwrap();
    assert_eq!(greeting(&node).as_deref(), Some("ok"));

    hmr.dispose().await;
}

#[tokio::test]
async fn test_untracked_and_protected_paths_require_restart() {
    let (_dir, root) = fixture();
    let settings = root.join("hotmount.toml");
    let stray = root.join("stray.mod");
    fs::write(&settings, "debounce = 50\n").unwrap();
    fs::write(&stray, "").unwrap();

    let logger = Arc::new(MemoryLogger::new(false));
    let hmr = Hmr::builder(HmrConfig {
        protected: vec![settings.clone()],
        ..config(&root)
    })
    .with_logger(logger)
    .start()
    .unwrap();
    let mut events = hmr.subscribe();

    hmr.request_reload(&settings).unwrap();
    hmr.request_reload(&stray).unwrap();
    settle(&hmr).await;

    let events = drain(&mut events);
    let paths: Vec<_> = named(&events, "restart-required")
        .into_iter()
        .filter_map(|e| match e {
            HmrEvent::RestartRequired { path } => Some(path.clone()),
            _ => None,
        })
        .collect();
    assert!(paths.contains(&settings));
    assert!(paths.contains(&stray));
    assert_eq!(hmr.reload_status().nodes, 0);

    hmr.dispose().await;
}

// =============================================================================
// Tree behavior through the facade
// =============================================================================

fn nested(root: &Path, child_override: bool) -> PathBuf {
    let parent = root.join("app.mod");
    fs::write(
        &parent,
        "[provides]\ndb = \"app-db\"\n\n[[imports]]\nname = \"child\"\npath = \"child.mod\"\n",
    )
    .unwrap();
    let child = if child_override {
        "[provides]\ndb = \"child-db\"\n\n[[imports]]\nname = \"leaf\"\npath = \"leaf.mod\"\n"
    } else {
        "[[imports]]\nname = \"leaf\"\npath = \"leaf.mod\"\n"
    };
    fs::write(root.join("child.mod"), child).unwrap();
    fs::write(root.join("leaf.mod"), "").unwrap();
    parent
}

fn db(node: &NodeRef) -> String {
    node.lookup::<toml::Value>("db")
        .unwrap()
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_nested_imports_inherit_contexts() {
    let (_dir, root) = fixture();
    let app = nested(&root, false);

    let (hmr, _) = start(&root);
    let app = hmr.import("app", &app).await.unwrap();
    let child = hmr.find_plugin_by_name("child").unwrap();
    let leaf = hmr.find_plugin_by_name("leaf").unwrap();

    assert_eq!(child.parent().unwrap().id(), app.id());
    assert_eq!(leaf.parent().unwrap().id(), child.id());
    assert_eq!(db(&leaf), "app-db");
    assert!(matches!(
        leaf.lookup::<toml::Value>("missing"),
        Err(HmrError::ContextNotFound { .. })
    ));

    hmr.dispose().await;
}

#[tokio::test]
async fn test_child_override_shadows_ancestor() {
    let (_dir, root) = fixture();
    let app = nested(&root, true);

    let (hmr, _) = start(&root);
    let app = hmr.import("app", &app).await.unwrap();
    let leaf = hmr.find_plugin_by_name("leaf").unwrap();

    assert_eq!(db(&leaf), "child-db");
    assert_eq!(db(&app), "app-db");

    hmr.dispose().await;
}

#[tokio::test]
async fn test_parent_reload_remounts_children() {
    let (_dir, root) = fixture();
    let app = nested(&root, false);

    let (hmr, _) = start(&root);
    let app_node = hmr.import("app", &app).await.unwrap();
    assert_eq!(hmr.reload_status().modules, 3);

    fs::write(
        &app,
        "[provides]\ndb = \"app-db-2\"\n\n[[imports]]\nname = \"child\"\npath = \"child.mod\"\n",
    )
    .unwrap();
    hmr.request_reload(&app).unwrap();
    settle(&hmr).await;

    let child = hmr.find_plugin_by_name("child").unwrap();
    let leaf = hmr.find_plugin_by_name("leaf").unwrap();
    assert_eq!(child.parent().unwrap().id(), app_node.id());
    assert_eq!(leaf.parent().unwrap().id(), child.id());
    assert_eq!(db(&leaf), "app-db-2");

    let status = hmr.reload_status();
    assert_eq!(status.nodes, 3);
    assert_eq!(status.modules, 3);

    // The remounted child still hot-reloads
    let mut events = hmr.subscribe();
    fs::write(
        root.join("child.mod"),
        "[provides]\ntag = \"v2\"\n\n[[imports]]\nname = \"leaf\"\npath = \"leaf.mod\"\n",
    )
    .unwrap();
    hmr.request_reload(root.join("child.mod")).unwrap();
    settle(&hmr).await;

    let events = drain(&mut events);
    assert!(named(&events, "restart-required").is_empty());
    assert_eq!(named(&events, "change").len(), 1);
    assert!(hmr.find_plugin_by_name("leaf").is_some());
    assert_eq!(hmr.reload_status().modules, 3);

    hmr.dispose().await;
}

#[tokio::test]
async fn test_parent_reload_drops_unlisted_children() {
    let (_dir, root) = fixture();
    let app = nested(&root, false);

    let (hmr, _) = start(&root);
    hmr.import("app", &app).await.unwrap();

    fs::write(&app, "[provides]\ndb = \"alone\"\n").unwrap();
    hmr.request_reload(&app).unwrap();
    settle(&hmr).await;

    assert!(hmr.find_plugin_by_name("child").is_none());
    assert!(hmr.find_plugin_by_name("leaf").is_none());
    let status = hmr.reload_status();
    assert_eq!(status.nodes, 1);
    assert_eq!(status.modules, 1);

    let mut events = hmr.subscribe();
    fs::write(root.join("child.mod"), "[provides]\ntag = \"orphan\"\n").unwrap();
    hmr.request_reload(root.join("child.mod")).unwrap();
    settle(&hmr).await;
    assert!(drain(&mut events).is_empty());

    hmr.dispose().await;
}

#[tokio::test]
async fn test_remove_disposes_post_order() {
    let (_dir, root) = fixture();
    let app = nested(&root, false);

    let (hmr, _) = start(&root);
    hmr.import("app", &app).await.unwrap();
    let mut events = hmr.subscribe();

    let report = hmr.remove("app").await.unwrap().unwrap();
    let order: Vec<_> = report
        .disposed
        .iter()
        .map(|id| PathBuf::from(id.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![root.join("leaf.mod"), root.join("child.mod"), root.join("app.mod")]
    );

    let events = drain(&mut events);
    let disposed: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            HmrEvent::Dispose { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(disposed, vec!["leaf", "child", "app"]);
    assert_eq!(named(&events, "remove").len(), 1);
    assert!(hmr.remove("app").await.unwrap().is_none());

    // Removed by the host: later edits are ignored
    fs::write(root.join("app.mod"), "[provides]\ndb = \"new\"\n").unwrap();
    hmr.request_reload(root.join("app.mod")).unwrap();
    settle(&hmr).await;
    assert!(hmr.find_plugin_by_name("app").is_none());

    hmr.dispose().await;
}

#[tokio::test]
async fn test_config_changed_is_forwarded_to_host() {
    let (_dir, root) = fixture();
    let file = root.join("a.mod");
    fs::write(&file, "").unwrap();

    let (hmr, _) = start(&root);
    let node = hmr.import("A", &file).await.unwrap();
    let mut events = hmr.subscribe();

    node.emit(CONFIG_CHANGED, &json!({ "port": 8080 })).unwrap();
    // Not forwarded
    node.emit("private", &json!(null)).unwrap();

    let events = drain(&mut events);
    assert_eq!(events.len(), 1);
    let HmrEvent::ConfigChanged { payload } = &events[0] else {
        panic!("expected config-changed, got {:?}", events[0]);
    };
    assert_eq!(payload["port"], 8080);

    hmr.dispose().await;
}

#[tokio::test]
async fn test_watch_dirs_add_and_remove() {
    let (_dir, root) = fixture();
    let extra = root.join("extra");
    fs::create_dir_all(&extra).unwrap();
    let outside = TempDir::new().unwrap();
    let outside_file = normalize_path(outside.path()).join("z.mod");
    fs::write(&outside_file, "").unwrap();

    let (hmr, _) = start(&root);
    assert!(hmr.add_watch_dir(&extra).await.unwrap());
    assert!(!hmr.add_watch_dir(&extra).await.unwrap());
    assert!(hmr.watch_dirs().contains(&extra));

    assert!(hmr.remove_watch_dir(&extra).await.unwrap());
    assert!(!hmr.remove_watch_dir(&extra).await.unwrap());
    assert_eq!(hmr.watch_dirs(), vec![root.clone()]);

    // Importing outside every root watches the file's directory
    hmr.import("Z", &outside_file).await.unwrap();
    assert!(hmr.watch_dirs().contains(&normalize_path(outside.path())));

    hmr.dispose().await;
}

#[tokio::test]
async fn test_watcher_drives_reload() {
    let (_dir, root) = fixture();
    let file = root.join("a.mod");
    fs::write(&file, "[provides]\ngreeting = \"one\"\n").unwrap();

    let (hmr, _) = start(&root);
    let node = hmr.import("A", &file).await.unwrap();

    fs::write(&file, "[provides]\ngreeting = \"two\"\n").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while greeting(&node).as_deref() != Some("two") && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(greeting(&node).as_deref(), Some("two"));
    assert_eq!(hmr.performance_stats().reload_count, 1);
    assert!(hmr.performance_report().contains("reload"));

    hmr.dispose().await;
}
