//! Post-order asynchronous teardown.
//!
//! For one node: every child subtree, then side effects (last registered
//! first), then context disposers (last registered first). A failing
//! callback is logged and collected; the rest still run. Locks are only
//! taken between awaits.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinSet;

use super::{BoxFuture, ContextEntry, DISPOSE_EVENT, NodeId, NodeStatus, SharedTree, Teardown};
use crate::config::DisposePolicy;
use crate::error::{DisposeError, TeardownStep};
use crate::event::{EventSink, HmrEvent};
use crate::logger::Logger;

/// Outcome of disposing a subtree.
#[derive(Debug, Default)]
pub struct DisposeReport {
    /// Disposed node ids, in teardown order.
    pub disposed: Vec<NodeId>,
    pub errors: Vec<DisposeError>,
}

impl DisposeReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn merge(&mut self, other: DisposeReport) {
        self.disposed.extend(other.disposed);
        self.errors.extend(other.errors);
    }
}

/// Everything a teardown needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub(crate) struct DisposeCtx {
    pub(crate) tree: SharedTree,
    pub(crate) policy: DisposePolicy,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) events: EventSink,
}

/// Dispose `id` and everything below it.
///
/// A node that is missing, or already disposing, is skipped.
pub(crate) fn dispose_subtree(ctx: DisposeCtx, id: NodeId) -> BoxFuture<DisposeReport> {
    Box::pin(async move {
        let mut report = DisposeReport::default();

        let children = {
            let mut tree = ctx.tree.write();
            let Some(node) = tree.get_mut(&id) else {
                return report;
            };
            if !node.status.is_live() {
                return report;
            }
            node.status = NodeStatus::Disposing;
            node.children.clone()
        };

        match ctx.policy {
            DisposePolicy::Sequential => {
                for child in children {
                    report.merge(dispose_subtree(ctx.clone(), child).await);
                }
            }
            DisposePolicy::Concurrent => {
                let mut set = JoinSet::new();
                for child in children {
                    set.spawn(dispose_subtree(ctx.clone(), child));
                }
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok(child_report) => report.merge(child_report),
                        Err(e) => warn!(ctx.logger, "dispose"; "teardown task of {} failed: {}", id, e),
                    }
                }
            }
        }

        let (name, side_effects, contexts, bus) = {
            let mut tree = ctx.tree.write();
            let Some(node) = tree.get_mut(&id) else {
                return report;
            };
            (
                node.name.clone(),
                std::mem::take(&mut node.side_effects),
                std::mem::take(&mut node.contexts),
                Arc::clone(&node.bus),
            )
        };

        report
            .errors
            .extend(run_teardown(&id, side_effects, contexts, &*ctx.logger).await);

        {
            let mut tree = ctx.tree.write();
            tree.detach(&id);
            tree.remove(&id);
        }

        debug!(ctx.logger, "dispose"; "disposed {}", id);
        bus.emit(DISPOSE_EVENT, &json!({ "id": id.as_str(), "name": name }));
        bus.clear();
        let _ = ctx.events.send(HmrEvent::Dispose {
            id: id.clone(),
            name,
        });
        report.disposed.push(id);
        report
    })
}

/// Run side effects then context disposers, both newest first.
pub(crate) async fn run_teardown(
    id: &NodeId,
    side_effects: Vec<Teardown>,
    contexts: Vec<ContextEntry>,
    logger: &dyn Logger,
) -> Vec<DisposeError> {
    let mut errors = Vec::new();

    for (index, teardown) in side_effects.into_iter().enumerate().rev() {
        if let Err(cause) = teardown().await {
            let err = DisposeError {
                node: id.clone(),
                step: TeardownStep::SideEffect(index),
                cause,
            };
            warn!(logger, "dispose"; "{}", err);
            errors.push(err);
        }
    }

    for entry in contexts.into_iter().rev() {
        let name = entry.name.clone();
        if let Err(cause) = entry.dispose().await {
            let err = DisposeError {
                node: id.clone(),
                step: TeardownStep::Context(name),
                cause,
            };
            warn!(logger, "dispose"; "{}", err);
            errors.push(err);
        }
    }

    errors
}
