//! Lifecycle events delivered to the host.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::dependency::NodeId;
use crate::loader::Version;

/// Broadcast capacity; slow subscribers observe `Lagged` past this.
pub const EVENT_CAPACITY: usize = 256;

pub type EventSink = broadcast::Sender<HmrEvent>;

/// Something the host may want to react to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HmrEvent {
    /// A node was mounted.
    Add {
        id: NodeId,
        name: String,
        path: PathBuf,
        version: Version,
    },
    /// A node's backing file was deleted and the node disposed.
    Remove {
        id: NodeId,
        name: String,
        path: PathBuf,
    },
    /// A node was replaced by a newer version of its file.
    Change {
        id: NodeId,
        name: String,
        path: PathBuf,
        from: Version,
        to: Version,
    },
    /// A load, construction or watch failure. The previous state stays active.
    Error { path: PathBuf, message: String },
    /// A node finished teardown.
    Dispose { id: NodeId, name: String },
    /// A forwarded `config-changed` reached the root.
    ConfigChanged { payload: Value },
    /// A protected or untracked source changed; only a restart applies it.
    RestartRequired { path: PathBuf },
    /// The watcher stopped delivering events.
    Fatal { message: String },
}

impl HmrEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Change { .. } => "change",
            Self::Error { .. } => "error",
            Self::Dispose { .. } => "dispose",
            Self::ConfigChanged { .. } => "config-changed",
            Self::RestartRequired { .. } => "restart-required",
            Self::Fatal { .. } => "fatal",
        }
    }
}

pub(crate) fn channel() -> EventSink {
    broadcast::channel(EVENT_CAPACITY).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_tag_matches_name() {
        let events = [
            HmrEvent::Error {
                path: PathBuf::from("/p/a.mod"),
                message: "boom".into(),
            },
            HmrEvent::RestartRequired {
                path: PathBuf::from("/p/hotmount.toml"),
            },
            HmrEvent::ConfigChanged {
                payload: serde_json::json!({"port": 8080}),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["event"], event.name());
        }
    }
}
