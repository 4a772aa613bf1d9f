//! Reload Queue
//!
//! FIFO across distinct paths, one entry per path. A change for a path
//! that is already queued folds into that entry; a change for the path
//! currently running is replayed after it finishes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;

use crate::dependency::NodeId;
use crate::watch::ChangeKind;

/// Finished tasks kept for status reports.
const HISTORY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

/// "This file changed; dispose and reconstruct its owning node."
#[derive(Debug, Clone, Serialize)]
pub struct ReloadTask {
    pub id: u64,
    pub path: PathBuf,
    pub kind: ChangeKind,
    #[serde(skip)]
    pub enqueued_at: Instant,
    /// Nodes touched by the task, filled in when it finishes.
    pub affected: Vec<NodeId>,
    pub state: TaskState,
    /// Changes folded into this task while it waited.
    pub coalesced: u32,
}

/// What [`ReloadQueue::push`] did with a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    New(u64),
    Coalesced(u64),
    /// The path is running; it will be queued again when it finishes.
    Deferred(u64),
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub queued: Vec<PathBuf>,
    pub running: Option<PathBuf>,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Most recent finished tasks, oldest first.
    pub recent: Vec<ReloadTask>,
}

#[derive(Debug, Default)]
pub struct ReloadQueue {
    pending: VecDeque<ReloadTask>,
    running: Option<ReloadTask>,
    /// Latest change seen for the running path.
    rerun: Option<ChangeKind>,
    history: VecDeque<ReloadTask>,
    next_id: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

impl ReloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a change, coalescing by path. The latest kind wins.
    pub fn push(&mut self, path: PathBuf, kind: ChangeKind) -> Enqueued {
        if let Some(running) = &self.running
            && running.path == path
        {
            self.rerun = Some(kind);
            return Enqueued::Deferred(running.id);
        }
        if let Some(task) = self.pending.iter_mut().find(|t| t.path == path) {
            task.kind = kind;
            task.coalesced += 1;
            return Enqueued::Coalesced(task.id);
        }
        let id = self.enqueue(path, kind);
        Enqueued::New(id)
    }

    /// Move the oldest queued task to running.
    ///
    /// Returns `None` while another task is running.
    pub fn start_next(&mut self) -> Option<ReloadTask> {
        if self.running.is_some() {
            return None;
        }
        let mut task = self.pending.pop_front()?;
        task.state = TaskState::Running;
        self.running = Some(task.clone());
        Some(task)
    }

    /// Finish the running task, replaying a deferred change if one arrived.
    pub fn finish(&mut self, state: TaskState, affected: Vec<NodeId>) -> Option<ReloadTask> {
        let mut task = self.running.take()?;
        task.state = state;
        task.affected = affected;
        match state {
            TaskState::Failed => self.failed += 1,
            TaskState::Cancelled => self.cancelled += 1,
            _ => self.completed += 1,
        }
        if let Some(kind) = self.rerun.take() {
            self.enqueue(task.path.clone(), kind);
        }
        self.remember(task.clone());
        Some(task)
    }

    /// Cancel every queued task. The running one is left to finish.
    pub fn cancel_all(&mut self) -> usize {
        self.rerun = None;
        let drained: Vec<ReloadTask> = self.pending.drain(..).collect();
        let count = drained.len();
        for mut task in drained {
            task.state = TaskState::Cancelled;
            self.cancelled += 1;
            self.remember(task);
        }
        count
    }

    /// Queued plus running.
    pub fn outstanding(&self) -> usize {
        self.pending.len() + usize::from(self.running.is_some())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_running(&self, path: &Path) -> bool {
        self.running.as_ref().is_some_and(|t| t.path == path)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queued: self.pending.iter().map(|t| t.path.clone()).collect(),
            running: self.running.as_ref().map(|t| t.path.clone()),
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            recent: self.history.iter().cloned().collect(),
        }
    }

    fn enqueue(&mut self, path: PathBuf, kind: ChangeKind) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.push_back(ReloadTask {
            id,
            path,
            kind,
            enqueued_at: Instant::now(),
            affected: Vec::new(),
            state: TaskState::Queued,
            coalesced: 0,
        });
        id
    }

    fn remember(&mut self, task: ReloadTask) {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(task);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_fifo_across_paths() {
        let mut queue = ReloadQueue::new();
        queue.push(p("/a.mod"), ChangeKind::Modified);
        queue.push(p("/b.mod"), ChangeKind::Modified);

        assert_eq!(queue.start_next().unwrap().path, p("/a.mod"));
        queue.finish(TaskState::Done, Vec::new());
        assert_eq!(queue.start_next().unwrap().path, p("/b.mod"));
    }

    #[test]
    fn test_coalesce_queued_path() {
        let mut queue = ReloadQueue::new();
        let first = queue.push(p("/a.mod"), ChangeKind::Created);
        let second = queue.push(p("/a.mod"), ChangeKind::Modified);

        let Enqueued::New(id) = first else {
            panic!("expected new task");
        };
        assert_eq!(second, Enqueued::Coalesced(id));
        assert_eq!(queue.outstanding(), 1);

        let task = queue.start_next().unwrap();
        assert_eq!(task.kind, ChangeKind::Modified);
        assert_eq!(task.coalesced, 1);
    }

    #[test]
    fn test_single_in_flight_task_per_path() {
        let mut queue = ReloadQueue::new();
        queue.push(p("/a.mod"), ChangeKind::Modified);
        let running = queue.start_next().unwrap();

        // Change during run is deferred, not run concurrently
        assert_eq!(
            queue.push(p("/a.mod"), ChangeKind::Modified),
            Enqueued::Deferred(running.id)
        );
        assert!(queue.start_next().is_none());
        assert!(queue.is_running(&p("/a.mod")));

        queue.finish(TaskState::Done, Vec::new());
        let replay = queue.start_next().unwrap();
        assert_eq!(replay.path, p("/a.mod"));
        assert_ne!(replay.id, running.id);
    }

    #[test]
    fn test_cancel_all_keeps_running_task() {
        let mut queue = ReloadQueue::new();
        queue.push(p("/a.mod"), ChangeKind::Modified);
        queue.push(p("/b.mod"), ChangeKind::Modified);
        queue.push(p("/c.mod"), ChangeKind::Removed);
        queue.start_next();

        assert_eq!(queue.cancel_all(), 2);
        assert_eq!(queue.outstanding(), 1);
        queue.finish(TaskState::Done, Vec::new());

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.cancelled, 2);
        assert_eq!(snapshot.completed, 1);
        assert!(snapshot.queued.is_empty());
        assert_eq!(snapshot.recent.len(), 3);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut queue = ReloadQueue::new();
        for i in 0..(HISTORY_LEN + 5) {
            queue.push(p(&format!("/{i}.mod")), ChangeKind::Modified);
            queue.start_next();
            queue.finish(TaskState::Failed, Vec::new());
        }
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.recent.len(), HISTORY_LEN);
        assert_eq!(snapshot.failed, (HISTORY_LEN + 5) as u64);
    }
}
