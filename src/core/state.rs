//! Orchestrator lifecycle state.
//!
//! ```text
//! initializing → watching ⇄ reloading
//!       └──────────┴──────────┴──→ disposed (terminal)
//! ```
//!
//! Stored in one atomic so the watcher, the reload worker and host calls
//! can read it without locking.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum HmrState {
    Initializing = 0,
    Watching = 1,
    Reloading = 2,
    Disposed = 3,
}

impl HmrState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initializing,
            1 => Self::Watching,
            2 => Self::Reloading,
            _ => Self::Disposed,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Watching => "watching",
            Self::Reloading => "reloading",
            Self::Disposed => "disposed",
        }
    }
}

/// Atomic holder for [`HmrState`] enforcing the allowed transitions.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(HmrState::Initializing as u8))
    }

    pub fn get(&self) -> HmrState {
        HmrState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_disposed(&self) -> bool {
        self.get() == HmrState::Disposed
    }

    /// Move from `from` to `to`. Fails if the current state is not `from`.
    pub fn transition(&self, from: HmrState, to: HmrState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Watching → Reloading. No-op in any other state.
    pub fn begin_reload(&self) -> bool {
        self.transition(HmrState::Watching, HmrState::Reloading)
    }

    /// Reloading → Watching. No-op in any other state.
    pub fn end_reload(&self) -> bool {
        self.transition(HmrState::Reloading, HmrState::Watching)
    }

    /// Enter the terminal state. Returns the previous state.
    pub fn dispose(&self) -> HmrState {
        HmrState::from_u8(self.0.swap(HmrState::Disposed as u8, Ordering::AcqRel))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_cycle() {
        let state = StateCell::new();
        assert_eq!(state.get(), HmrState::Initializing);
        assert!(!state.begin_reload());

        assert!(state.transition(HmrState::Initializing, HmrState::Watching));
        assert!(state.begin_reload());
        assert_eq!(state.get(), HmrState::Reloading);
        assert!(state.end_reload());
        assert_eq!(state.get(), HmrState::Watching);
    }

    #[test]
    fn test_disposed_is_terminal() {
        let state = StateCell::new();
        state.transition(HmrState::Initializing, HmrState::Watching);
        assert!(state.begin_reload());

        assert_eq!(state.dispose(), HmrState::Reloading);
        assert!(state.is_disposed());
        assert!(!state.end_reload());
        assert!(!state.begin_reload());
        assert_eq!(state.dispose(), HmrState::Disposed);
    }
}
