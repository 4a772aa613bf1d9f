//! Core shared types.

mod state;

pub use state::{HmrState, StateCell};
