//! Content-hash change detection for module sources.

mod hash;

pub use hash::{ContentHash, HashAlgorithm};
