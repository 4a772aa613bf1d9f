//! Path utilities.
//!
//! - [`fs`]: Filesystem path normalization (`normalize_path`, `has_extension`)

pub mod fs;

pub use fs::{has_extension, normalize_path};
