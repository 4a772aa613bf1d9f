//! Fast non-cryptographic hashing using FxHash.
//!
//! Backs the `fxhash` content hash algorithm. Deterministic across runs,
//! which is all change detection needs.
//!
//! # Usage
//!
//! ```ignore
//! use crate::utils::hash;
//!
//! let h = hash::compute("some content"); // -> u64
//! ```

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Compute 64-bit hash from byte data.
#[inline]
pub fn compute<T: AsRef<[u8]> + ?Sized>(data: &T) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(data.as_ref());
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_is_deterministic() {
        assert_eq!(compute("name = \"A\""), compute("name = \"A\""));
        assert_ne!(compute("name = \"A\""), compute("name = \"B\""));
    }
}
