//! Content hashing for change detection.
//!
//! A reload only happens when the hash of a file's bytes changes, so
//! a touch without a content change never reaches the evaluator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A 256-bit content hash.
///
/// `fxhash` digests occupy the first 8 bytes; the rest stay zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    #[inline]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 16 hex chars are enough to tell versions apart in logs
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Hash algorithm used for module identities (`algorithm` config key).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Fxhash,
}

impl HashAlgorithm {
    /// Hash raw file contents.
    pub fn digest(self, data: &[u8]) -> ContentHash {
        match self {
            Self::Blake3 => ContentHash::new(*blake3::hash(data).as_bytes()),
            Self::Fxhash => {
                let mut bytes = [0u8; 32];
                bytes[..8].copy_from_slice(&crate::utils::hash::compute(data).to_le_bytes());
                ContentHash::new(bytes)
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Fxhash => "fxhash",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blake3" => Ok(Self::Blake3),
            "fxhash" | "fx" => Ok(Self::Fxhash),
            other => Err(format!("unknown hash algorithm `{other}` (expected blake3 or fxhash)")),
        }
    }
}
