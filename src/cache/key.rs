//! Cache Key Derivation
//!
//! Content-addressed keys derived from resource locators. Every tier and the
//! fetch coordinator agree on identity through [`derive_key`].

use std::fmt;

use sha2::{Digest, Sha256};

/// Length of a key digest in bytes (SHA-256)
pub const KEY_LEN: usize = 32;

/// Length of the hex rendering of a key
pub const KEY_HEX_LEN: usize = KEY_LEN * 2;

/// Cache key - SHA-256 digest of the resource locator
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    /// Derive the key for a locator
    pub fn derive(locator: &str) -> Self {
        let digest = Sha256::digest(locator.as_bytes());
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Parse a key from its 64-character hex form
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != KEY_HEX_LEN {
            return None;
        }
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Lowercase hex rendering, used as the disk tier file stem
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw digest bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// First eight digest bytes as an integer, for log correlation
    #[inline]
    pub fn prefix(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }
}

/// Derive the cache key for a resource locator.
///
/// Pure and deterministic: equal locators always yield equal keys.
pub fn derive_key(locator: &str) -> CacheKey {
    CacheKey::derive(locator)
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:016x})", self.prefix())
    }
}

// =============================================================================
// Tests
// =============================================================================
