//! Key strategies for the heap catalog.

use std::fmt::Debug;
use std::hash::Hash;

use once_cell::sync::Lazy;

/// Fixed seeds so a key is stable for the lifetime of the process and across
/// catalog instances.
static FQN_HASHER: Lazy<ahash::RandomState> = Lazy::new(|| {
    ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
});

/// Maps an FQN to the key the catalog stores its identity under.
pub trait CatalogKeys: Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    /// Short label for logs and stats
    const NAME: &'static str;

    fn key(&self, fqn: &str) -> Self::Key;

    /// Numeric form of a key, for diagnostics
    fn fingerprint(&self, key: &Self::Key) -> u64;
}

/// 64-bit hash of the FQN.
///
/// Distinct FQNs may share a key, so every hit is verified against the full
/// FQN by the catalog.
#[derive(Clone, Copy)]
pub struct HashedKeys {
    hash: fn(&str) -> u64,
}

impl HashedKeys {
    pub fn new() -> Self {
        Self { hash: hash_fqn }
    }

    /// Uses a caller-supplied hash function.
    pub fn with_hasher(hash: fn(&str) -> u64) -> Self {
        Self { hash }
    }
}

impl Default for HashedKeys {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogKeys for HashedKeys {
    type Key = u64;

    const NAME: &'static str = "hashed";

    #[inline]
    fn key(&self, fqn: &str) -> u64 {
        (self.hash)(fqn)
    }

    fn fingerprint(&self, key: &u64) -> u64 {
        *key
    }
}

/// The FQN itself.
#[derive(Clone, Copy, Default)]
pub struct FqnKeys;

impl CatalogKeys for FqnKeys {
    type Key = String;

    const NAME: &'static str = "fqn";

    #[inline]
    fn key(&self, fqn: &str) -> String {
        fqn.to_owned()
    }

    fn fingerprint(&self, key: &String) -> u64 {
        hash_fqn(key)
    }
}

/// Default FQN hash.
#[inline]
pub fn hash_fqn(fqn: &str) -> u64 {
    FQN_HASHER.hash_one(fqn)
}
