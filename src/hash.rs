//! Stable 64-bit hashing of flat paths.
//!
//! Path hashes key the concurrent registry and link pass 1 discoveries with
//! pass 2 lookups, so the seed is fixed: the same path hashes identically
//! across runs and across both passes.

use xxhash_rust::xxh3::Xxh3;

const PATH_HASH_SEED: u64 = 0x6b69_6c6e_0001;

/// Streaming path hasher with a parent/full split.
///
/// Not shareable between threads; each worker owns one.
pub struct PathHasher {
    digest: Xxh3,
}

impl PathHasher {
    pub fn new() -> Self {
        PathHasher { digest: Xxh3::with_seed(PATH_HASH_SEED) }
    }

    /// Hash a complete flat path.
    pub fn hash(&mut self, flat_path: &[u8]) -> u64 {
        self.digest.reset();
        self.digest.update(flat_path);
        self.digest.digest()
    }

    /// Hash the parent prefix and the full path in one pass.
    ///
    /// The digest over `flat_path[..parent_len]` is read out as the parent
    /// hash, then the remaining bytes are folded in to produce the full-path
    /// hash. Each byte is touched once.
    pub fn hash_parent(&mut self, flat_path: &[u8], parent_len: usize) -> (u64, u64) {
        self.digest.reset();
        self.digest.update(&flat_path[..parent_len]);
        let parent = self.digest.digest();
        self.digest.update(&flat_path[parent_len..]);
        (self.digest.digest(), parent)
    }
}

impl Default for PathHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let mut a = PathHasher::new();
        let mut b = PathHasher::new();
        assert_eq!(a.hash(b".a.b"), b.hash(b".a.b"));
        assert_ne!(a.hash(b".a.b"), a.hash(b".a.c"));
    }

    #[test]
    fn test_hash_parent_matches_split_hashing() {
        let mut h = PathHasher::new();
        let (full, parent) = h.hash_parent(b".a.b.c", 4);
        assert_eq!(parent, h.hash(b".a.b"));
        assert_eq!(full, h.hash(b".a.b.c"));
    }

    #[test]
    fn test_hash_parent_empty_prefix() {
        let mut h = PathHasher::new();
        let (full, parent) = h.hash_parent(b".a", 0);
        assert_eq!(parent, h.hash(b""));
        assert_eq!(full, h.hash(b".a"));
    }
}
