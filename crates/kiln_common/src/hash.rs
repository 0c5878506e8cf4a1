//! Content hashing for fingerprints, signatures, and cache keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// A 128-bit content hash computed using XXH3.
///
/// Two byte sequences with the same `ContentHash` are assumed to be identical.
/// Used for file fingerprints, task signatures, module keys, and cache keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// Computes a content hash from a byte slice using XXH3-128.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_le_bytes())
    }

    /// Parses the 32-character lowercase hex form produced by `Display`.
    ///
    /// Returns `None` for any other length or non-hex input.
    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != 32 || !text.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the first twelve hex characters, used in file names and descriptions.
    pub fn short(&self) -> String {
        let mut full = self.to_string();
        full.truncate(12);
        full
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Incremental XXH3-128 hasher with unambiguous field framing.
///
/// Every field is written with a length prefix so that `["ab", "c"]` and
/// `["a", "bc"]` never collide. The resulting hash depends only on the
/// sequence of fields written, never on process state.
pub struct StableHasher {
    inner: xxhash_rust::xxh3::Xxh3,
}

impl StableHasher {
    /// Creates a hasher seeded with a domain tag.
    ///
    /// Distinct tags keep hashes of different kinds of records apart.
    pub fn new(domain: &str) -> Self {
        let mut hasher = Self {
            inner: xxhash_rust::xxh3::Xxh3::new(),
        };
        hasher.write_str(domain);
        hasher
    }

    /// Writes a length-prefixed byte field.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.inner.update(&(bytes.len() as u64).to_le_bytes());
        self.inner.update(bytes);
        self
    }

    /// Writes a length-prefixed string field.
    pub fn write_str(&mut self, text: &str) -> &mut Self {
        self.write_bytes(text.as_bytes())
    }

    /// Writes a path field using its lossy UTF-8 form.
    pub fn write_path(&mut self, path: &Path) -> &mut Self {
        self.write_str(&path.to_string_lossy())
    }

    /// Writes a fixed-width integer field.
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.inner.update(&value.to_le_bytes());
        self
    }

    /// Writes a nested hash field.
    pub fn write_hash(&mut self, hash: &ContentHash) -> &mut Self {
        self.inner.update(hash.as_bytes());
        self
    }

    /// Writes a count-prefixed list of string fields.
    pub fn write_strs<S: AsRef<str>>(&mut self, items: &[S]) -> &mut Self {
        self.write_u64(items.len() as u64);
        for item in items {
            self.write_str(item.as_ref());
        }
        self
    }

    /// Finishes hashing and returns the digest.
    pub fn finish(&self) -> ContentHash {
        ContentHash(self.inner.digest128().to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = ContentHash::from_bytes(b"hello world");
        let b = ContentHash::from_bytes(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn different_inputs_differ() {
        let a = ContentHash::from_bytes(b"hello");
        let b = ContentHash::from_bytes(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn display_parses_back() {
        let h = ContentHash::from_bytes(b"test");
        let s = h.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(ContentHash::from_hex(&s), Some(h));
        assert_eq!(h.short(), s[..12]);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(ContentHash::from_hex("abc").is_none());
        assert!(ContentHash::from_hex(&"zz".repeat(16)).is_none());
    }

    #[test]
    fn framing_prevents_concatenation_collisions() {
        let a = StableHasher::new("t").write_str("ab").write_str("c").finish();
        let b = StableHasher::new("t").write_str("a").write_str("bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn domain_separates_hashes() {
        let a = StableHasher::new("signature").write_str("x").finish();
        let b = StableHasher::new("cache-key").write_str("x").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn stable_hasher_is_repeatable() {
        let run = || {
            StableHasher::new("t")
                .write_strs(&["cc", "-c", "foo.c"])
                .write_u64(7)
                .finish()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn serde_roundtrip() {
        let h = ContentHash::from_bytes(b"serde test");
        let json = serde_json::to_string(&h).unwrap();
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }
}
