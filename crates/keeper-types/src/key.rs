use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Number of raw digest bytes in a [`Key`].
pub const KEY_LEN: usize = 32;

/// Number of hex characters in the textual form of a [`Key`].
pub const KEY_HEX_LEN: usize = KEY_LEN * 2;

/// Content-derived identifier for a stored value.
///
/// A `Key` is the BLAKE3 digest of a value's data followed by its serialized
/// metadata. Identical (data, metadata) pairs always produce the same key,
/// which is what makes values deduplicatable. The textual form is always
/// [`KEY_HEX_LEN`] lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Derive the key for a complete value in one shot.
    pub fn derive(data: &[u8], serialized_meta: &[u8]) -> Self {
        let mut hasher = KeyHasher::new();
        hasher.update(data);
        hasher.update(serialized_meta);
        hasher.finalize()
    }

    /// Create a `Key` from a pre-computed digest.
    pub fn from_digest(digest: [u8; KEY_LEN]) -> Self {
        Self(digest)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a lowercase hex string of exactly [`KEY_HEX_LEN`] characters.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.len() != KEY_HEX_LEN {
            return Err(TypeError::InvalidLength {
                expected: KEY_HEX_LEN,
                actual: s.len(),
            });
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(TypeError::NotLowercase);
        }
        let mut arr = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut arr).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.short_hex())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Key {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_hex()
    }
}

impl TryFrom<String> for Key {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

/// Incremental key derivation.
///
/// Feed the data bytes (in any number of chunks) and then the serialized
/// metadata; the result equals [`Key::derive`] over the concatenation.
#[derive(Clone, Default)]
pub struct KeyHasher {
    hasher: blake3::Hasher,
}

impl KeyHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    pub fn finalize(&self) -> Key {
        Key(*self.hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn derive_is_deterministic() {
        let k1 = Key::derive(b"hello world", b"{}");
        let k2 = Key::derive(b"hello world", b"{}");
        assert_eq!(k1, k2);
    }

    #[test]
    fn meta_bytes_change_the_key() {
        let k1 = Key::derive(b"data", b"{\"mime\":null}");
        let k2 = Key::derive(b"data", b"{\"mime\":\"text/plain\"}");
        assert_ne!(k1, k2);
    }

    #[test]
    fn hex_roundtrip() {
        let key = Key::derive(b"test", b"");
        let parsed = Key::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn display_is_full_lowercase_hex() {
        let key = Key::derive(b"test", b"");
        let display = format!("{key}");
        assert_eq!(display.len(), KEY_HEX_LEN);
        assert!(display.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    }

    #[test]
    fn short_hex_is_8_chars() {
        assert_eq!(Key::derive(b"x", b"").short_hex().len(), 8);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        let err = Key::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: KEY_HEX_LEN,
                actual: 4
            }
        );
    }

    #[test]
    fn from_hex_rejects_uppercase() {
        let upper = Key::derive(b"x", b"").to_hex().to_uppercase();
        assert_eq!(Key::from_hex(&upper).unwrap_err(), TypeError::NotLowercase);
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        let bad = "z".repeat(KEY_HEX_LEN);
        assert!(matches!(Key::from_hex(&bad), Err(TypeError::InvalidHex(_))));
    }

    #[test]
    fn serde_uses_hex_string() {
        let key = Key::derive(b"serde", b"");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let parsed: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(key, parsed);
    }

    proptest! {
        #[test]
        fn chunked_hashing_matches_one_shot(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            meta in proptest::collection::vec(any::<u8>(), 0..64),
            split in 0usize..2048,
        ) {
            let split = split.min(data.len());
            let mut hasher = KeyHasher::new();
            hasher.update(&data[..split]).update(&data[split..]).update(&meta);
            prop_assert_eq!(hasher.finalize(), Key::derive(&data, &meta));
        }
    }
}
