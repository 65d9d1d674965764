//! Deterministic content hashing for kiln stage signatures.
//!
//! The hash is the single signature primitive used throughout kiln; it is
//! the caller's duty to supply a canonical ordering of parts. Each part is
//! length-prefixed before hashing so that `hash(["ab", "c"])` and
//! `hash(["a", "bc"])` never collide.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// A 256-bit content digest, rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest256([u8; 32]);

impl Serialize for Digest256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Digest256 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Digest256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest256({})", hex::encode(self.0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseDigestError {
    #[error("digest must be 64 hex characters, got {0}")]
    WrongLength(usize),
    #[error("invalid hex in digest: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl FromStr for Digest256 {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ParseDigestError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Digest256(bytes))
    }
}

/// Hash an ordered sequence of string parts into a content signature.
///
/// Empty input hashes to the digest of the empty byte stream.
pub fn hash<I, S>(parts: I) -> Digest256
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    let out = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&out);
    Digest256(digest)
}

/// Hash a predecessor signature together with a dependency vector:
/// `hash([predecessor, ...vector])`.
pub fn chain<'a>(predecessor: &Digest256, vector: impl IntoIterator<Item = &'a str>) -> Digest256 {
    let pred = predecessor.to_string();
    let parts: Vec<String> = std::iter::once(pred)
        .chain(vector.into_iter().map(str::to_string))
        .collect();
    hash(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_stable() {
        let a = hash(Vec::<&str>::new());
        let b = hash(Vec::<&str>::new());
        assert_eq!(a, b);
    }

    #[test]
    fn length_prefixing_prevents_concatenation_collisions() {
        let a = hash(["ab", "c"]);
        let b = hash(["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn order_is_significant() {
        let a = hash(["x", "y"]);
        let b = hash(["y", "x"]);
        assert_ne!(a, b);
    }

    #[test]
    fn display_round_trips_through_from_str() {
        let d = hash(["one", "two"]);
        let text = d.to_string();
        let parsed: Digest256 = text.parse().expect("parse digest");
        assert_eq!(parsed, d);
    }

    #[test]
    fn serde_round_trips_as_hex_string() {
        let d = hash(["one", "two"]);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{d}\""));
        let parsed: Digest256 = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn from_str_rejects_short_input() {
        let err = "abcd".parse::<Digest256>().unwrap_err();
        assert!(matches!(err, ParseDigestError::WrongLength(4)));
    }

    #[test]
    fn chain_changes_when_predecessor_changes() {
        let root_a = hash(Vec::<&str>::new());
        let root_b = hash(["seed"]);
        let a = chain(&root_a, ["dep"]);
        let b = chain(&root_b, ["dep"]);
        assert_ne!(a, b);
    }

    proptest::proptest! {
        #[test]
        fn hash_is_deterministic(parts in proptest::collection::vec("[a-z0-9]{0,12}", 0..8)) {
            let a = hash(parts.iter());
            let b = hash(parts.iter());
            proptest::prop_assert_eq!(a, b);
        }

        #[test]
        fn single_byte_mutation_changes_digest(parts in proptest::collection::vec("[a-z]{1,12}", 1..6), idx in 0usize..6) {
            if idx < parts.len() {
                let original = hash(parts.iter());
                let mut mutated = parts.clone();
                let mut chars: Vec<char> = mutated[idx].chars().collect();
                if !chars.is_empty() {
                    chars[0] = if chars[0] == 'a' { 'b' } else { 'a' };
                    mutated[idx] = chars.into_iter().collect();
                    let changed = hash(mutated.iter());
                    proptest::prop_assert_ne!(original, changed);
                }
            }
        }
    }
}
