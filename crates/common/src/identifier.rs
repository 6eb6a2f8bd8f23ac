use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of bytes in a content hash.
pub const HASH_LEN: usize = 32;

/// Tags the hash algorithm that produced an identifier. A chunk
/// identifier hashes raw content bytes; a node identifier hashes the
/// ordered identifiers of an inner node's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum IdentifierKind {
    Chunk = 1,
    Node = 2,
}

impl IdentifierKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(IdentifierKind::Chunk),
            2 => Some(IdentifierKind::Node),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        *self as u8
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentifierError {
    #[error("malformed identifier: {0}")]
    MalformedIdentifier(String),
}

/// A typed content hash addressing either a chunk or an inner node in
/// the store.
///
/// The wire form is the lowercase hex of the hash bytes followed by a
/// two-digit hex algorithm tag, e.g. `..a3f401` for a chunk. Identity
/// is structural; ordering is a byte comparison over (hash, tag) and
/// fixes the global lock-acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentIdentifier {
    kind: IdentifierKind,
    hash: [u8; HASH_LEN],
}

impl ContentIdentifier {
    pub fn new(kind: IdentifierKind, hash: [u8; HASH_LEN]) -> Self {
        Self { kind, hash }
    }

    pub fn chunk(hash: [u8; HASH_LEN]) -> Self {
        Self::new(IdentifierKind::Chunk, hash)
    }

    pub fn node(hash: [u8; HASH_LEN]) -> Self {
        Self::new(IdentifierKind::Node, hash)
    }

    /// Hash raw chunk content into its chunk identifier.
    pub fn for_chunk_content(content: &[u8]) -> Self {
        Self::chunk(*blake3::hash(content).as_bytes())
    }

    pub fn kind(&self) -> IdentifierKind {
        self.kind
    }

    pub fn is_chunk(&self) -> bool {
        self.kind == IdentifierKind::Chunk
    }

    pub fn hash(&self) -> &[u8; HASH_LEN] {
        &self.hash
    }

    /// The 33 identifying bytes: hash followed by the algorithm tag.
    pub fn value(&self) -> [u8; HASH_LEN + 1] {
        let mut out = [0u8; HASH_LEN + 1];
        out[..HASH_LEN].copy_from_slice(&self.hash);
        out[HASH_LEN] = self.kind.tag();
        out
    }

    /// Wire string: lowercase hex of [`Self::value`].
    pub fn to_wire_string(&self) -> String {
        hex::encode(self.value())
    }

    /// Parse a wire-format string back into a typed identifier.
    pub fn parse(s: &str) -> Result<Self, IdentifierError> {
        let bytes = hex::decode(s)
            .map_err(|_| IdentifierError::MalformedIdentifier(format!("bad charset: {s}")))?;
        if bytes.len() != HASH_LEN + 1 {
            return Err(IdentifierError::MalformedIdentifier(format!(
                "bad length {}: {s}",
                bytes.len()
            )));
        }
        let kind = IdentifierKind::from_tag(bytes[HASH_LEN]).ok_or_else(|| {
            IdentifierError::MalformedIdentifier(format!("unknown algorithm {}", bytes[HASH_LEN]))
        })?;
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&bytes[..HASH_LEN]);
        Ok(Self { kind, hash })
    }
}

impl fmt::Display for ContentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire_string())
    }
}

// Byte order over (hash, tag), the deterministic lock order.
impl Ord for ContentIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.kind.tag().cmp(&other.kind.tag()))
    }
}

impl PartialOrd for ContentIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for ContentIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire_string())
    }
}

impl<'de> Deserialize<'de> for ContentIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentIdentifier::parse(&s).map_err(serde::de::Error::custom)
    }
}
