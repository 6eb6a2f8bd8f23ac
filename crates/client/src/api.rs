use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use common::identifier::ContentIdentifier;
use common::receipt::{KeepUntil, KeepUntilReceipt, SummaryKeepUntilReceipt};

/**
 * Store interface
 * ===============
 * The remote store is reached through the `DedupStore` trait so the
 *  engines stay independent of the transport. `PutNodeResponse` models
 *  the put-node protocol states as values; only genuine failures
 *  surface as `StoreError`.
 */

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Throttling, 5xx, broken connections. Safe to retry.
    #[error("transient store failure: {reason}")]
    Transient { reason: String },

    /// An unexpected status outside the protocol. Never retried.
    #[error("unexpected store status {code}")]
    Status { code: u16 },

    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

/// Outcome of a `put_node` call. Both arms are ordinary protocol
/// states, not errors.
#[derive(Debug, Clone)]
pub enum PutNodeResponse {
    /// The store accepted the node and now retains the whole subtree.
    Updated {
        receipts: HashMap<ContentIdentifier, KeepUntilReceipt>,
    },
    /// The store cannot accept the node until the listed children are
    /// uploaded or re-receipted. Receipts cover the children it does
    /// already retain.
    ChildrenNeedAction {
        missing: Vec<ContentIdentifier>,
        insufficient_keep_until: Vec<ContentIdentifier>,
        receipts: HashMap<ContentIdentifier, KeepUntilReceipt>,
    },
}

/// Chunk bytes as they travel on the wire: raw, or lz4-compressed when
/// that comes out smaller.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    bytes: Bytes,
    uncompressed_len: u64,
    compressed: bool,
}

impl ChunkPayload {
    /// Compress opportunistically and keep the smaller encoding.
    pub fn from_raw(raw: Bytes) -> Self {
        let uncompressed_len = raw.len() as u64;
        let compressed = lz4_flex::compress_prepend_size(&raw);
        if compressed.len() < raw.len() {
            Self {
                bytes: compressed.into(),
                uncompressed_len,
                compressed: true,
            }
        } else {
            Self {
                bytes: raw,
                uncompressed_len,
                compressed: false,
            }
        }
    }

    /// Wrap bytes received from the wire. `uncompressed_len` is present
    /// exactly when the payload is compressed.
    pub fn from_wire(bytes: Bytes, uncompressed_len: Option<u64>) -> Self {
        match uncompressed_len {
            Some(len) => Self {
                bytes,
                uncompressed_len: len,
                compressed: true,
            },
            None => Self {
                uncompressed_len: bytes.len() as u64,
                bytes,
                compressed: false,
            },
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn uncompressed_len(&self) -> u64 {
        self.uncompressed_len
    }

    /// Bytes as sent on the wire.
    pub fn wire_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn stored_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Recover the raw content, decompressing and validating the
    /// declared length.
    pub fn into_raw(self) -> Result<Bytes, StoreError> {
        if !self.compressed {
            return Ok(self.bytes);
        }
        let raw = lz4_flex::decompress_size_prepended(&self.bytes)
            .map_err(|e| StoreError::Malformed(format!("lz4 payload: {e}")))?;
        if raw.len() as u64 != self.uncompressed_len {
            return Err(StoreError::Malformed(format!(
                "decompressed to {} bytes, header declared {}",
                raw.len(),
                self.uncompressed_len
            )));
        }
        Ok(raw.into())
    }
}

/// A short-lived signed location for one blob.
#[derive(Debug, Clone)]
pub struct ResolvedBlob {
    pub id: ContentIdentifier,
    pub url: Url,
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Offer a node. The store answers `Updated` when it retains the
    /// whole subtree, or `ChildrenNeedAction` naming what it still
    /// needs. `summary` carries child receipts proving retention.
    async fn put_node(
        &self,
        id: ContentIdentifier,
        bytes: Bytes,
        keep_until: KeepUntil,
        summary: Option<SummaryKeepUntilReceipt>,
    ) -> Result<PutNodeResponse, StoreError>;

    /// Upload a batch of chunks, returning a receipt per chunk.
    async fn put_chunks(
        &self,
        page: Vec<(ContentIdentifier, ChunkPayload)>,
        keep_until: KeepUntil,
    ) -> Result<HashMap<ContentIdentifier, KeepUntilReceipt>, StoreError>;

    /// Fetch one blob's raw content. `None` when the store does not
    /// have it; absence is a normal outcome here.
    async fn get(&self, id: ContentIdentifier) -> Result<Option<Bytes>, StoreError>;

    /// Resolve a batch of identifiers to short-lived signed locations.
    /// Identifiers the store does not have are simply absent from the
    /// result.
    async fn resolve(
        &self,
        ids: &[ContentIdentifier],
    ) -> Result<HashMap<ContentIdentifier, ResolvedBlob>, StoreError>;

    /// Fetch a previously resolved blob.
    async fn fetch(&self, blob: &ResolvedBlob) -> Result<ChunkPayload, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_keeps_smaller_encoding() {
        // compressible content
        let raw = Bytes::from(vec![7u8; 4096]);
        let payload = ChunkPayload::from_raw(raw.clone());
        assert!(payload.is_compressed());
        assert!(payload.stored_len() < raw.len() as u64);
        assert_eq!(payload.uncompressed_len(), 4096);
        assert_eq!(payload.into_raw().unwrap(), raw);

        // incompressible content stays raw
        let raw = Bytes::from((0..64u8).map(|b| b.wrapping_mul(151)).collect::<Vec<u8>>());
        let payload = ChunkPayload::from_raw(raw.clone());
        assert_eq!(payload.uncompressed_len(), 64);
        assert_eq!(payload.into_raw().unwrap(), raw);
    }

    #[test]
    fn test_payload_rejects_length_lie() {
        let raw = Bytes::from(vec![7u8; 4096]);
        let compressed = ChunkPayload::from_raw(raw);
        assert!(compressed.is_compressed());
        let lied = ChunkPayload::from_wire(compressed.wire_bytes().clone(), Some(17));
        assert!(lied.into_raw().is_err());
    }
}
