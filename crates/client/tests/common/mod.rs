//! Shared in-memory store for client integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::result::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use url::Url;

use client::prelude::*;
use common::cancel::CancelToken;
use common::identifier::ContentIdentifier;
use common::node::MerkleNode;
use common::receipt::{KeepUntil, KeepUntilReceipt, SummaryKeepUntilReceipt};

/// Route tracing output through the capturing test writer. Safe to call
/// from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn keep_until() -> KeepUntil {
    KeepUntil::after(Duration::from_secs(3600))
}

/// A faithful in-memory `DedupStore`: nodes are only accepted once
/// every child is receipted, chunks are verified against their
/// identifiers, receipts persist across sessions.
#[derive(Default)]
pub struct MemoryDedupStore {
    blobs: Mutex<HashMap<ContentIdentifier, Bytes>>,
    receipts: Mutex<HashMap<ContentIdentifier, KeepUntilReceipt>>,
    pub put_node_calls: AtomicUsize,
    pub chunks_received: AtomicUsize,
}

impl MemoryDedupStore {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(Self::default())
    }

    fn receipt_for(stamp: KeepUntil, id: &ContentIdentifier) -> KeepUntilReceipt {
        KeepUntilReceipt {
            keep_until: stamp,
            signature: format!("sig-{id}"),
        }
    }

    /// Seed a chunk as already stored and receipted.
    pub fn seed_chunk(&self, content: &[u8]) -> ContentIdentifier {
        let id = ContentIdentifier::for_chunk_content(content);
        self.blobs.lock().insert(id, Bytes::copy_from_slice(content));
        self.receipts
            .lock()
            .insert(id, Self::receipt_for(keep_until(), &id));
        id
    }

    /// Seed a (filled) node as already stored and receipted.
    pub fn seed_node(&self, node: &MerkleNode) -> ContentIdentifier {
        let id = node.identifier();
        self.blobs
            .lock()
            .insert(id, node.serialize().expect("filled node").into());
        self.receipts
            .lock()
            .insert(id, Self::receipt_for(keep_until(), &id));
        id
    }

    pub fn has_blob(&self, id: &ContentIdentifier) -> bool {
        self.blobs.lock().contains_key(id)
    }

    /// Drop a blob's bytes while keeping its receipt, simulating a
    /// store that declares content it cannot produce.
    pub fn forget_blob(&self, id: &ContentIdentifier) {
        self.blobs.lock().remove(id);
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn put_node(
        &self,
        id: ContentIdentifier,
        bytes: Bytes,
        keep_until: KeepUntil,
        _summary: Option<SummaryKeepUntilReceipt>,
    ) -> Result<PutNodeResponse, StoreError> {
        self.put_node_calls.fetch_add(1, Ordering::SeqCst);
        let node =
            MerkleNode::deserialize(&bytes).map_err(|e| StoreError::Malformed(e.to_string()))?;
        if node.identifier() != id {
            return Err(StoreError::Malformed(format!(
                "body hashes to {}, not {id}",
                node.identifier()
            )));
        }

        let held = self.receipts.lock().clone();
        let mut missing = Vec::new();
        let mut known = HashMap::new();
        for child in node.children().unwrap_or(&[]) {
            let cid = child.identifier();
            match held.get(&cid) {
                Some(receipt) => {
                    known.insert(cid, receipt.clone());
                }
                None => missing.push(cid),
            }
        }
        if !missing.is_empty() {
            return Ok(PutNodeResponse::ChildrenNeedAction {
                missing,
                insufficient_keep_until: Vec::new(),
                receipts: known,
            });
        }

        self.blobs.lock().insert(id, bytes);
        let receipt = Self::receipt_for(keep_until, &id);
        self.receipts.lock().insert(id, receipt.clone());
        known.insert(id, receipt);
        Ok(PutNodeResponse::Updated { receipts: known })
    }

    async fn put_chunks(
        &self,
        page: Vec<(ContentIdentifier, ChunkPayload)>,
        keep_until: KeepUntil,
    ) -> Result<HashMap<ContentIdentifier, KeepUntilReceipt>, StoreError> {
        let mut out = HashMap::new();
        for (id, payload) in page {
            let raw = payload.into_raw()?;
            if ContentIdentifier::for_chunk_content(&raw) != id {
                return Err(StoreError::Malformed(format!(
                    "chunk bytes do not hash to {id}"
                )));
            }
            self.chunks_received.fetch_add(1, Ordering::SeqCst);
            self.blobs.lock().insert(id, raw);
            let receipt = Self::receipt_for(keep_until, &id);
            self.receipts.lock().insert(id, receipt.clone());
            out.insert(id, receipt);
        }
        Ok(out)
    }

    async fn get(&self, id: ContentIdentifier) -> Result<Option<Bytes>, StoreError> {
        Ok(self.blobs.lock().get(&id).cloned())
    }

    async fn resolve(
        &self,
        ids: &[ContentIdentifier],
    ) -> Result<HashMap<ContentIdentifier, ResolvedBlob>, StoreError> {
        let blobs = self.blobs.lock();
        Ok(ids
            .iter()
            .filter(|id| blobs.contains_key(id))
            .map(|id| {
                let url = Url::parse(&format!("memory://store/{id}")).expect("static url shape");
                (*id, ResolvedBlob { id: *id, url })
            })
            .collect())
    }

    async fn fetch(&self, blob: &ResolvedBlob) -> Result<ChunkPayload, StoreError> {
        let bytes = self
            .blobs
            .lock()
            .get(&blob.id)
            .cloned()
            .ok_or(StoreError::Status { code: 404 })?;
        Ok(ChunkPayload::from_raw(bytes))
    }
}

pub fn upload_session(
    store: Arc<MemoryDedupStore>,
    sources: HashMap<ContentIdentifier, ChunkSource>,
) -> UploadSession {
    UploadSession::new(
        store,
        ClientConfig::default(),
        Arc::new(Semaphore::new(8)),
        keep_until(),
        sources,
        CancelToken::new(),
    )
}

pub fn download_engine(store: Arc<MemoryDedupStore>) -> DownloadEngine {
    download_engine_with(store, ClientConfig::default())
}

pub fn download_engine_with(store: Arc<MemoryDedupStore>, config: ClientConfig) -> DownloadEngine {
    DownloadEngine::new(store, config, Arc::new(Semaphore::new(8)), CancelToken::new())
}

/// An in-memory `LocalChunkStore` with a switchable availability flag.
#[derive(Default)]
pub struct MemoryChunkStore {
    available: AtomicBool,
    chunks: Mutex<HashMap<ContentIdentifier, Bytes>>,
    pub puts: AtomicUsize,
    pub materialize_calls: AtomicUsize,
}

impl MemoryChunkStore {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
            ..Self::default()
        }
    }

    /// Pre-populate the local cache with a chunk.
    pub fn seed(&self, content: &[u8]) -> ContentIdentifier {
        let id = ContentIdentifier::for_chunk_content(content);
        self.chunks.lock().insert(id, Bytes::copy_from_slice(content));
        id
    }
}

#[async_trait]
impl LocalChunkStore for MemoryChunkStore {
    async fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn existing_chunks(
        &self,
        ids: &[ContentIdentifier],
    ) -> Result<HashSet<ContentIdentifier>, ClientError> {
        let chunks = self.chunks.lock();
        Ok(ids
            .iter()
            .filter(|id| chunks.contains_key(id))
            .copied()
            .collect())
    }

    async fn put_chunk(&self, id: ContentIdentifier, content: Bytes) -> Result<(), ClientError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.chunks.lock().insert(id, content);
        Ok(())
    }

    async fn materialize(&self, plan: &[ChunkPlacement], target: &Path) -> Result<(), ClientError> {
        self.materialize_calls.fetch_add(1, Ordering::SeqCst);
        let chunks = self.chunks.lock();
        let mut file = std::fs::File::create(target)?;
        for placement in plan {
            if placement.size == 0 {
                continue;
            }
            let bytes = chunks.get(&placement.id).ok_or_else(|| {
                ClientError::Usage(format!("chunk {} not in the local store", placement.id))
            })?;
            file.seek(SeekFrom::Start(placement.offset))?;
            file.write_all(bytes)?;
        }
        Ok(())
    }
}
