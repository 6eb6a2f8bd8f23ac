use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;

use common::cancel::CancelToken;
use common::identifier::ContentIdentifier;
use common::lockset::LockSet;
use common::node::{MerkleNode, NodeError};
use common::receipt::{KeepUntil, KeepUntilReceipt, SummaryKeepUntilReceipt};

use crate::api::{ChunkPayload, DedupStore, PutNodeResponse};
use crate::chunker::FileDescriptor;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::retry::with_retries;

/**
 * Upload session
 * ==============
 * Walks a content tree top-down, offering each node to the store and
 *  resolving `ChildrenNeedAction` answers by uploading missing chunks
 *  and recursing into missing inner subtrees. Receipts learned along
 *  the way are cached so a subtree the store already retains is never
 *  walked twice, which is where dedup pays off.
 */

/// Where a chunk's bytes live on disk, for on-demand reads during
/// upload.
#[derive(Debug, Clone)]
pub struct ChunkSource {
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

/// Index every chunk of the hashed files by identifier. First writer
/// wins on duplicate identifiers; identical chunks have identical
/// content wherever they sit.
pub fn chunk_sources(descriptors: &[FileDescriptor]) -> HashMap<ContentIdentifier, ChunkSource> {
    let mut sources = HashMap::new();
    for descriptor in descriptors {
        let mut offset = 0u64;
        for leaf in descriptor.node.leaves() {
            let size = leaf.transitive_size();
            sources.entry(leaf.identifier()).or_insert_with(|| ChunkSource {
                path: descriptor.absolute_path.clone(),
                offset,
                size,
            });
            offset += size;
        }
    }
    sources
}

#[derive(Default)]
struct UploadCounters {
    logical_content_bytes: AtomicU64,
    content_bytes_uploaded: AtomicU64,
    physical_bytes_uploaded: AtomicU64,
    compression_bytes_saved: AtomicU64,
    chunks_uploaded: AtomicU64,
    nodes_uploaded: AtomicU64,
}

/// Point-in-time snapshot of the session counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadStatistics {
    pub logical_content_bytes: u64,
    /// Uncompressed chunk bytes actually sent.
    pub content_bytes_uploaded: u64,
    /// Wire bytes actually sent (chunks after compression, plus nodes).
    pub physical_bytes_uploaded: u64,
    pub compression_bytes_saved: u64,
    pub dedup_bytes_saved: u64,
    pub chunks_uploaded: u64,
    pub nodes_uploaded: u64,
}

pub struct UploadSession {
    store: Arc<dyn DedupStore>,
    config: ClientConfig,
    keep_until: KeepUntil,
    sources: HashMap<ContentIdentifier, ChunkSource>,
    receipts: DashMap<ContentIdentifier, KeepUntilReceipt>,
    nodes_seen: DashMap<ContentIdentifier, MerkleNode>,
    node_locks: LockSet<ContentIdentifier>,
    chunk_locks: LockSet<ContentIdentifier>,
    read_buffers: Arc<Semaphore>,
    network: Arc<Semaphore>,
    counters: UploadCounters,
    cancel: CancelToken,
}

impl UploadSession {
    pub fn new(
        store: Arc<dyn DedupStore>,
        config: ClientConfig,
        network: Arc<Semaphore>,
        keep_until: KeepUntil,
        sources: HashMap<ContentIdentifier, ChunkSource>,
        cancel: CancelToken,
    ) -> Self {
        let read_buffers = Arc::new(Semaphore::new(config.chunk_read_buffers));
        Self {
            store,
            config,
            keep_until,
            sources,
            receipts: DashMap::new(),
            nodes_seen: DashMap::new(),
            node_locks: LockSet::new(),
            chunk_locks: LockSet::new(),
            read_buffers,
            network,
            counters: UploadCounters::default(),
            cancel,
        }
    }

    /// Upload the tree rooted at `root` until the store retains every
    /// byte of it.
    pub async fn upload(&self, root: &MerkleNode) -> Result<()> {
        self.counters
            .logical_content_bytes
            .fetch_add(root.transitive_size(), Ordering::Relaxed);
        for node in root.inner_nodes() {
            self.nodes_seen.insert(node.identifier(), node.clone());
        }
        if root.is_leaf() {
            self.upload_chunks(&[root]).await
        } else {
            self.upload_node(root).await
        }
    }

    pub fn statistics(&self) -> UploadStatistics {
        let logical = self.counters.logical_content_bytes.load(Ordering::Relaxed);
        let content = self.counters.content_bytes_uploaded.load(Ordering::Relaxed);
        UploadStatistics {
            logical_content_bytes: logical,
            content_bytes_uploaded: content,
            physical_bytes_uploaded: self.counters.physical_bytes_uploaded.load(Ordering::Relaxed),
            compression_bytes_saved: self
                .counters
                .compression_bytes_saved
                .load(Ordering::Relaxed),
            dedup_bytes_saved: logical.saturating_sub(content),
            chunks_uploaded: self.counters.chunks_uploaded.load(Ordering::Relaxed),
            nodes_uploaded: self.counters.nodes_uploaded.load(Ordering::Relaxed),
        }
    }

    /// The receipt the store issued for `id`, if the session has seen
    /// one.
    pub fn receipt(&self, id: &ContentIdentifier) -> Option<KeepUntilReceipt> {
        self.receipts.get(id).map(|r| r.clone())
    }

    /// Consume the session into the parent-lookup index used for proof
    /// node construction. Built once, after the tree is final.
    pub fn into_proof_index(self) -> ProofIndex {
        ProofIndex::from_nodes(self.nodes_seen.into_iter().map(|(_, node)| node))
    }

    /// Race a pending wait against cancellation.
    async fn guarded<F: std::future::Future>(&self, fut: F) -> Result<F::Output> {
        self.cancel
            .run_until_cancelled(fut)
            .await
            .ok_or(ClientError::Cancelled)
    }

    fn upload_node<'a>(&'a self, node: &'a MerkleNode) -> BoxFuture<'a, Result<()>> {
        async move {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let id = node.identifier();
            if self.receipts.contains_key(&id) {
                return Ok(());
            }
            let children = node.children().ok_or(NodeError::UnfilledNode)?;
            let bytes = Bytes::from(node.serialize()?);

            // First offer, holding this node and its direct children in
            // one ordered lock set. Released before recursing.
            let needed = {
                let mut keys: Vec<_> = children.iter().map(|c| c.identifier()).collect();
                keys.push(id);
                let _locks = self.guarded(self.node_locks.acquire_all(keys)).await?;
                if self.receipts.contains_key(&id) {
                    return Ok(());
                }
                match self.put_node(id, bytes.clone(), None).await? {
                    PutNodeResponse::Updated { receipts } => {
                        self.finish_node(&bytes, receipts);
                        return Ok(());
                    }
                    PutNodeResponse::ChildrenNeedAction {
                        missing,
                        insufficient_keep_until,
                        receipts,
                    } => {
                        let known: HashSet<ContentIdentifier> =
                            children.iter().map(|c| c.identifier()).collect();
                        let needed: HashSet<ContentIdentifier> = missing
                            .into_iter()
                            .chain(insufficient_keep_until)
                            .collect();
                        if let Some(unknown) = needed.iter().find(|n| !known.contains(n)) {
                            return Err(ClientError::ProtocolViolation(format!(
                                "store wants {unknown}, which is not a child of {id}"
                            )));
                        }
                        // a child the store named needs a fresh upload
                        // even if an earlier answer receipted it; only
                        // the receipts outside the needed set are kept
                        for stale in &needed {
                            self.receipts.remove(stale);
                        }
                        self.absorb(
                            receipts
                                .into_iter()
                                .filter(|(rid, _)| !needed.contains(rid))
                                .collect(),
                        );
                        needed
                    }
                }
            };

            let mut chunk_children = Vec::new();
            let mut inner_children = Vec::new();
            for child in children {
                if !needed.contains(&child.identifier()) {
                    continue;
                }
                if child.is_leaf() {
                    chunk_children.push(child);
                } else {
                    inner_children.push(child);
                }
            }
            self.upload_chunks(&chunk_children).await?;
            futures::future::try_join_all(
                inner_children.iter().map(|child| self.upload_node(child)),
            )
            .await?;

            // Second offer with the children's receipts attached. The
            // store has everything it asked for, so a second
            // children-need-action answer means it is not honoring its
            // own protocol.
            let aligned: Vec<Option<KeepUntilReceipt>> = children
                .iter()
                .map(|c| self.receipt(&c.identifier()))
                .collect();
            let summary = SummaryKeepUntilReceipt::from_children(&aligned);

            let _lock = self.guarded(self.node_locks.acquire(id)).await?;
            if self.receipts.contains_key(&id) {
                return Ok(());
            }
            match self.put_node(id, bytes.clone(), summary).await? {
                PutNodeResponse::Updated { receipts } => {
                    self.finish_node(&bytes, receipts);
                    Ok(())
                }
                PutNodeResponse::ChildrenNeedAction { missing, .. } => {
                    Err(ClientError::ProtocolViolation(format!(
                        "store still reports {} children needing action for {id} after they were uploaded",
                        missing.len()
                    )))
                }
            }
        }
        .boxed()
    }

    /// Upload the given chunk leaves: sorted by identifier, paged, read
    /// on demand, receipted.
    async fn upload_chunks(&self, chunks: &[&MerkleNode]) -> Result<()> {
        let mut chunks: Vec<&MerkleNode> = chunks.to_vec();
        chunks.sort_by_key(|c| c.identifier());
        chunks.dedup_by_key(|c| c.identifier());

        for page in chunks.chunks(self.config.chunk_page_size) {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let _locks = self
                .guarded(
                    self.chunk_locks
                        .acquire_all(page.iter().map(|c| c.identifier())),
                )
                .await?;
            let pending: Vec<ContentIdentifier> = page
                .iter()
                .map(|c| c.identifier())
                .filter(|id| !self.receipts.contains_key(id))
                .collect();

            // A batch never asks for more read buffers than the
            // semaphore holds, and it takes them in one atomic grab, so
            // a holder can always finish and release.
            let batch_size = self
                .config
                .put_chunk_batch
                .min(self.config.chunk_read_buffers)
                .max(1);
            for batch in pending.chunks(batch_size) {
                let permits = self
                    .guarded(
                        self.read_buffers
                            .clone()
                            .acquire_many_owned(batch.len() as u32),
                    )
                    .await?
                    .map_err(|_| ClientError::Cancelled)?;

                let mut payloads = Vec::with_capacity(batch.len());
                let mut raw_total = 0u64;
                let mut stored_total = 0u64;
                for id in batch {
                    let raw = self.read_chunk(id).await?;
                    let payload = ChunkPayload::from_raw(raw);
                    raw_total += payload.uncompressed_len();
                    stored_total += payload.stored_len();
                    payloads.push((*id, payload));
                }

                let sent = payloads.len() as u64;
                let receipts = self.put_chunk_batch(payloads).await?;
                self.absorb(receipts);
                drop(permits);

                self.counters
                    .content_bytes_uploaded
                    .fetch_add(raw_total, Ordering::Relaxed);
                self.counters
                    .physical_bytes_uploaded
                    .fetch_add(stored_total, Ordering::Relaxed);
                self.counters
                    .compression_bytes_saved
                    .fetch_add(raw_total.saturating_sub(stored_total), Ordering::Relaxed);
                self.counters
                    .chunks_uploaded
                    .fetch_add(sent, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Read one chunk's bytes from its registered source and verify
    /// they still hash to its identifier.
    async fn read_chunk(&self, id: &ContentIdentifier) -> Result<Bytes> {
        let source = self.sources.get(id).ok_or_else(|| {
            ClientError::Usage(format!("no source registered for chunk {id}"))
        })?;
        if source.size == 0 {
            return Ok(Bytes::new());
        }
        let mut file = tokio::fs::File::open(&source.path).await?;
        file.seek(SeekFrom::Start(source.offset)).await?;
        let mut buf = vec![0u8; source.size as usize];
        file.read_exact(&mut buf).await?;

        let actual = ContentIdentifier::for_chunk_content(&buf);
        if actual != *id {
            return Err(ClientError::IdentifierMismatch {
                expected: *id,
                actual,
            });
        }
        Ok(buf.into())
    }

    async fn put_node(
        &self,
        id: ContentIdentifier,
        bytes: Bytes,
        summary: Option<SummaryKeepUntilReceipt>,
    ) -> Result<PutNodeResponse> {
        let _permit = self
            .guarded(self.network.acquire())
            .await?
            .map_err(|_| ClientError::Cancelled)?;
        tracing::debug!(node = %id, bytes = bytes.len(), "put_node");
        let response = self
            .guarded(with_retries("put_node", self.config.max_attempts, || {
                self.store
                    .put_node(id, bytes.clone(), self.keep_until, summary.clone())
            }))
            .await??;
        Ok(response)
    }

    async fn put_chunk_batch(
        &self,
        payloads: Vec<(ContentIdentifier, ChunkPayload)>,
    ) -> Result<HashMap<ContentIdentifier, KeepUntilReceipt>> {
        let _permit = self
            .guarded(self.network.acquire())
            .await?
            .map_err(|_| ClientError::Cancelled)?;
        tracing::debug!(chunks = payloads.len(), "put_chunks");
        let receipts = self
            .guarded(with_retries("put_chunks", self.config.max_attempts, || {
                self.store.put_chunks(payloads.clone(), self.keep_until)
            }))
            .await??;
        Ok(receipts)
    }

    fn finish_node(&self, bytes: &Bytes, receipts: HashMap<ContentIdentifier, KeepUntilReceipt>) {
        self.absorb(receipts);
        self.counters
            .physical_bytes_uploaded
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.counters.nodes_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    fn absorb(&self, receipts: HashMap<ContentIdentifier, KeepUntilReceipt>) {
        for (id, receipt) in receipts {
            self.receipts.insert(id, receipt);
        }
    }
}

/// Parent lookup over the final content tree, for building the chain
/// of nodes that proves a blob is covered by the uploaded root.
pub struct ProofIndex {
    nodes: HashMap<ContentIdentifier, MerkleNode>,
    parents: HashMap<ContentIdentifier, ContentIdentifier>,
}

impl ProofIndex {
    pub fn from_nodes<I: IntoIterator<Item = MerkleNode>>(nodes: I) -> Self {
        let nodes: HashMap<ContentIdentifier, MerkleNode> =
            nodes.into_iter().map(|n| (n.identifier(), n)).collect();
        let mut parents = HashMap::new();
        for (id, node) in &nodes {
            if let Some(children) = node.children() {
                for child in children {
                    parents.insert(child.identifier(), *id);
                }
            }
        }
        Self { nodes, parents }
    }

    /// The nodes on the path from `target` up to the root, nearest
    /// parent first.
    pub fn proof_nodes(&self, target: ContentIdentifier) -> Vec<&MerkleNode> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = target;
        while let Some(parent_id) = self.parents.get(&cursor) {
            if !seen.insert(*parent_id) {
                break;
            }
            if let Some(parent) = self.nodes.get(parent_id) {
                chain.push(parent);
            }
            cursor = *parent_id;
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::node::build_tree;

    #[test]
    fn test_proof_chain_reaches_root() {
        let leaves: Vec<_> = (0..600u16)
            .map(|i| MerkleNode::chunk_of(&i.to_le_bytes()))
            .collect();
        let target = leaves[3].identifier();
        let root = build_tree(leaves).unwrap();
        let index = ProofIndex::from_nodes(root.inner_nodes().cloned());

        let chain = index.proof_nodes(target);
        // page node, then the root
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.last().unwrap().identifier(), root.identifier());

        // the root itself has no parents
        assert!(index.proof_nodes(root.identifier()).is_empty());
    }

    #[test]
    fn test_chunk_sources_assign_running_offsets() {
        use crate::chunker::FileDescriptor;

        let leaves = vec![
            MerkleNode::chunk_of(&[1u8; 10]),
            MerkleNode::chunk_of(&[2u8; 20]),
            MerkleNode::chunk_of(&[3u8; 5]),
        ];
        let expected: Vec<_> = leaves.iter().map(|l| l.identifier()).collect();
        let descriptor = FileDescriptor {
            relative_path: "/f".into(),
            absolute_path: "/tmp/f".into(),
            node: build_tree(leaves).unwrap(),
        };
        let sources = chunk_sources(&[descriptor]);
        assert_eq!(sources[&expected[0]].offset, 0);
        assert_eq!(sources[&expected[1]].offset, 10);
        assert_eq!(sources[&expected[2]].offset, 30);
        assert_eq!(sources[&expected[2]].size, 5);
    }
}
