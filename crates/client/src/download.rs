use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use futures::TryStreamExt;
use tempfile::NamedTempFile;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};

use common::cancel::CancelToken;
use common::identifier::ContentIdentifier;
use common::lockset::LockSet;
use common::node::MerkleNode;

use crate::api::{DedupStore, ResolvedBlob};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::retry::with_retries;

/**
 * Download engine
 * ===============
 * Turns a content identifier back into file bytes: fetch the node,
 *  fill its tree, assign each leaf its byte range up front, then run a
 *  bounded fetch stage feeding a single serialized write stage. The
 *  file lands complete or not at all; the target path is only touched
 *  by the final atomic publish.
 */

/// Depth of the fetch-to-write channel. Fetched chunks queue here when
/// the writer falls behind, which is the backpressure bound on buffered
/// bytes beyond the in-flight fetches themselves.
const WRITE_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    /// The store does not have the requested top-level blob. A normal
    /// outcome; the caller decides whether that is an error.
    Absent,
}

/// One leaf's assigned byte range in the output file. Offsets are fixed
/// before any fetch starts, so writes can land in any order.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlacement {
    pub id: ContentIdentifier,
    pub offset: u64,
    pub size: u64,
}

/// A nearby chunk cache the engine can hand chunks to and ask to
/// materialize files from, skipping remote fetches for chunks it
/// already holds.
#[async_trait]
pub trait LocalChunkStore: Send + Sync {
    async fn available(&self) -> bool;

    /// Which of the given chunks the local store already holds.
    async fn existing_chunks(
        &self,
        ids: &[ContentIdentifier],
    ) -> Result<HashSet<ContentIdentifier>>;

    async fn put_chunk(&self, id: ContentIdentifier, content: Bytes) -> Result<()>;

    /// Write the planned spans into `target` from local chunks. Every
    /// chunk in the plan must have been inserted or reported existing.
    async fn materialize(&self, plan: &[ChunkPlacement], target: &Path) -> Result<()>;
}

#[derive(Default)]
struct DownloadCounters {
    chunks_downloaded: AtomicU64,
    nodes_downloaded: AtomicU64,
    content_bytes_downloaded: AtomicU64,
    physical_bytes_downloaded: AtomicU64,
    compression_bytes_saved: AtomicU64,
    dedup_bytes_saved: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadStatistics {
    pub chunks_downloaded: u64,
    pub nodes_downloaded: u64,
    /// Raw content bytes fetched from the remote store.
    pub content_bytes_downloaded: u64,
    /// Wire bytes fetched (after compression).
    pub physical_bytes_downloaded: u64,
    pub compression_bytes_saved: u64,
    /// Bytes served from a local chunk store instead of the network.
    pub dedup_bytes_saved: u64,
}

pub struct DownloadEngine {
    store: Arc<dyn DedupStore>,
    config: ClientConfig,
    network: Arc<Semaphore>,
    fills: LockSet<ContentIdentifier>,
    node_cache: DashMap<ContentIdentifier, MerkleNode>,
    counters: DownloadCounters,
    cancel: CancelToken,
}

impl DownloadEngine {
    pub fn new(
        store: Arc<dyn DedupStore>,
        config: ClientConfig,
        network: Arc<Semaphore>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            config,
            network,
            fills: LockSet::new(),
            node_cache: DashMap::new(),
            counters: DownloadCounters::default(),
            cancel,
        }
    }

    pub fn statistics(&self) -> DownloadStatistics {
        DownloadStatistics {
            chunks_downloaded: self.counters.chunks_downloaded.load(Ordering::Relaxed),
            nodes_downloaded: self.counters.nodes_downloaded.load(Ordering::Relaxed),
            content_bytes_downloaded: self
                .counters
                .content_bytes_downloaded
                .load(Ordering::Relaxed),
            physical_bytes_downloaded: self
                .counters
                .physical_bytes_downloaded
                .load(Ordering::Relaxed),
            compression_bytes_saved: self
                .counters
                .compression_bytes_saved
                .load(Ordering::Relaxed),
            dedup_bytes_saved: self.counters.dedup_bytes_saved.load(Ordering::Relaxed),
        }
    }

    /// Race a pending wait against cancellation.
    async fn guarded<F: std::future::Future>(&self, fut: F) -> Result<F::Output> {
        self.cancel
            .run_until_cancelled(fut)
            .await
            .ok_or(ClientError::Cancelled)
    }

    /// Recursively fetch and substitute every unfilled subtree of
    /// `node`, returning a fully filled clone. Each distinct subtree is
    /// fetched at most once; concurrent fills of the same identifier
    /// share the result.
    pub async fn fill_tree(&self, node: &MerkleNode) -> Result<MerkleNode> {
        self.fill(node.clone(), node.identifier()).await
    }

    fn fill<'a>(
        &'a self,
        node: MerkleNode,
        root: ContentIdentifier,
    ) -> BoxFuture<'a, Result<MerkleNode>> {
        async move {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            match node {
                leaf @ MerkleNode::ChunkLeaf { .. } => Ok(leaf),
                MerkleNode::InnerNode {
                    hash,
                    children: Some(children),
                    ..
                } => {
                    let filled = futures::future::try_join_all(
                        children.into_iter().map(|child| self.fill(child, root)),
                    )
                    .await?;
                    let rebuilt = MerkleNode::inner(filled);
                    if rebuilt.hash() != &hash {
                        return Err(ClientError::IdentifierMismatch {
                            expected: ContentIdentifier::node(hash),
                            actual: rebuilt.identifier(),
                        });
                    }
                    Ok(rebuilt)
                }
                MerkleNode::InnerNode {
                    hash,
                    children: None,
                    ..
                } => {
                    let id = ContentIdentifier::node(hash);
                    let _lock = self.guarded(self.fills.acquire(id)).await?;
                    if let Some(cached) = self.node_cache.get(&id) {
                        return Ok(cached.clone());
                    }
                    let fetched = self
                        .fetch_node(id)
                        .await?
                        .ok_or(ClientError::IncompleteTree { root, missing: id })?;
                    let filled = self.fill(fetched, root).await?;
                    self.node_cache.insert(id, filled.clone());
                    Ok(filled)
                }
            }
        }
        .boxed()
    }

    /// Materialize one blob into memory. Intended for small metadata
    /// blobs like manifests, not artifact content.
    pub async fn read_blob(&self, id: ContentIdentifier) -> Result<Option<Bytes>> {
        if id.is_chunk() {
            let Some(bytes) = self.get_raw(id).await? else {
                return Ok(None);
            };
            self.verify_chunk(id, &bytes, bytes.len() as u64)?;
            self.count_chunk(bytes.len() as u64, bytes.len() as u64);
            return Ok(Some(bytes));
        }

        let Some(node) = self.fetch_node(id).await? else {
            return Ok(None);
        };
        let filled = self.fill(node, id).await?;
        let mut out = Vec::with_capacity(filled.transitive_size() as usize);
        for leaf in filled.leaves() {
            let cid = leaf.identifier();
            let bytes = self
                .get_raw(cid)
                .await?
                .ok_or(ClientError::IncompleteTree {
                    root: id,
                    missing: cid,
                })?;
            self.verify_chunk(cid, &bytes, leaf.transitive_size())?;
            self.count_chunk(bytes.len() as u64, bytes.len() as u64);
            out.extend_from_slice(&bytes);
        }
        Ok(Some(out.into()))
    }

    /// Download one blob (chunk or node tree) to `path`. The declared
    /// size comes from the manifest and is enforced against the tree
    /// and against every fetched chunk.
    pub async fn download_to_file(
        &self,
        id: ContentIdentifier,
        path: &Path,
        declared_size: u64,
    ) -> Result<DownloadOutcome> {
        if id.is_chunk() {
            return self.download_chunk_to_file(id, path, declared_size).await;
        }

        let Some(node) = self.fetch_node(id).await? else {
            return Ok(DownloadOutcome::Absent);
        };
        let filled = self.fill(node, id).await?;
        if filled.transitive_size() != declared_size {
            return Err(ClientError::SizeMismatch {
                id,
                declared: declared_size,
                actual: filled.transitive_size(),
            });
        }

        let plan = placement_plan(&filled);
        let temp = self.presized_temp(path, declared_size)?;
        self.run_pipeline(id, &plan, &temp).await?;
        publish_temp(temp, path)?;
        Ok(DownloadOutcome::Completed)
    }

    /// Fast path through a local chunk store: fetch only the chunks it
    /// is missing, then let it materialize the file in one call. Falls
    /// back to the generic path when the local store is unavailable.
    pub async fn download_via_local_store(
        &self,
        local: &dyn LocalChunkStore,
        id: ContentIdentifier,
        path: &Path,
        declared_size: u64,
    ) -> Result<DownloadOutcome> {
        if !local.available().await {
            tracing::debug!(blob = %id, "local chunk store unavailable, using generic path");
            return self.download_to_file(id, path, declared_size).await;
        }

        let plan = match id.kind() {
            common::identifier::IdentifierKind::Chunk => vec![ChunkPlacement {
                id,
                offset: 0,
                size: declared_size,
            }],
            common::identifier::IdentifierKind::Node => {
                let Some(node) = self.fetch_node(id).await? else {
                    return Ok(DownloadOutcome::Absent);
                };
                let filled = self.fill(node, id).await?;
                if filled.transitive_size() != declared_size {
                    return Err(ClientError::SizeMismatch {
                        id,
                        declared: declared_size,
                        actual: filled.transitive_size(),
                    });
                }
                placement_plan(&filled)
            }
        };

        let unique: Vec<ContentIdentifier> = {
            let mut ids: Vec<_> = plan.iter().map(|p| p.id).collect();
            ids.sort();
            ids.dedup();
            ids
        };
        let existing = local.existing_chunks(&unique).await?;
        for placement in plan.iter().filter(|p| existing.contains(&p.id)) {
            self.counters
                .dedup_bytes_saved
                .fetch_add(placement.size, Ordering::Relaxed);
        }

        let missing: Vec<&ChunkPlacement> = {
            let mut seen = HashSet::new();
            plan.iter()
                .filter(|p| !existing.contains(&p.id) && p.size > 0 && seen.insert(p.id))
                .collect()
        };
        if !missing.is_empty() {
            let resolved = self
                .resolve_batches(missing.iter().map(|p| p.id).collect())
                .await?;
            for placement in missing {
                let blob = resolved
                    .get(&placement.id)
                    .ok_or(ClientError::IncompleteTree {
                        root: id,
                        missing: placement.id,
                    })?;
                let raw = self.fetch_chunk(blob, placement.id, placement.size).await?;
                local.put_chunk(placement.id, raw).await?;
            }
        }

        local.materialize(&plan, path).await?;
        Ok(DownloadOutcome::Completed)
    }

    async fn download_chunk_to_file(
        &self,
        id: ContentIdentifier,
        path: &Path,
        declared_size: u64,
    ) -> Result<DownloadOutcome> {
        let Some(bytes) = self.get_raw(id).await? else {
            return Ok(DownloadOutcome::Absent);
        };
        self.verify_chunk(id, &bytes, declared_size)?;
        self.count_chunk(bytes.len() as u64, bytes.len() as u64);

        let temp = self.presized_temp(path, declared_size)?;
        std::io::Write::write_all(&mut temp.as_file(), &bytes)?;
        publish_temp(temp, path)?;
        Ok(DownloadOutcome::Completed)
    }

    /// The two-stage pipeline: a bounded fetch stage validating each
    /// chunk, and one writer task placing bytes at precomputed offsets.
    async fn run_pipeline(
        &self,
        root: ContentIdentifier,
        plan: &[ChunkPlacement],
        temp: &NamedTempFile,
    ) -> Result<()> {
        let to_fetch: Vec<ChunkPlacement> = plan.iter().filter(|p| p.size > 0).copied().collect();
        let resolved = self
            .resolve_batches({
                let mut ids: Vec<_> = to_fetch.iter().map(|p| p.id).collect();
                ids.sort();
                ids.dedup();
                ids
            })
            .await?;

        let (tx, mut rx) = mpsc::channel::<(u64, Bytes)>(WRITE_QUEUE_DEPTH);
        let mut file = tokio::fs::File::from_std(temp.reopen()?);
        let writer = tokio::spawn(async move {
            while let Some((offset, bytes)) = rx.recv().await {
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(&bytes).await?;
            }
            file.flush().await?;
            std::io::Result::Ok(())
        });

        let fetch_result = futures::stream::iter(to_fetch.into_iter().map(Ok::<_, ClientError>))
            .try_for_each_concurrent(self.config.max_parallelism, |placement| {
                let tx = tx.clone();
                let resolved = resolved.get(&placement.id).cloned();
                async move {
                    let blob = resolved.ok_or(ClientError::IncompleteTree {
                        root,
                        missing: placement.id,
                    })?;
                    let raw = self.fetch_chunk(&blob, placement.id, placement.size).await?;
                    self.guarded(tx.send((placement.offset, raw)))
                        .await?
                        .map_err(|_| ClientError::Cancelled)
                }
            })
            .await;
        drop(tx);

        let write_result = writer
            .await
            .map_err(|e| ClientError::Default(anyhow::anyhow!(e)))?;
        write_result?;
        fetch_result
    }

    async fn fetch_chunk(
        &self,
        blob: &ResolvedBlob,
        id: ContentIdentifier,
        expected_size: u64,
    ) -> Result<Bytes> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let _permit = self
            .guarded(self.network.acquire())
            .await?
            .map_err(|_| ClientError::Cancelled)?;
        let payload = self
            .guarded(with_retries("fetch", self.config.max_attempts, || {
                self.store.fetch(blob)
            }))
            .await??;
        let wire_len = payload.stored_len();
        let raw = payload.into_raw().map_err(ClientError::Store)?;
        self.verify_chunk(id, &raw, expected_size)?;
        self.count_chunk(raw.len() as u64, wire_len);
        Ok(raw)
    }

    async fn fetch_node(&self, id: ContentIdentifier) -> Result<Option<MerkleNode>> {
        let Some(bytes) = self.get_raw(id).await? else {
            return Ok(None);
        };
        let node = MerkleNode::deserialize(&bytes)?;
        if node.identifier() != id {
            return Err(ClientError::IdentifierMismatch {
                expected: id,
                actual: node.identifier(),
            });
        }
        self.counters
            .nodes_downloaded
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .physical_bytes_downloaded
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(Some(node))
    }

    async fn get_raw(&self, id: ContentIdentifier) -> Result<Option<Bytes>> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let _permit = self
            .guarded(self.network.acquire())
            .await?
            .map_err(|_| ClientError::Cancelled)?;
        let bytes = self
            .guarded(with_retries("get", self.config.max_attempts, || {
                self.store.get(id)
            }))
            .await??;
        Ok(bytes)
    }

    async fn resolve_batches(
        &self,
        ids: Vec<ContentIdentifier>,
    ) -> Result<HashMap<ContentIdentifier, ResolvedBlob>> {
        let mut out = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(self.config.resolve_batch) {
            let _permit = self
                .guarded(self.network.acquire())
                .await?
                .map_err(|_| ClientError::Cancelled)?;
            let resolved = self
                .guarded(with_retries("resolve", self.config.max_attempts, || {
                    self.store.resolve(batch)
                }))
                .await??;
            out.extend(resolved);
        }
        Ok(out)
    }

    fn presized_temp(&self, path: &Path, size: u64) -> Result<NamedTempFile> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        let temp = match parent {
            Some(parent) => NamedTempFile::new_in(parent)?,
            None => NamedTempFile::new()?,
        };
        temp.as_file().set_len(size)?;
        if !self.config.sparse_files {
            zero_fill(temp.as_file(), size)?;
        }
        Ok(temp)
    }

    fn verify_chunk(&self, id: ContentIdentifier, raw: &[u8], expected_size: u64) -> Result<()> {
        if raw.len() as u64 != expected_size {
            return Err(ClientError::SizeMismatch {
                id,
                declared: expected_size,
                actual: raw.len() as u64,
            });
        }
        let actual = ContentIdentifier::for_chunk_content(raw);
        if actual != id {
            return Err(ClientError::IdentifierMismatch {
                expected: id,
                actual,
            });
        }
        Ok(())
    }

    fn count_chunk(&self, raw_len: u64, wire_len: u64) {
        self.counters
            .chunks_downloaded
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .content_bytes_downloaded
            .fetch_add(raw_len, Ordering::Relaxed);
        self.counters
            .physical_bytes_downloaded
            .fetch_add(wire_len, Ordering::Relaxed);
        self.counters
            .compression_bytes_saved
            .fetch_add(raw_len.saturating_sub(wire_len), Ordering::Relaxed);
    }
}

/// Assign each leaf its byte range, left to right.
pub fn placement_plan(root: &MerkleNode) -> Vec<ChunkPlacement> {
    let mut plan = Vec::new();
    let mut offset = 0u64;
    for leaf in root.leaves() {
        let size = leaf.transitive_size();
        plan.push(ChunkPlacement {
            id: leaf.identifier(),
            offset,
            size,
        });
        offset += size;
    }
    plan
}

/// Write zeros across the pre-sized range so the target is fully
/// allocated rather than a hole.
fn zero_fill(file: &std::fs::File, size: u64) -> std::io::Result<()> {
    use std::io::{Seek, Write};

    let mut file = file;
    file.seek(SeekFrom::Start(0))?;
    let zeros = [0u8; 8192];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    file.seek(SeekFrom::Start(0))?;
    file.flush()
}

/// Move the finished temp file into place: hard link when possible
/// (replacing an existing target), rename otherwise.
fn publish_temp(temp: NamedTempFile, target: &Path) -> Result<()> {
    let linked = match std::fs::hard_link(temp.path(), target) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            std::fs::remove_file(target)?;
            std::fs::hard_link(temp.path(), target)?;
            true
        }
        Err(_) => false,
    };
    if linked {
        if let Err(e) = temp.close() {
            tracing::warn!(error = %e, "failed to remove download temp file");
        }
        return Ok(());
    }
    temp.persist(target).map_err(|e| ClientError::Io(e.error))?;
    Ok(())
}
