//! Integration tests for the download engine against an in-memory store

mod common;

use std::collections::HashMap;
use std::result::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use ::common::cancel::CancelToken;
use ::common::identifier::ContentIdentifier;
use ::common::node::{build_tree, MerkleNode};
use ::common::receipt::{KeepUntil, KeepUntilReceipt, SummaryKeepUntilReceipt};
use client::prelude::*;

use common::{MemoryChunkStore, MemoryDedupStore};

#[tokio::test]
async fn test_chunks_land_at_their_assigned_ranges() {
    let store = MemoryDedupStore::new();
    let parts: [&[u8]; 3] = [&[1u8; 10], &[2u8; 20], &[3u8; 5]];
    let leaves: Vec<MerkleNode> = parts
        .iter()
        .map(|content| {
            store.seed_chunk(content);
            MerkleNode::chunk_of(content)
        })
        .collect();
    let root = build_tree(leaves).unwrap();
    store.seed_node(&root);

    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("out.bin");
    let engine = common::download_engine(store);
    let outcome = engine
        .download_to_file(root.identifier(), &path, 35)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), 35);
    assert_eq!(&written[0..10], &[1u8; 10]);
    assert_eq!(&written[10..30], &[2u8; 20]);
    assert_eq!(&written[30..35], &[3u8; 5]);

    let stats = engine.statistics();
    assert_eq!(stats.chunks_downloaded, 3);
    assert_eq!(stats.nodes_downloaded, 1);
    assert_eq!(stats.content_bytes_downloaded, 35);
}

#[tokio::test]
async fn test_absent_top_level_blob_is_not_an_error() {
    let store = MemoryDedupStore::new();
    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("missing.bin");

    let engine = common::download_engine(store);
    let outcome = engine
        .download_to_file(ContentIdentifier::node([9u8; 32]), &path, 100)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Absent);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_missing_chunk_inside_declared_tree_is_fatal() {
    let store = MemoryDedupStore::new();
    let parts: [&[u8]; 3] = [&[1u8; 4], &[2u8; 4], &[3u8; 4]];
    let leaves: Vec<MerkleNode> = parts
        .iter()
        .map(|content| {
            store.seed_chunk(content);
            MerkleNode::chunk_of(content)
        })
        .collect();
    let dropped = leaves[1].identifier();
    let root = build_tree(leaves).unwrap();
    store.seed_node(&root);
    store.forget_blob(&dropped);

    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("out.bin");
    let engine = common::download_engine(store);
    let err = engine
        .download_to_file(root.identifier(), &path, 12)
        .await
        .unwrap_err();
    match err {
        ClientError::IncompleteTree { missing, .. } => assert_eq!(missing, dropped),
        other => panic!("expected IncompleteTree, got {other}"),
    }
    assert!(!path.exists());
}

#[tokio::test]
async fn test_declared_size_is_enforced() {
    let store = MemoryDedupStore::new();
    store.seed_chunk(b"eight by");
    let leaf = MerkleNode::chunk_of(b"eight by");
    let root = build_tree(vec![leaf, MerkleNode::chunk_of(b"missing!")]).unwrap();
    store.seed_chunk(b"missing!");
    store.seed_node(&root);

    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("out.bin");
    let engine = common::download_engine(store);
    let err = engine
        .download_to_file(root.identifier(), &path, 99)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::SizeMismatch { declared: 99, .. }));
}

#[tokio::test]
async fn test_multi_level_tree_is_filled_and_materialized() {
    let store = MemoryDedupStore::new();
    let leaves: Vec<MerkleNode> = (0..600u16)
        .map(|i| {
            let content = i.to_le_bytes();
            store.seed_chunk(&content);
            MerkleNode::chunk_of(&content)
        })
        .collect();
    let root = build_tree(leaves).unwrap();
    // deep trees require every page node, not just the root
    for inner in root.inner_nodes() {
        store.seed_node(inner);
    }

    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("deep.bin");
    let engine = common::download_engine(store);
    let outcome = engine
        .download_to_file(root.identifier(), &path, 1200)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), 1200);
    for (i, pair) in written.chunks(2).enumerate() {
        assert_eq!(pair, &(i as u16).to_le_bytes()[..]);
    }
}

#[tokio::test]
async fn test_existing_target_is_replaced() {
    let store = MemoryDedupStore::new();
    store.seed_chunk(b"fresh content");
    let leaf = MerkleNode::chunk_of(b"fresh content");

    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("out.txt");
    std::fs::write(&path, b"stale bytes that must disappear").unwrap();

    let engine = common::download_engine(store);
    let outcome = engine
        .download_to_file(leaf.identifier(), &path, 13)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(std::fs::read(&path).unwrap(), b"fresh content");
}

#[tokio::test]
async fn test_local_store_skips_chunks_it_already_holds() {
    let store = MemoryDedupStore::new();
    let parts: [&[u8]; 3] = [&[1u8; 8], &[2u8; 8], &[3u8; 8]];
    let leaves: Vec<MerkleNode> = parts
        .iter()
        .map(|content| {
            store.seed_chunk(content);
            MerkleNode::chunk_of(content)
        })
        .collect();
    let root = build_tree(leaves).unwrap();
    store.seed_node(&root);

    let local = MemoryChunkStore::new(true);
    local.seed(&[2u8; 8]);

    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("out.bin");
    let engine = common::download_engine(store);
    let outcome = engine
        .download_via_local_store(&local, root.identifier(), &path, 24)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);

    let written = std::fs::read(&path).unwrap();
    assert_eq!(&written[0..8], &[1u8; 8]);
    assert_eq!(&written[8..16], &[2u8; 8]);
    assert_eq!(&written[16..24], &[3u8; 8]);

    // only the two misses were fetched and inserted
    assert_eq!(local.puts.load(Ordering::SeqCst), 2);
    assert_eq!(local.materialize_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.statistics().dedup_bytes_saved, 8);
}

#[tokio::test]
async fn test_unavailable_local_store_falls_back_to_generic_path() {
    let store = MemoryDedupStore::new();
    store.seed_chunk(b"fallback content");
    let leaf = MerkleNode::chunk_of(b"fallback content");

    let local = MemoryChunkStore::new(false);
    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("out.bin");
    let engine = common::download_engine(store);
    let outcome = engine
        .download_via_local_store(&local, leaf.identifier(), &path, 16)
        .await
        .unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(std::fs::read(&path).unwrap(), b"fallback content");
    assert_eq!(local.puts.load(Ordering::SeqCst), 0);
    assert_eq!(local.materialize_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_zero_filled_targets_match_sparse_output() {
    let store = MemoryDedupStore::new();
    let parts: [&[u8]; 2] = [&[4u8; 8], &[5u8; 8]];
    let leaves: Vec<MerkleNode> = parts
        .iter()
        .map(|content| {
            store.seed_chunk(content);
            MerkleNode::chunk_of(content)
        })
        .collect();
    let root = build_tree(leaves).unwrap();
    store.seed_node(&root);

    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("dense.bin");
    let engine = common::download_engine_with(
        store,
        ClientConfig {
            sparse_files: false,
            ..ClientConfig::default()
        },
    );
    engine
        .download_to_file(root.identifier(), &path, 16)
        .await
        .unwrap();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), 16);
    assert_eq!(&written[0..8], &[4u8; 8]);
    assert_eq!(&written[8..16], &[5u8; 8]);
}

/// A store whose signed-URL fetches never finish.
struct StalledStore {
    inner: Arc<MemoryDedupStore>,
}

#[async_trait]
impl DedupStore for StalledStore {
    async fn put_node(
        &self,
        id: ContentIdentifier,
        bytes: Bytes,
        keep_until: KeepUntil,
        summary: Option<SummaryKeepUntilReceipt>,
    ) -> Result<PutNodeResponse, StoreError> {
        self.inner.put_node(id, bytes, keep_until, summary).await
    }

    async fn put_chunks(
        &self,
        page: Vec<(ContentIdentifier, ChunkPayload)>,
        keep_until: KeepUntil,
    ) -> Result<HashMap<ContentIdentifier, KeepUntilReceipt>, StoreError> {
        self.inner.put_chunks(page, keep_until).await
    }

    async fn get(&self, id: ContentIdentifier) -> Result<Option<Bytes>, StoreError> {
        self.inner.get(id).await
    }

    async fn resolve(
        &self,
        ids: &[ContentIdentifier],
    ) -> Result<HashMap<ContentIdentifier, ResolvedBlob>, StoreError> {
        self.inner.resolve(ids).await
    }

    async fn fetch(&self, _blob: &ResolvedBlob) -> Result<ChunkPayload, StoreError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_cancel_unblocks_a_stalled_transfer() {
    let inner = MemoryDedupStore::new();
    let parts: [&[u8]; 2] = [&[6u8; 8], &[7u8; 8]];
    let leaves: Vec<MerkleNode> = parts
        .iter()
        .map(|content| {
            inner.seed_chunk(content);
            MerkleNode::chunk_of(content)
        })
        .collect();
    let root = build_tree(leaves).unwrap();
    inner.seed_node(&root);
    let root_id = root.identifier();

    let cancel = CancelToken::new();
    let engine = DownloadEngine::new(
        Arc::new(StalledStore { inner }),
        ClientConfig::default(),
        Arc::new(tokio::sync::Semaphore::new(8)),
        cancel.clone(),
    );

    let target = tempfile::tempdir().unwrap();
    let path = target.path().join("out.bin");
    let transfer = tokio::spawn(async move { engine.download_to_file(root_id, &path, 16).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let err = tokio::time::timeout(Duration::from_secs(5), transfer)
        .await
        .expect("cancel did not unblock the transfer")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::Cancelled));
}

#[tokio::test]
async fn test_read_blob_assembles_tree_in_memory() {
    let store = MemoryDedupStore::new();
    let parts: [&[u8]; 2] = [b"hello ", b"world"];
    let leaves: Vec<MerkleNode> = parts
        .iter()
        .map(|content| {
            store.seed_chunk(content);
            MerkleNode::chunk_of(content)
        })
        .collect();
    let root = build_tree(leaves).unwrap();
    store.seed_node(&root);

    let engine = common::download_engine(store);
    let bytes = engine.read_blob(root.identifier()).await.unwrap().unwrap();
    assert_eq!(&bytes[..], b"hello world");

    assert!(engine
        .read_blob(ContentIdentifier::node([7u8; 32]))
        .await
        .unwrap()
        .is_none());
}
