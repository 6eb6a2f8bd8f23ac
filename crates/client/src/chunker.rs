use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use common::identifier::HASH_LEN;
use common::node::{build_tree, MerkleNode};

/// One content-hashed span of a file.
#[derive(Debug, Clone)]
pub struct ChunkSpan {
    pub offset: u64,
    pub size: u64,
    pub hash: [u8; HASH_LEN],
}

/// Splits a file into content-hashed spans. Pluggable so a
/// content-defined chunker can replace the fixed-size default.
pub trait Chunker: Send + Sync {
    /// Spans cover the file exactly, in order, without gaps. An empty
    /// file yields a single empty span so it still has an identity.
    fn chunk_file(&self, path: &Path) -> std::io::Result<Vec<ChunkSpan>>;
}

/// Fixed-size chunking with blake3 span hashes.
pub struct FixedChunker {
    chunk_size: usize,
}

impl FixedChunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Chunker for FixedChunker {
    fn chunk_file(&self, path: &Path) -> std::io::Result<Vec<ChunkSpan>> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut spans = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            spans.push(ChunkSpan {
                offset,
                size: filled as u64,
                hash: *blake3::hash(&buf[..filled]).as_bytes(),
            });
            offset += filled as u64;
            if filled < buf.len() {
                break;
            }
        }
        if spans.is_empty() {
            spans.push(ChunkSpan {
                offset: 0,
                size: 0,
                hash: *blake3::hash(&[]).as_bytes(),
            });
        }
        Ok(spans)
    }
}

/// A hashed source file: its path relative to the publish root and the
/// content subtree covering its bytes.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub node: MerkleNode,
}

impl FileDescriptor {
    /// Hash one file into its leaf (or paged inner) subtree.
    pub fn hash_file(
        chunker: &dyn Chunker,
        absolute_path: PathBuf,
        relative_path: String,
    ) -> std::io::Result<Self> {
        let spans = chunker.chunk_file(&absolute_path)?;
        let leaves: Vec<MerkleNode> = spans
            .iter()
            .map(|s| MerkleNode::chunk(s.hash, s.size))
            .collect();
        // chunk_file always yields at least one span
        let node = build_tree(leaves).unwrap_or_else(|| MerkleNode::chunk_of(&[]));
        Ok(Self {
            relative_path,
            absolute_path,
            node,
        })
    }
}
