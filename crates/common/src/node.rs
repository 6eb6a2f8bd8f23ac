use std::fmt;

use crate::identifier::{ContentIdentifier, IdentifierKind, HASH_LEN};

/// Upper bound on direct children per inner node. Paging children into
/// groups of this size bounds any single node's serialized size.
pub const MAX_DIRECT_CHILDREN_PER_NODE: usize = 512;

const HEADER_LEN: usize = 1 + HASH_LEN + 8 + 4;
const CHILD_ENTRY_LEN: usize = 1 + HASH_LEN + 8;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("corrupt node: {0}")]
    CorruptNode(String),
    #[error("inner node has no children loaded")]
    UnfilledNode,
}

/**
 * Merkle nodes
 * ============
 * A node is either a chunk leaf (a content-hashed span of file bytes)
 *  or an inner node over an ordered list of children. An inner node's
 *  hash is derived from its children's identifiers, so two trees over
 *  identical content always collapse to identical identifiers - this
 *  is the dedup key for the whole system.
 * Nodes are immutable once built. A node deserialized from the wire
 *  carries its inner children as unfilled stubs (hash + size only);
 *  filling in a subtree rebuilds the parent rather than mutating it.
 */
#[derive(Debug, Clone)]
pub enum MerkleNode {
    ChunkLeaf {
        hash: [u8; HASH_LEN],
        size: u64,
    },
    InnerNode {
        hash: [u8; HASH_LEN],
        transitive_size: u64,
        /// `None` when fetched from the wire without the subtree.
        children: Option<Vec<MerkleNode>>,
    },
}

// Identity is (kind, hash); children are derived state and two nodes
// with equal hashes cover identical content by construction.
impl PartialEq for MerkleNode {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.hash() == other.hash()
    }
}

impl Eq for MerkleNode {}

impl std::hash::Hash for MerkleNode {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind().tag().hash(state);
        self.hash().hash(state);
    }
}

impl fmt::Display for MerkleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

impl MerkleNode {
    pub fn chunk(hash: [u8; HASH_LEN], size: u64) -> Self {
        MerkleNode::ChunkLeaf { hash, size }
    }

    /// Hash raw chunk content into a leaf node.
    pub fn chunk_of(content: &[u8]) -> Self {
        MerkleNode::ChunkLeaf {
            hash: *blake3::hash(content).as_bytes(),
            size: content.len() as u64,
        }
    }

    /// Build an inner node over an ordered list of children, deriving
    /// its hash from the children's identifiers.
    pub fn inner(children: Vec<MerkleNode>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for child in &children {
            hasher.update(&child.identifier().value());
        }
        let transitive_size = children.iter().map(|c| c.transitive_size()).sum();
        MerkleNode::InnerNode {
            hash: *hasher.finalize().as_bytes(),
            transitive_size,
            children: Some(children),
        }
    }

    /// An inner node known only by hash and size (children not loaded).
    pub fn unfilled(hash: [u8; HASH_LEN], transitive_size: u64) -> Self {
        MerkleNode::InnerNode {
            hash,
            transitive_size,
            children: None,
        }
    }

    pub fn kind(&self) -> IdentifierKind {
        match self {
            MerkleNode::ChunkLeaf { .. } => IdentifierKind::Chunk,
            MerkleNode::InnerNode { .. } => IdentifierKind::Node,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, MerkleNode::ChunkLeaf { .. })
    }

    pub fn hash(&self) -> &[u8; HASH_LEN] {
        match self {
            MerkleNode::ChunkLeaf { hash, .. } => hash,
            MerkleNode::InnerNode { hash, .. } => hash,
        }
    }

    /// Total content bytes covered by this subtree.
    pub fn transitive_size(&self) -> u64 {
        match self {
            MerkleNode::ChunkLeaf { size, .. } => *size,
            MerkleNode::InnerNode {
                transitive_size, ..
            } => *transitive_size,
        }
    }

    /// The node's identity, derived from its hash and kind.
    pub fn identifier(&self) -> ContentIdentifier {
        ContentIdentifier::new(self.kind(), *self.hash())
    }

    /// Direct children; `None` for an unfilled inner node, empty for a
    /// leaf.
    pub fn children(&self) -> Option<&[MerkleNode]> {
        match self {
            MerkleNode::ChunkLeaf { .. } => Some(&[]),
            MerkleNode::InnerNode { children, .. } => children.as_deref(),
        }
    }

    pub fn is_filled(&self) -> bool {
        match self {
            MerkleNode::ChunkLeaf { .. } => true,
            MerkleNode::InnerNode { children, .. } => children.is_some(),
        }
    }

    /// Serialize to the fixed binary layout:
    ///
    /// ```text
    /// kind tag (u8) | hash (32) | transitive size (u64 LE)
    /// | child count (u32 LE) | child entries (tag, hash, size)...
    /// ```
    ///
    /// Round-trips byte-for-byte through [`MerkleNode::deserialize`].
    /// Inner nodes must have their children loaded.
    pub fn serialize(&self) -> Result<Vec<u8>, NodeError> {
        let children = match self {
            MerkleNode::ChunkLeaf { .. } => &[][..],
            MerkleNode::InnerNode { children, .. } => {
                children.as_deref().ok_or(NodeError::UnfilledNode)?
            }
        };
        let mut out = Vec::with_capacity(HEADER_LEN + children.len() * CHILD_ENTRY_LEN);
        out.push(self.kind().tag());
        out.extend_from_slice(self.hash());
        out.extend_from_slice(&self.transitive_size().to_le_bytes());
        out.extend_from_slice(&(children.len() as u32).to_le_bytes());
        for child in children {
            out.push(child.kind().tag());
            out.extend_from_slice(child.hash());
            out.extend_from_slice(&child.transitive_size().to_le_bytes());
        }
        Ok(out)
    }

    /// Deserialize node bytes fetched from the store. Child inner
    /// nodes come back unfilled; child leaves are complete. Fails with
    /// [`NodeError::CorruptNode`] on any layout or hash disagreement.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, NodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(NodeError::CorruptNode(format!(
                "{} bytes is shorter than the node header",
                bytes.len()
            )));
        }
        let kind = IdentifierKind::from_tag(bytes[0])
            .ok_or_else(|| NodeError::CorruptNode(format!("unknown kind tag {}", bytes[0])))?;
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&bytes[1..1 + HASH_LEN]);
        let size_at = 1 + HASH_LEN;
        let transitive_size = u64::from_le_bytes(
            bytes[size_at..size_at + 8]
                .try_into()
                .map_err(|_| NodeError::CorruptNode("truncated size".into()))?,
        );
        let count_at = size_at + 8;
        let child_count = u32::from_le_bytes(
            bytes[count_at..count_at + 4]
                .try_into()
                .map_err(|_| NodeError::CorruptNode("truncated child count".into()))?,
        ) as usize;

        let expected = HEADER_LEN + child_count * CHILD_ENTRY_LEN;
        if bytes.len() != expected {
            return Err(NodeError::CorruptNode(format!(
                "expected {expected} bytes for {child_count} children, got {}",
                bytes.len()
            )));
        }

        match kind {
            IdentifierKind::Chunk => {
                if child_count != 0 {
                    return Err(NodeError::CorruptNode(
                        "chunk leaf declares children".into(),
                    ));
                }
                Ok(MerkleNode::ChunkLeaf {
                    hash,
                    size: transitive_size,
                })
            }
            IdentifierKind::Node => {
                if child_count == 0 {
                    return Err(NodeError::CorruptNode("inner node with no children".into()));
                }
                let mut children = Vec::with_capacity(child_count);
                let mut offset = HEADER_LEN;
                for _ in 0..child_count {
                    let tag = IdentifierKind::from_tag(bytes[offset]).ok_or_else(|| {
                        NodeError::CorruptNode(format!("unknown child tag {}", bytes[offset]))
                    })?;
                    let mut child_hash = [0u8; HASH_LEN];
                    child_hash.copy_from_slice(&bytes[offset + 1..offset + 1 + HASH_LEN]);
                    let child_size = u64::from_le_bytes(
                        bytes[offset + 1 + HASH_LEN..offset + CHILD_ENTRY_LEN]
                            .try_into()
                            .map_err(|_| NodeError::CorruptNode("truncated child entry".into()))?,
                    );
                    children.push(match tag {
                        IdentifierKind::Chunk => MerkleNode::chunk(child_hash, child_size),
                        IdentifierKind::Node => MerkleNode::unfilled(child_hash, child_size),
                    });
                    offset += CHILD_ENTRY_LEN;
                }

                let rebuilt = MerkleNode::inner(children);
                if rebuilt.hash() != &hash {
                    return Err(NodeError::CorruptNode(
                        "stored hash does not match derived hash".into(),
                    ));
                }
                if rebuilt.transitive_size() != transitive_size {
                    return Err(NodeError::CorruptNode(
                        "stored size does not match child sizes".into(),
                    ));
                }
                Ok(rebuilt)
            }
        }
    }

    /// Left-to-right leaf traversal. Leaf order defines the on-disk
    /// byte offsets during download, so the tree must be filled before
    /// iterating; unfilled subtrees yield nothing.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves { stack: vec![self] }
    }

    /// Depth-first traversal over this node and every filled inner
    /// descendant (leaves excluded).
    pub fn inner_nodes(&self) -> InnerNodes<'_> {
        InnerNodes { stack: vec![self] }
    }
}

pub struct Leaves<'a> {
    stack: Vec<&'a MerkleNode>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = &'a MerkleNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            match node {
                MerkleNode::ChunkLeaf { .. } => return Some(node),
                MerkleNode::InnerNode { children, .. } => {
                    if let Some(children) = children {
                        self.stack.extend(children.iter().rev());
                    }
                }
            }
        }
        None
    }
}

pub struct InnerNodes<'a> {
    stack: Vec<&'a MerkleNode>,
}

impl<'a> Iterator for InnerNodes<'a> {
    type Item = &'a MerkleNode;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node) = self.stack.pop() {
            if let MerkleNode::InnerNode { children, .. } = node {
                if let Some(children) = children {
                    self.stack.extend(children.iter().rev());
                }
                return Some(node);
            }
        }
        None
    }
}

/// Fold a flat list of nodes into a single root, paging children into
/// groups of at most [`MAX_DIRECT_CHILDREN_PER_NODE`]. A single leaf
/// stays a leaf root. Returns `None` for an empty input.
pub fn build_tree(mut nodes: Vec<MerkleNode>) -> Option<MerkleNode> {
    if nodes.is_empty() {
        return None;
    }
    while nodes.len() > 1 {
        nodes = nodes
            .chunks(MAX_DIRECT_CHILDREN_PER_NODE)
            .map(|page| MerkleNode::inner(page.to_vec()))
            .collect();
    }
    nodes.pop()
}
