use common::identifier::{ContentIdentifier, IdentifierError};
use common::manifest::ManifestError;
use common::node::NodeError;

use crate::api::StoreError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("content mismatch: expected {expected}, got {actual}")]
    IdentifierMismatch {
        expected: ContentIdentifier,
        actual: ContentIdentifier,
    },

    #[error("size mismatch for {id}: declared {declared} bytes, got {actual}")]
    SizeMismatch {
        id: ContentIdentifier,
        declared: u64,
        actual: u64,
    },

    /// The store declared a tree but cannot produce one of its pieces.
    #[error("tree {root} is missing blob {missing}")]
    IncompleteTree {
        root: ContentIdentifier,
        missing: ContentIdentifier,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid usage: {0}")]
    Usage(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("default error: {0}")]
    Default(#[from] anyhow::Error),
}
