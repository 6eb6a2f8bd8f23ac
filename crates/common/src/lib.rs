/**
 * Typed content identifiers for chunks and inner
 *  nodes, plus the wire string format used to
 *  address them in the remote store.
 */
pub mod identifier;
/**
 * The Merkle node content model: chunk leaves,
 *  inner nodes, binary (de)serialization, hash
 *  derivation, and leaf-order traversal.
 */
pub mod node;
/**
 * Async per-key exclusive locks keyed by content
 *  identifier. Guarantees at most one in-flight
 *  operation per identifier, with an ordered
 *  multi-key variant that cannot deadlock.
 */
pub mod lockset;
/**
 * KeepUntil retention stamps and the receipts the
 *  store issues to prove content will outlive a
 *  signed deadline.
 */
pub mod receipt;
/**
 * The manifest document mapping artifact paths to
 *  blob identifiers, including glob filtering and
 *  the legacy empty-directory fixup.
 */
pub mod manifest;
/**
 * A small clonable cancellation signal threaded
 *  through every session operation.
 */
pub mod cancel;

pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::identifier::{ContentIdentifier, IdentifierError, IdentifierKind};
    pub use crate::lockset::{LockHandle, LockSet};
    pub use crate::manifest::{Manifest, ManifestItem, ManifestItemType};
    pub use crate::node::{MerkleNode, NodeError, MAX_DIRECT_CHILDREN_PER_NODE};
    pub use crate::receipt::{KeepUntil, KeepUntilReceipt, SummaryKeepUntilReceipt};
}
