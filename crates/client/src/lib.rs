/**
 * The store trait, its protocol responses, and the
 *  chunk wire payload with opportunistic
 *  compression.
 */
pub mod api;
/**
 * Top-level orchestration: publish a path as a
 *  manifest plus content tree, and materialize a
 *  manifest back onto disk.
 */
pub mod artifact;
/**
 * File chunking: the chunker trait, the fixed-size
 *  default, and per-file content subtrees.
 */
pub mod chunker;
/**
 * Explicit engine configuration with sensible
 *  defaults.
 */
pub mod config;
/**
 * The download engine: tree filling, the bounded
 *  fetch-and-write pipeline, atomic publish, and
 *  the local chunk store fast path.
 */
pub mod download;
/**
 * The client error taxonomy. Protocol states are
 *  not errors; integrity failures are fatal.
 */
pub mod error;
/**
 * The reqwest binding of the store trait.
 */
pub mod http;
/**
 * Bounded retries with exponential backoff for
 *  transient store failures.
 */
pub mod retry;
/**
 * The upload session: the put-node protocol walk,
 *  chunk paging, receipts, counters, and proof
 *  node construction.
 */
pub mod upload;

pub mod prelude {
    pub use crate::api::{ChunkPayload, DedupStore, PutNodeResponse, ResolvedBlob, StoreError};
    pub use crate::artifact::{
        ArtifactClient, DownloadOptions, PublishOptions, PublishResult,
    };
    pub use crate::chunker::{ChunkSpan, Chunker, FileDescriptor, FixedChunker};
    pub use crate::config::ClientConfig;
    pub use crate::download::{
        ChunkPlacement, DownloadEngine, DownloadOutcome, DownloadStatistics, LocalChunkStore,
    };
    pub use crate::error::{ClientError, Result};
    pub use crate::http::HttpDedupStore;
    pub use crate::upload::{ChunkSource, ProofIndex, UploadSession, UploadStatistics};
}
