use std::time::Duration;

/// Tuning knobs for the upload and download engines. Every engine takes
/// its configuration explicitly; nothing reads the environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Global cap on concurrent store calls.
    pub max_parallelism: usize,
    /// Chunk read buffers held in memory at once during upload.
    pub chunk_read_buffers: usize,
    /// Chunks gathered (sorted by identifier) per upload page.
    pub chunk_page_size: usize,
    /// Chunks sent per `put_chunks` call within a page.
    pub put_chunk_batch: usize,
    /// Identifiers per signed-URL resolution call.
    pub resolve_batch: usize,
    /// Attempts per store call before a transient failure is terminal.
    pub max_attempts: u32,
    /// Interval between progress log lines during long transfers.
    pub stats_interval: Duration,
    /// Leave pre-sized download targets sparse. When false the whole
    /// range is zero-filled before any chunk lands.
    pub sparse_files: bool,
    /// Retention window requested for uploaded content.
    pub keep_until_duration: Duration,
    /// Chunk size used by the default fixed chunker.
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 16,
            chunk_read_buffers: 16,
            chunk_page_size: 128,
            put_chunk_batch: 64,
            resolve_batch: 100,
            max_attempts: 5,
            stats_interval: Duration::from_secs(10),
            sparse_files: true,
            keep_until_duration: Duration::from_secs(2 * 24 * 60 * 60),
            chunk_size: 64 * 1024,
        }
    }
}
