use std::time::Duration;

/// Minimum chunk size: 64 KiB.
const MIN_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum chunk size: 8 MiB.
const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Chunks faster than this double the next chunk size.
const FAST_CHUNK: Duration = Duration::from_millis(500);

/// Chunks slower than this halve the next chunk size.
const SLOW_CHUNK: Duration = Duration::from_secs(2);

/// Adaptive chunk sizing policy.
///
/// Targets a per-chunk transfer time inside the `[fast, slow]` tolerance
/// band: chunks that complete below the band double the size (capped at
/// `max_size`), chunks above it halve the size (floored at `min_size`),
/// and chunks inside the band leave it unchanged. This converges the chunk
/// size to the link's bandwidth without per-request tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub min_size: usize,
    pub max_size: usize,
    /// Low watermark of the tolerance band.
    pub fast: Duration,
    /// High watermark of the tolerance band.
    pub slow: Duration,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_size: MIN_CHUNK_SIZE,
            max_size: MAX_CHUNK_SIZE,
            fast: FAST_CHUNK,
            slow: SLOW_CHUNK,
        }
    }
}

impl ChunkPolicy {
    /// Returns the chunk size to use for the next transfer, given how long
    /// the previous chunk of `current` bytes took.
    ///
    /// Pure and deterministic. Growth is capped at one doubling per call,
    /// so an instantaneous chunk (`elapsed == 0`, e.g. cached data) cannot
    /// blow the size up in a single step.
    pub fn next_size(&self, elapsed: Duration, current: usize) -> usize {
        let current = current.clamp(self.min_size, self.max_size);
        if elapsed < self.fast {
            current.saturating_mul(2).min(self.max_size)
        } else if elapsed > self.slow {
            (current / 2).max(self.min_size)
        } else {
            current
        }
    }
}

/// Per-loop chunk diagnostics, mutated once per chunk by the owning
/// session and logged when the loop ends.
#[derive(Debug, Clone)]
pub struct ChunkStats {
    /// Number of chunk-size adjustments the controller made.
    pub changes: u64,
    /// Bytes actually transferred.
    pub total_bytes: u64,
    /// Wall time spent inside chunk transfers.
    pub total_time: Duration,
    /// Sum of requested chunk sizes (for the average).
    pub sum_chunk_size: u64,
    /// Number of chunks transferred.
    pub num_chunks: u64,
    /// The size the next chunk will be requested at.
    pub last_chunk_size: usize,
}

impl ChunkStats {
    /// Creates stats starting from `initial_chunk_size`.
    pub fn new(initial_chunk_size: usize) -> Self {
        Self {
            changes: 0,
            total_bytes: 0,
            total_time: Duration::ZERO,
            sum_chunk_size: 0,
            num_chunks: 0,
            last_chunk_size: initial_chunk_size,
        }
    }

    /// Records one completed chunk.
    ///
    /// `requested` is the size asked for, `transferred` the bytes actually
    /// moved, and `next` the controller's decision for the following chunk.
    pub fn record(&mut self, requested: usize, transferred: usize, elapsed: Duration, next: usize) {
        if next != requested {
            self.changes += 1;
        }
        self.last_chunk_size = next;
        self.total_bytes += transferred as u64;
        self.total_time += elapsed;
        self.sum_chunk_size += requested as u64;
        self.num_chunks += 1;
    }

    /// Average requested chunk size, or 0 before the first chunk.
    pub fn avg_chunk_size(&self) -> u64 {
        if self.num_chunks == 0 {
            0
        } else {
            self.sum_chunk_size / self.num_chunks
        }
    }
}
