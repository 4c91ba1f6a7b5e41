//! Adaptive chunked transfer mechanics.
//!
//! The leaf components of the relay pipeline, free of any I/O or
//! collaborator dependencies:
//!
//! - [`ChunkPolicy`] — pure controller mapping observed per-chunk latency
//!   to the next chunk size
//! - [`ChunkStats`] — per-loop diagnostics accumulated once per chunk
//! - [`TransferMeter`] — byte accounting with throttled progress emission
//! - [`ConcurrencyGate`] — per-user admission control with RAII permits

mod chunk;
mod gate;
mod meter;

pub use chunk::{ChunkPolicy, ChunkStats};
pub use gate::{ConcurrencyGate, TransferPermit, MAX_PARALLELISM, MIN_PARALLELISM};
pub use meter::{format_size, ProgressFrame, TransferMeter, DEFAULT_EMIT_INTERVAL};

/// Initial chunk size for both staging and relay loops: 1 MiB.
///
/// The controller converges from here toward the link's actual capacity
/// within a few chunks in either direction.
pub const INITIAL_CHUNK_SIZE: usize = 1024 * 1024;
