use std::time::{Duration, Instant};

use serde::Serialize;

/// Minimum wall time between progress emissions: 2 seconds.
pub const DEFAULT_EMIT_INTERVAL: Duration = Duration::from_secs(2);

/// A renderable snapshot of transfer progress.
///
/// `percent` and `eta` are `None` when the total size is not known up
/// front (e.g. a streamed URL without a `Content-Length`), and the caller
/// renders them as "unknown" rather than failing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressFrame {
    pub bytes_so_far: u64,
    pub total_bytes: Option<u64>,
    pub percent: Option<f64>,
    /// Smoothed average since transfer start, in bytes per second.
    pub speed_bps: f64,
    pub eta: Option<Duration>,
}

/// Accumulates byte counts for one direction of a transfer and throttles
/// outward progress emission to a fixed cadence.
///
/// Byte counts only ever grow, so frames taken from one meter are
/// monotonically non-decreasing. Speed is computed against elapsed time
/// since the transfer started, not since the last emission.
pub struct TransferMeter {
    started: Instant,
    last_emit: Instant,
    interval: Duration,
    bytes: u64,
    total: Option<u64>,
}

impl TransferMeter {
    /// Creates a meter with the default 2-second emission interval.
    pub fn new(total: Option<u64>) -> Self {
        Self::with_interval(total, DEFAULT_EMIT_INTERVAL)
    }

    /// Creates a meter with a custom emission interval.
    pub fn with_interval(total: Option<u64>, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_emit: now,
            interval,
            bytes: 0,
            total,
        }
    }

    /// Adds transferred bytes to the running total.
    pub fn record(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    /// Bytes recorded so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Declared total, if known.
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// The instant this meter started measuring.
    pub fn started_at(&self) -> Instant {
        self.started
    }

    /// Returns a frame if at least one emission interval has passed since
    /// the last one, else `None`.
    pub fn maybe_emit(&mut self, now: Instant) -> Option<ProgressFrame> {
        if now.duration_since(self.last_emit) < self.interval {
            return None;
        }
        self.last_emit = now;
        Some(self.frame(now))
    }

    /// Builds a progress frame at `now` without consulting the throttle.
    pub fn frame(&self, now: Instant) -> ProgressFrame {
        let elapsed = now.duration_since(self.started);
        let speed_bps = if elapsed.is_zero() {
            0.0
        } else {
            self.bytes as f64 / elapsed.as_secs_f64()
        };

        let percent = match self.total {
            Some(total) if total > 0 => Some((self.bytes as f64 / total as f64) * 100.0),
            _ => None,
        };

        let eta = match self.total {
            Some(total) if speed_bps > 0.0 => {
                let remaining = total.saturating_sub(self.bytes);
                Some(Duration::from_secs_f64(remaining as f64 / speed_bps))
            }
            _ => None,
        };

        ProgressFrame {
            bytes_so_far: self.bytes,
            total_bytes: self.total,
            percent,
            speed_bps,
            eta,
        }
    }
}

/// Formats a byte count as a human-readable size (B, KB, MB, GB).
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}
