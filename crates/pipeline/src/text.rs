//! Rendering of user-facing progress and outcome messages.
//!
//! Pure string building; the [`crate::services::ProgressSink`] decides how
//! the text reaches the client.

use std::time::Duration;

use cloudrelay_transfer::{format_size, ProgressFrame};

/// Which leg of the transfer a progress message describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Pulling bytes from the source into the staging area.
    Staging,
    /// Pushing the staged file to the storage backend.
    Relaying,
}

impl TransferPhase {
    fn headline(self) -> &'static str {
        match self {
            Self::Staging => "Downloading from source...",
            Self::Relaying => "Uploading to cloud storage...",
        }
    }
}

/// Ten-slot progress bar; an unknown percentage renders all-empty.
fn progress_bar(percent: Option<f64>) -> String {
    let filled = percent.map_or(0, |p| ((p / 10.0) as usize).min(10));
    let mut bar = String::new();
    for i in 0..10 {
        bar.push(if i < filled { '\u{1F7E2}' } else { '\u{1F7E1}' });
    }
    bar
}

/// Renders one progress message for the live in-place edit.
///
/// Percent, total size, and ETA all degrade to explicit placeholders when
/// the total size is unknown.
pub fn render_progress(
    phase: TransferPhase,
    location: Option<&str>,
    frame: &ProgressFrame,
) -> String {
    let mut text = String::from(phase.headline());
    if let Some(location) = location {
        text.push_str(&format!("\nUploading to: {location}"));
    }

    let percent_str = frame
        .percent
        .map_or_else(|| "unknown".to_string(), |p| format!("{p:.0}%"));
    let total_str = frame
        .total_bytes
        .map_or_else(|| "Unknown".to_string(), format_size);
    let speed_mbs = frame.speed_bps / 1024.0 / 1024.0;
    let eta_str = frame
        .eta
        .map_or_else(|| "Calculating...".to_string(), render_eta);

    text.push_str(&format!(
        "\nProgress: {percent_str} [{}]\n{} of {total_str}\nSpeed: {speed_mbs:.2} MB/sec\nETA: {eta_str}",
        progress_bar(frame.percent),
        format_size(frame.bytes_so_far),
    ));
    text
}

fn render_eta(eta: Duration) -> String {
    format!("{:.0} seconds", eta.as_secs_f64())
}

/// Final message for a successful transfer.
pub fn render_complete(file_name: &str, size: u64, location: Option<&str>) -> String {
    match location {
        Some(location) => format!(
            "Upload complete: {file_name} ({})\nUploaded to: {location}",
            format_size(size)
        ),
        None => format!("Upload complete: {file_name} ({})", format_size(size)),
    }
}

/// Final message for a cancelled transfer.
pub fn render_cancelled(file_name: &str) -> String {
    format!("Upload cancelled: {file_name}")
}

/// Final message for a failed transfer.
pub fn render_failed(file_name: &str, reason: &str) -> String {
    format!("Upload failed: {file_name}\n{reason}")
}

/// Warning sent when destination free space drops below the threshold.
pub fn render_low_space(percent_free: f64) -> String {
    format!(
        "Warning: destination storage is almost full ({percent_free:.1}% free)"
    )
}
