//! Boundary command decoding.
//!
//! Interaction payloads from the chat frontend arrive as opaque strings.
//! They are decoded into [`SessionCommand`] exactly once, here, and routed
//! by variant from then on.

/// A command targeting a running (or future) transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Cooperatively cancel the in-flight transfer.
    CancelUpload,
    /// Flip the notify-on-completion flag of the running session.
    ToggleNotify,
    /// Change the user's transfer parallelism (clamped to 1–5).
    SetParallelism(usize),
}

impl SessionCommand {
    /// Decodes an interaction payload, `None` for anything unrecognized.
    pub fn parse(payload: &str) -> Option<Self> {
        match payload {
            "cancel_upload" => Some(Self::CancelUpload),
            "toggle_notify_completion" => Some(Self::ToggleNotify),
            _ => payload
                .strip_prefix("parallel_uploads:")
                .and_then(|n| n.parse().ok())
                .map(Self::SetParallelism),
        }
    }
}
