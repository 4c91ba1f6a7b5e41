//! Relay error taxonomy.

use cloudrelay_transfer::format_size;

/// Errors produced while moving content through the relay.
///
/// Every internal failure is translated into one of these at the session
/// boundary; raw backend or network errors never leak past it.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("daily upload quota exceeded")]
    QuotaExceeded,

    #[error(
        "insufficient destination space: need {}, {} free",
        format_size(*needed),
        format_size(*free)
    )]
    InsufficientSpace { needed: u64, free: u64 },

    #[error("unsupported content: {0}")]
    UnsupportedContent(String),

    #[error("source fetch failed: {0}")]
    SourceFetch(String),

    #[error("destination write failed: {0}")]
    DestinationWrite(String),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// `true` for rejections made before any bytes moved (quota, space,
    /// unrecognized content). These never produce an upload record.
    pub fn is_preparing_rejection(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded | Self::InsufficientSpace { .. } | Self::UnsupportedContent(_)
        )
    }
}
