//! Data types for the relay flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat coordinates of the message that originally carried an attachment.
///
/// Stored with the upload record so oversized attachments can later be
/// re-fetched through the privileged channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// The content a transfer should move: a platform attachment or a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRef {
    Attachment {
        /// Platform-native file reference. Short-lived; resolved to a
        /// fetch URL just before staging, never cached.
        id: String,
        file_name: Option<String>,
        content_type: Option<String>,
        size_hint: Option<u64>,
        origin: Option<MessageRef>,
    },
    Url(String),
}

impl ContentRef {
    /// Stable identifier used for the upload record and re-fetch lookup.
    pub fn content_id(&self) -> &str {
        match self {
            Self::Attachment { id, .. } => id,
            Self::Url(url) => url,
        }
    }
}

/// Immutable input describing one requested transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub user_id: i64,
    pub content: ContentRef,
    /// Destination container in the storage backend.
    pub dest_folder_id: String,
    /// Send a separate confirmation message on completion.
    pub notify_on_complete: bool,
}

/// Final metadata reported by the storage backend for a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Failed,
}

/// Durable, append-only audit row written once per materialized transfer
/// attempt. Never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub user_id: i64,
    pub content_id: String,
    pub file_name: String,
    pub size: u64,
    pub content_type: Option<String>,
    pub origin: Option<MessageRef>,
    pub status: RecordStatus,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Reported destination storage usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub limit: u64,
    pub usage: u64,
}

impl StorageUsage {
    /// Free bytes remaining.
    pub fn free(&self) -> u64 {
        self.limit.saturating_sub(self.usage)
    }

    /// Free space as a percentage of the limit, or `None` for an
    /// unlimited/unreported quota.
    pub fn percent_free(&self) -> Option<f64> {
        if self.limit == 0 {
            None
        } else {
            Some(self.free() as f64 / self.limit as f64 * 100.0)
        }
    }
}
