//! Collaborator contracts consumed by the pipeline.
//!
//! The chat frontend, quota bookkeeping, database, and storage backend all
//! live outside this crate; the host wires them in through these traits.
//! Keeping them as traits also lets the session tests run against
//! recording mocks with no network.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RelayError;
use crate::source::ByteSource;
use crate::types::{MessageRef, StorageUsage, StoredFile, UploadRecord};

/// Per-user upload quota. Count-based with a daily reset owned by the
/// implementation; the pipeline only asks and increments.
#[async_trait]
pub trait QuotaService: Send + Sync {
    /// `false` when the user has exhausted today's uploads.
    async fn quota_ok(&self, user_id: i64) -> Result<bool, RelayError>;

    /// Counts one completed upload against the user.
    async fn quota_increment(&self, user_id: i64) -> Result<(), RelayError>;
}

/// Append-only persistence for transfer attempts.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Persists a record, returning its row id.
    async fn record_transfer(&self, record: &UploadRecord) -> Result<i64, RelayError>;

    /// Looks up the originating chat coordinates for a previously-seen
    /// content id, for privileged re-fetch of oversized attachments.
    async fn find_transfer(&self, content_id: &str) -> Result<Option<MessageRef>, RelayError>;
}

/// Pushes progress text to the originating client.
///
/// `update` edits one live message in place and may fail with a
/// "message unchanged" style error; the session swallows those.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Idempotent in-place edit of the live progress message.
    async fn update(&self, text: &str) -> Result<(), RelayError>;

    /// A separate, always-new message to the user.
    async fn notify(&self, user_id: i64, text: &str) -> Result<(), RelayError>;
}

/// One step of a resumable upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStep {
    /// Chunk accepted; `bytes_sent` is the backend's confirmed offset.
    Progress { bytes_sent: u64 },
    /// Upload finished; the file is durable at the destination.
    Complete(StoredFile),
}

/// A live resumable upload accepting chunks in order.
#[async_trait]
pub trait UploadHandle: Send {
    async fn next_chunk(&mut self, data: Bytes) -> Result<UploadStep, RelayError>;
}

/// The remote object-storage destination. Assumed reliable but slow.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Current usage, or `None` when the backend cannot report it.
    /// Query failures degrade to a soft warning, never a gate.
    async fn storage_usage(&self) -> Result<Option<StorageUsage>, RelayError>;

    /// Display name for a destination container, best effort.
    async fn folder_name(&self, folder_id: &str) -> Result<Option<String>, RelayError>;

    /// Starts a resumable upload into `parent_folder_id`.
    async fn create_resumable_upload(
        &self,
        name: &str,
        parent_folder_id: &str,
        content_type: &str,
    ) -> Result<Box<dyn UploadHandle>, RelayError>;
}

/// Result of resolving a platform attachment reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttachment {
    /// Directly fetchable URL, short-lived.
    pub fetch_url: String,
    pub declared_size: Option<u64>,
}

/// Resolves platform-native attachment references to fetchable URLs.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    /// Resolves a fetch URL just-in-time. `origin` carries recovered chat
    /// coordinates when the attachment must go through the privileged
    /// channel.
    async fn resolve_fetch_url(
        &self,
        attachment_id: &str,
        origin: Option<MessageRef>,
    ) -> Result<ResolvedAttachment, RelayError>;
}

/// Opens an HTTP byte stream. Abstracted so tests can inject streams.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<ByteSource, RelayError>;
}
