//! Chat-driven file relay pipeline.
//!
//! Moves one piece of content per session from a chat source to cloud
//! storage through a local staging area:
//!
//! 1. A [`TransferRequest`] names the content (platform attachment or URL)
//!    and the destination folder.
//! 2. [`TransferSession`] drives it through preparation checks, adaptive
//!    chunked staging, and an adaptive resumable relay, emitting throttled
//!    progress through a [`ProgressSink`].
//! 3. The session ends in exactly one terminal state and, once bytes have
//!    moved, leaves exactly one [`UploadRecord`] behind.
//!
//! Concurrency is bounded per user by [`cloudrelay_transfer::ConcurrencyGate`];
//! cancellation, notify toggling, and parallelism changes reach a running
//! session through the [`SessionRegistry`].

pub mod command;
pub mod error;
pub mod registry;
pub mod services;
pub mod session;
pub mod source;
pub mod text;
pub mod types;

pub use command::SessionCommand;
pub use error::RelayError;
pub use registry::{SessionHandle, SessionRegistry};
pub use services::{
    AttachmentFetcher, HttpFetch, ProgressSink, QuotaService, ResolvedAttachment, StorageBackend,
    TransferStore, UploadHandle, UploadStep,
};
pub use session::{Services, SessionState, TransferOutcome, TransferSession};
pub use source::{
    is_streaming_site, select_source, AttachmentResolver, ByteSource, DirectUrlResolver,
    HttpClient, MediaExtractor, MediaResolver, ResolvedSource, SourceKind, SourceResolver,
    STREAMING_SITES,
};
pub use text::TransferPhase;
pub use types::{
    ContentRef, MessageRef, RecordStatus, StorageUsage, StoredFile, TransferRequest, UploadRecord,
};
