//! The transfer session state machine.
//!
//! One session drives one piece of content end to end:
//!
//! `PREPARING -> STAGING -> RELAYING -> COMPLETE | CANCELLED | FAILED`
//!
//! Preparation checks (quota, source classification, capacity) happen
//! before any bytes move and reject without leaving a trace. Once staging
//! starts, the attempt is materialized: every terminal state from there on
//! cleans up the staging area and writes exactly one upload record, except
//! cancellation, which cleans up and records nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cloudrelay_transfer::{
    ChunkPolicy, ChunkStats, ConcurrencyGate, ProgressFrame, TransferMeter, DEFAULT_EMIT_INTERVAL,
    INITIAL_CHUNK_SIZE,
};

use crate::error::RelayError;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::services::{
    AttachmentFetcher, HttpFetch, ProgressSink, QuotaService, StorageBackend, TransferStore,
    UploadStep,
};
use crate::source::{
    select_source, AttachmentResolver, DirectUrlResolver, MediaExtractor, MediaResolver,
    ResolvedSource, SourceKind, SourceResolver, DEFAULT_FILE_NAME,
};
use crate::text::{self, TransferPhase};
use crate::types::{ContentRef, RecordStatus, StoredFile, TransferRequest, UploadRecord};

/// Free-space percentage below which a warning goes to the user.
const LOW_SPACE_PERCENT: f64 = 10.0;

/// Content type used when the source declares none.
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// The phases a session moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Preparing,
    Staging,
    Relaying,
    Complete,
    Cancelled,
    Failed,
}

/// How a session ended.
#[derive(Debug)]
pub enum TransferOutcome {
    Complete(StoredFile),
    Cancelled,
    Failed(RelayError),
}

/// External collaborators a session needs, wired in by the host.
#[derive(Clone)]
pub struct Services {
    pub quota: Arc<dyn QuotaService>,
    pub store: Arc<dyn TransferStore>,
    pub sink: Arc<dyn ProgressSink>,
    pub backend: Arc<dyn StorageBackend>,
    pub fetcher: Arc<dyn AttachmentFetcher>,
    pub http: Arc<dyn HttpFetch>,
}

/// Mutable bookkeeping for one attempt, threaded through the pipeline so
/// finalization sees the same facts regardless of where the run stopped.
struct Attempt {
    /// Set the moment staging begins. Gates record writing.
    attempted: bool,
    /// Directory created for this session's staged data, if any.
    stage_root: Option<PathBuf>,
    file_name: String,
    content_type: Option<String>,
    /// Bytes staged so far; the file's true size after staging completes.
    staged_size: u64,
    /// Destination folder display name, best effort.
    location: Option<String>,
}

impl Attempt {
    fn new() -> Self {
        Self {
            attempted: false,
            stage_root: None,
            file_name: DEFAULT_FILE_NAME.to_string(),
            content_type: None,
            staged_size: 0,
            location: None,
        }
    }
}

/// One end-to-end transfer of one piece of content.
pub struct TransferSession {
    id: Uuid,
    request: TransferRequest,
    services: Services,
    staging_dir: PathBuf,
    policy: ChunkPolicy,
    progress_interval: Duration,
    cancel: CancellationToken,
    extractor: MediaExtractor,
    handle: Option<Arc<SessionHandle>>,
    registry: Option<Arc<SessionRegistry>>,
    resolver: Option<Box<dyn SourceResolver>>,
}

impl TransferSession {
    pub fn new(request: TransferRequest, services: Services) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            services,
            staging_dir: std::env::temp_dir(),
            policy: ChunkPolicy::default(),
            progress_interval: DEFAULT_EMIT_INTERVAL,
            cancel: CancellationToken::new(),
            extractor: MediaExtractor::default(),
            handle: None,
            registry: None,
            resolver: None,
        }
    }

    /// Directory staged files are written under. Defaults to the system
    /// temp directory.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub fn with_policy(mut self, policy: ChunkPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Progress emission cadence. `Duration::ZERO` emits on every chunk.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Uses an external cancellation token instead of a private one.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_extractor(mut self, extractor: MediaExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Overrides source resolution, bypassing [`select_source`].
    pub fn with_resolver(mut self, resolver: Box<dyn SourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Registers the session so commands can reach it while it runs. The
    /// registry entry is removed when the session ends.
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        let handle = registry.register(self.request.user_id, self.request.notify_on_complete);
        self.id = handle.id();
        self.cancel = handle.cancel_token();
        self.handle = Some(handle);
        self.registry = Some(registry);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the session to a terminal state.
    ///
    /// Waits for a gate slot first; the slot is held for the whole run and
    /// released on every exit path.
    pub async fn run(mut self, gate: &ConcurrencyGate) -> TransferOutcome {
        let permit = gate.acquire(self.request.user_id).await;
        info!(
            session = %self.id,
            user_id = self.request.user_id,
            content = %self.request.content.content_id(),
            "transfer admitted"
        );

        let mut attempt = Attempt::new();
        let result = self.drive(&mut attempt).await;
        let outcome = self.finalize(&attempt, result).await;

        if let (Some(registry), Some(handle)) = (&self.registry, &self.handle) {
            registry.remove(handle.id());
        }
        drop(permit);
        outcome
    }

    /// Runs PREPARING, STAGING, and RELAYING; terminal handling lives in
    /// [`Self::finalize`].
    async fn drive(&mut self, attempt: &mut Attempt) -> Result<StoredFile, RelayError> {
        // PREPARING: reject cheaply before any bytes move.
        if !self
            .services
            .quota
            .quota_ok(self.request.user_id)
            .await?
        {
            return Err(RelayError::QuotaExceeded);
        }

        let kind = match self.resolver {
            Some(_) => None,
            None => Some(select_source(&self.request.content)?),
        };

        self.check_capacity().await?;
        attempt.location = self.lookup_location().await;

        if self.cancel.is_cancelled() {
            return Err(RelayError::Cancelled);
        }

        // STAGING: from here on the attempt is materialized and every
        // terminal state owes a record (cancellation excepted).
        attempt.attempted = true;
        let stage_root = self.staging_dir.join(format!("relay-{}", self.id));
        fs::create_dir_all(&stage_root).await?;
        attempt.stage_root = Some(stage_root.clone());

        let resolver = match self.resolver.take() {
            Some(resolver) => resolver,
            None => self.build_resolver(kind.unwrap_or(SourceKind::DirectUrl), &stage_root),
        };

        let staged_path = match resolver.open().await? {
            ResolvedSource::Stream {
                source,
                file_name,
                content_type,
            } => {
                attempt.file_name = file_name;
                attempt.content_type = content_type;
                self.stage_stream(source, &stage_root, attempt).await?
            }
            ResolvedSource::Staged {
                path,
                file_name,
                content_type,
            } => {
                attempt.file_name = file_name;
                attempt.content_type = content_type;
                attempt.staged_size = fs::metadata(&path).await?.len();
                path
            }
        };

        if attempt.staged_size == 0 {
            return Err(RelayError::SourceFetch(
                "source produced no data".to_string(),
            ));
        }

        // RELAYING.
        self.relay(&staged_path, attempt).await
    }

    fn build_resolver(&self, kind: SourceKind, stage_root: &Path) -> Box<dyn SourceResolver> {
        match (&self.request.content, kind) {
            (
                ContentRef::Attachment {
                    id,
                    file_name,
                    content_type,
                    size_hint,
                    origin,
                },
                _,
            ) => Box::new(AttachmentResolver {
                attachment_id: id.clone(),
                file_name: file_name.clone(),
                content_type: content_type.clone(),
                size_hint: *size_hint,
                origin: *origin,
                fetcher: Arc::clone(&self.services.fetcher),
                store: Arc::clone(&self.services.store),
                http: Arc::clone(&self.services.http),
            }),
            (ContentRef::Url(url), SourceKind::MediaExtraction) => Box::new(MediaResolver {
                url: url.clone(),
                extractor: self.extractor.clone(),
                work_dir: stage_root.to_path_buf(),
            }),
            (ContentRef::Url(url), _) => Box::new(DirectUrlResolver {
                url: url.clone(),
                http: Arc::clone(&self.services.http),
            }),
        }
    }

    /// Destination capacity gate plus the soft low-space warning.
    ///
    /// A usage query failure never blocks the transfer.
    async fn check_capacity(&self) -> Result<(), RelayError> {
        let usage = match self.services.backend.storage_usage().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(session = %self.id, error = %e, "storage usage query failed");
                return Ok(());
            }
        };
        let Some(usage) = usage else {
            return Ok(());
        };

        let needed = match &self.request.content {
            ContentRef::Attachment { size_hint, .. } => *size_hint,
            ContentRef::Url(_) => None,
        };
        if let Some(needed) = needed {
            if needed > usage.free() {
                return Err(RelayError::InsufficientSpace {
                    needed,
                    free: usage.free(),
                });
            }
        }

        if let Some(percent) = usage.percent_free() {
            if percent < LOW_SPACE_PERCENT {
                let warning = text::render_low_space(percent);
                if let Err(e) = self
                    .services
                    .sink
                    .notify(self.request.user_id, &warning)
                    .await
                {
                    debug!(session = %self.id, error = %e, "low-space warning not delivered");
                }
            }
        }
        Ok(())
    }

    async fn lookup_location(&self) -> Option<String> {
        match self
            .services
            .backend
            .folder_name(&self.request.dest_folder_id)
            .await
        {
            Ok(name) => name,
            Err(e) => {
                debug!(session = %self.id, error = %e, "folder name lookup failed");
                None
            }
        }
    }

    /// Pulls the source stream into a staging file chunk by chunk, sized
    /// by the adaptive controller.
    async fn stage_stream(
        &self,
        mut source: crate::source::ByteSource,
        stage_root: &Path,
        attempt: &mut Attempt,
    ) -> Result<PathBuf, RelayError> {
        let safe_name = Path::new(&attempt.file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
        let path = stage_root.join(safe_name);
        let mut file = fs::File::create(&path).await?;

        let mut meter = TransferMeter::with_interval(source.declared_len, self.progress_interval);
        let mut stats = ChunkStats::new(INITIAL_CHUNK_SIZE);
        self.emit_progress(TransferPhase::Staging, attempt, &meter.frame(Instant::now()))
            .await;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let size = stats.last_chunk_size;
            let started = Instant::now();
            let chunk = source.read_chunk(size).await?;
            if chunk.is_empty() {
                break;
            }
            file.write_all(&chunk).await?;
            let elapsed = started.elapsed();

            let next = self.policy.next_size(elapsed, size);
            stats.record(size, chunk.len(), elapsed, next);
            meter.record(chunk.len() as u64);
            attempt.staged_size += chunk.len() as u64;

            if let Some(frame) = meter.maybe_emit(Instant::now()) {
                self.emit_progress(TransferPhase::Staging, attempt, &frame).await;
            }
        }
        file.flush().await?;

        info!(
            session = %self.id,
            bytes = stats.total_bytes,
            chunks = stats.num_chunks,
            avg_chunk = stats.avg_chunk_size(),
            adjustments = stats.changes,
            elapsed_ms = stats.total_time.as_millis() as u64,
            "staging finished"
        );
        Ok(path)
    }

    /// Pushes the staged file to the storage backend through a resumable
    /// upload, chunk sizes adapting independently of the staging leg.
    async fn relay(&self, path: &Path, attempt: &mut Attempt) -> Result<StoredFile, RelayError> {
        let content_type = attempt
            .content_type
            .clone()
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());
        let mut upload = self
            .services
            .backend
            .create_resumable_upload(
                &attempt.file_name,
                &self.request.dest_folder_id,
                &content_type,
            )
            .await?;

        let mut file = fs::File::open(path).await?;
        let mut meter = TransferMeter::with_interval(Some(attempt.staged_size), self.progress_interval);
        let mut stats = ChunkStats::new(INITIAL_CHUNK_SIZE);
        self.emit_progress(TransferPhase::Relaying, attempt, &meter.frame(Instant::now()))
            .await;

        let mut stored = None;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            let size = stats.last_chunk_size;
            let started = Instant::now();
            let mut buf = vec![0u8; size];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            buf.truncate(n);

            let step = upload.next_chunk(Bytes::from(buf)).await?;
            let elapsed = started.elapsed();
            let next = self.policy.next_size(elapsed, size);
            stats.record(size, n, elapsed, next);
            meter.record(n as u64);

            if let UploadStep::Complete(file) = step {
                stored = Some(file);
                break;
            }
            if let Some(frame) = meter.maybe_emit(Instant::now()) {
                self.emit_progress(TransferPhase::Relaying, attempt, &frame).await;
            }
        }

        info!(
            session = %self.id,
            bytes = stats.total_bytes,
            chunks = stats.num_chunks,
            avg_chunk = stats.avg_chunk_size(),
            adjustments = stats.changes,
            elapsed_ms = stats.total_time.as_millis() as u64,
            "relay finished"
        );

        stored.ok_or_else(|| {
            RelayError::DestinationWrite("upload ended without completion".to_string())
        })
    }

    /// Terminal handling, identical for every exit path: remove the
    /// staging area, write the upload record the attempt owes (if any),
    /// then tell the user how it ended. Messaging failures are logged and
    /// swallowed; they never change the outcome.
    async fn finalize(
        &self,
        attempt: &Attempt,
        result: Result<StoredFile, RelayError>,
    ) -> TransferOutcome {
        if let Some(root) = &attempt.stage_root {
            if let Err(e) = fs::remove_dir_all(root).await {
                warn!(session = %self.id, error = %e, "staging cleanup failed");
            }
        }

        match result {
            Ok(stored) => {
                if let Err(e) = self.services.quota.quota_increment(self.request.user_id).await {
                    warn!(session = %self.id, error = %e, "quota increment failed");
                }
                self.write_record(attempt, RecordStatus::Success, None).await;

                let message =
                    text::render_complete(&attempt.file_name, attempt.staged_size, attempt.location.as_deref());
                self.send_update(&message).await;
                if self.notify_on_complete() {
                    self.send_notify(&message).await;
                }
                info!(session = %self.id, file_id = %stored.id, "transfer complete");
                TransferOutcome::Complete(stored)
            }
            Err(RelayError::Cancelled) => {
                // Cancellation is the user's own doing; nothing to record.
                self.send_update(&text::render_cancelled(&attempt.file_name))
                    .await;
                info!(session = %self.id, "transfer cancelled");
                TransferOutcome::Cancelled
            }
            Err(e) => {
                if attempt.attempted && !e.is_preparing_rejection() {
                    self.write_record(attempt, RecordStatus::Failed, Some(e.to_string()))
                        .await;
                }
                self.send_update(&text::render_failed(&attempt.file_name, &e.to_string()))
                    .await;
                warn!(session = %self.id, error = %e, "transfer failed");
                TransferOutcome::Failed(e)
            }
        }
    }

    async fn write_record(&self, attempt: &Attempt, status: RecordStatus, error: Option<String>) {
        let record = UploadRecord {
            user_id: self.request.user_id,
            content_id: self.request.content.content_id().to_string(),
            file_name: attempt.file_name.clone(),
            size: attempt.staged_size,
            content_type: attempt.content_type.clone(),
            origin: match &self.request.content {
                ContentRef::Attachment { origin, .. } => *origin,
                ContentRef::Url(_) => None,
            },
            status,
            error,
            at: Utc::now(),
        };
        if let Err(e) = self.services.store.record_transfer(&record).await {
            warn!(session = %self.id, error = %e, "upload record not written");
        }
    }

    fn notify_on_complete(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(self.request.notify_on_complete, |h| h.notify_on_complete())
    }

    async fn emit_progress(&self, phase: TransferPhase, attempt: &Attempt, frame: &ProgressFrame) {
        let message = text::render_progress(phase, attempt.location.as_deref(), frame);
        self.send_update(&message).await;
    }

    async fn send_update(&self, message: &str) {
        if let Err(e) = self.services.sink.update(message).await {
            debug!(session = %self.id, error = %e, "progress update failed");
        }
    }

    async fn send_notify(&self, message: &str) {
        if let Err(e) = self
            .services
            .sink
            .notify(self.request.user_id, message)
            .await
        {
            debug!(session = %self.id, error = %e, "completion notice failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures_util::StreamExt;

    use crate::services::{ResolvedAttachment, UploadHandle};
    use crate::source::ByteSource;
    use crate::types::{MessageRef, StorageUsage};

    struct MockQuota {
        ok: bool,
        increments: Mutex<Vec<i64>>,
    }

    impl MockQuota {
        fn allowing() -> Self {
            Self {
                ok: true,
                increments: Mutex::new(Vec::new()),
            }
        }

        fn exhausted() -> Self {
            Self {
                ok: false,
                increments: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QuotaService for MockQuota {
        async fn quota_ok(&self, _user_id: i64) -> Result<bool, RelayError> {
            Ok(self.ok)
        }

        async fn quota_increment(&self, user_id: i64) -> Result<(), RelayError> {
            self.increments.lock().unwrap().push(user_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockStore {
        records: Mutex<Vec<UploadRecord>>,
        origin: Option<MessageRef>,
    }

    #[async_trait]
    impl TransferStore for MockStore {
        async fn record_transfer(&self, record: &UploadRecord) -> Result<i64, RelayError> {
            let mut records = self.records.lock().unwrap();
            records.push(record.clone());
            Ok(records.len() as i64)
        }

        async fn find_transfer(&self, _content_id: &str) -> Result<Option<MessageRef>, RelayError> {
            Ok(self.origin)
        }
    }

    #[derive(Default)]
    struct MockSink {
        updates: Mutex<Vec<String>>,
        notices: Mutex<Vec<(i64, String)>>,
        failing: bool,
    }

    #[async_trait]
    impl ProgressSink for MockSink {
        async fn update(&self, text: &str) -> Result<(), RelayError> {
            self.updates.lock().unwrap().push(text.to_string());
            if self.failing {
                return Err(RelayError::DestinationWrite(
                    "message is not modified".to_string(),
                ));
            }
            Ok(())
        }

        async fn notify(&self, user_id: i64, text: &str) -> Result<(), RelayError> {
            self.notices
                .lock()
                .unwrap()
                .push((user_id, text.to_string()));
            if self.failing {
                return Err(RelayError::DestinationWrite("blocked".to_string()));
            }
            Ok(())
        }
    }

    struct MockUpload {
        name: String,
        received: u64,
        total: u64,
        fail_after: Option<u64>,
    }

    #[async_trait]
    impl UploadHandle for MockUpload {
        async fn next_chunk(&mut self, data: Bytes) -> Result<UploadStep, RelayError> {
            if let Some(limit) = self.fail_after {
                if self.received + data.len() as u64 > limit {
                    return Err(RelayError::DestinationWrite(
                        "storage quota exceeded".to_string(),
                    ));
                }
            }
            self.received += data.len() as u64;
            if self.received >= self.total {
                Ok(UploadStep::Complete(StoredFile {
                    id: "stored-1".to_string(),
                    name: self.name.clone(),
                }))
            } else {
                Ok(UploadStep::Progress {
                    bytes_sent: self.received,
                })
            }
        }
    }

    struct MockBackend {
        expected_total: u64,
        fail_after: Option<u64>,
        usage: Option<StorageUsage>,
        folder: Option<String>,
        uploads_created: AtomicUsize,
    }

    impl MockBackend {
        fn accepting(expected_total: u64) -> Self {
            Self {
                expected_total,
                fail_after: None,
                usage: None,
                folder: None,
                uploads_created: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StorageBackend for MockBackend {
        async fn storage_usage(&self) -> Result<Option<StorageUsage>, RelayError> {
            Ok(self.usage)
        }

        async fn folder_name(&self, _folder_id: &str) -> Result<Option<String>, RelayError> {
            Ok(self.folder.clone())
        }

        async fn create_resumable_upload(
            &self,
            name: &str,
            _parent_folder_id: &str,
            _content_type: &str,
        ) -> Result<Box<dyn UploadHandle>, RelayError> {
            self.uploads_created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockUpload {
                name: name.to_string(),
                received: 0,
                total: self.expected_total,
                fail_after: self.fail_after,
            }))
        }
    }

    struct MockFetcher;

    #[async_trait]
    impl AttachmentFetcher for MockFetcher {
        async fn resolve_fetch_url(
            &self,
            attachment_id: &str,
            _origin: Option<MessageRef>,
        ) -> Result<ResolvedAttachment, RelayError> {
            Ok(ResolvedAttachment {
                fetch_url: format!("https://files.example/{attachment_id}"),
                declared_size: None,
            })
        }
    }

    struct MockHttp {
        data: Vec<u8>,
        declared: Option<u64>,
    }

    #[async_trait]
    impl HttpFetch for MockHttp {
        async fn get(&self, _url: &str) -> Result<ByteSource, RelayError> {
            Ok(ByteSource::from_bytes(self.data.clone(), self.declared))
        }
    }

    /// Serves 1 MiB frames and cancels the token partway through.
    struct CancellingHttp {
        frames: usize,
        cancel_at: usize,
        token: CancellationToken,
    }

    #[async_trait]
    impl HttpFetch for CancellingHttp {
        async fn get(&self, _url: &str) -> Result<ByteSource, RelayError> {
            let token = self.token.clone();
            let cancel_at = self.cancel_at;
            let stream = futures_util::stream::iter(0..self.frames).map(move |i| {
                if i == cancel_at {
                    token.cancel();
                }
                Ok(Bytes::from(vec![0u8; 1024 * 1024]))
            });
            Ok(ByteSource::new(stream.boxed(), Some(self.frames as u64 * 1024 * 1024)))
        }
    }

    struct Fixture {
        quota: Arc<MockQuota>,
        store: Arc<MockStore>,
        sink: Arc<MockSink>,
        backend: Arc<MockBackend>,
    }

    impl Fixture {
        fn services(&self, http: Arc<dyn HttpFetch>) -> Services {
            Services {
                quota: self.quota.clone(),
                store: self.store.clone(),
                sink: self.sink.clone(),
                backend: self.backend.clone(),
                fetcher: Arc::new(MockFetcher),
                http,
            }
        }

        fn records(&self) -> Vec<UploadRecord> {
            self.store.records.lock().unwrap().clone()
        }

        fn updates(&self) -> Vec<String> {
            self.sink.updates.lock().unwrap().clone()
        }
    }

    fn fixture(expected_total: u64) -> Fixture {
        Fixture {
            quota: Arc::new(MockQuota::allowing()),
            store: Arc::new(MockStore::default()),
            sink: Arc::new(MockSink::default()),
            backend: Arc::new(MockBackend::accepting(expected_total)),
        }
    }

    fn attachment_request(size: u64) -> TransferRequest {
        TransferRequest {
            user_id: 7,
            content: ContentRef::Attachment {
                id: "file-abc".to_string(),
                file_name: Some("video.mp4".to_string()),
                content_type: Some("video/mp4".to_string()),
                size_hint: Some(size),
                origin: None,
            },
            dest_folder_id: "folder-1".to_string(),
            notify_on_complete: false,
        }
    }

    fn session(request: TransferRequest, services: Services, dir: &Path) -> TransferSession {
        TransferSession::new(request, services)
            .with_staging_dir(dir)
            .with_progress_interval(Duration::ZERO)
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn attachment_transfer_completes_and_records_once() {
        let size = 10 * 1024 * 1024;
        let fx = fixture(size);
        let http = Arc::new(MockHttp {
            data: vec![0xA5; size as usize],
            declared: Some(size),
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let outcome = session(attachment_request(size), fx.services(http), dir.path())
            .run(&gate)
            .await;

        let stored = match outcome {
            TransferOutcome::Complete(stored) => stored,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(stored.name, "video.mp4");

        let records = fx.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Success);
        assert_eq!(records[0].size, size);
        assert_eq!(records[0].file_name, "video.mp4");
        assert_eq!(records[0].content_id, "file-abc");
        assert!(records[0].error.is_none());

        assert_eq!(*fx.quota.increments.lock().unwrap(), vec![7]);
        assert!(dir_is_empty(dir.path()), "staging area must be removed");
        assert!(fx
            .updates()
            .last()
            .unwrap()
            .contains("Upload complete: video.mp4"));
    }

    #[tokio::test]
    async fn cancellation_mid_staging_leaves_no_trace() {
        let fx = fixture(6 * 1024 * 1024);
        let token = CancellationToken::new();
        let http = Arc::new(CancellingHttp {
            frames: 6,
            cancel_at: 2,
            token: token.clone(),
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let outcome = session(
            attachment_request(6 * 1024 * 1024),
            fx.services(http),
            dir.path(),
        )
        .with_cancel_token(token)
        .run(&gate)
        .await;

        assert!(matches!(outcome, TransferOutcome::Cancelled));
        assert!(fx.records().is_empty(), "cancellation writes no record");
        assert!(fx.quota.increments.lock().unwrap().is_empty());
        assert!(dir_is_empty(dir.path()));
        assert!(fx.updates().last().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn quota_rejection_fails_before_any_work() {
        let fx = Fixture {
            quota: Arc::new(MockQuota::exhausted()),
            ..fixture(1024)
        };
        let http = Arc::new(MockHttp {
            data: vec![0; 1024],
            declared: Some(1024),
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let outcome = session(attachment_request(1024), fx.services(http), dir.path())
            .run(&gate)
            .await;

        assert!(matches!(
            outcome,
            TransferOutcome::Failed(RelayError::QuotaExceeded)
        ));
        assert!(fx.records().is_empty());
        assert_eq!(fx.backend.uploads_created.load(Ordering::SeqCst), 0);
        assert!(dir_is_empty(dir.path()), "no staging area was created");
    }

    #[tokio::test]
    async fn unknown_length_url_degrades_and_records_true_size() {
        let size = 3 * 1024 * 1024;
        let fx = fixture(size);
        let http = Arc::new(MockHttp {
            data: vec![0x42; size as usize],
            declared: None,
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let request = TransferRequest {
            user_id: 7,
            content: ContentRef::Url("https://example.com/archive.tar.gz".to_string()),
            dest_folder_id: "folder-1".to_string(),
            notify_on_complete: false,
        };
        let outcome = session(request, fx.services(http), dir.path())
            .run(&gate)
            .await;

        assert!(matches!(outcome, TransferOutcome::Complete(_)));

        let updates = fx.updates();
        assert!(
            updates
                .iter()
                .any(|u| u.contains("Progress: unknown") && u.contains("of Unknown")),
            "staging progress must render unknown totals"
        );

        let records = fx.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size, size, "record carries the measured size");
        assert_eq!(records[0].file_name, "archive.tar.gz");
    }

    #[tokio::test]
    async fn backend_rejection_fails_and_records_failure() {
        let size = 5 * 1024 * 1024;
        let fx = Fixture {
            backend: Arc::new(MockBackend {
                expected_total: size,
                fail_after: Some(2 * 1024 * 1024),
                usage: None,
                folder: None,
                uploads_created: AtomicUsize::new(0),
            }),
            ..fixture(size)
        };
        let http = Arc::new(MockHttp {
            data: vec![0; size as usize],
            declared: Some(size),
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let outcome = session(attachment_request(size), fx.services(http), dir.path())
            .run(&gate)
            .await;

        assert!(matches!(
            outcome,
            TransferOutcome::Failed(RelayError::DestinationWrite(_))
        ));

        let records = fx.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Failed);
        assert_eq!(records[0].size, size, "staging completed before the failure");
        assert!(records[0]
            .error
            .as_deref()
            .unwrap()
            .contains("storage quota exceeded"));
        assert!(fx.quota.increments.lock().unwrap().is_empty());
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn unsupported_content_is_rejected_without_record() {
        let fx = fixture(1024);
        let http = Arc::new(MockHttp {
            data: Vec::new(),
            declared: None,
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let request = TransferRequest {
            user_id: 7,
            content: ContentRef::Url("ftp://example.com/a.iso".to_string()),
            dest_folder_id: "folder-1".to_string(),
            notify_on_complete: false,
        };
        let outcome = session(request, fx.services(http), dir.path())
            .run(&gate)
            .await;

        assert!(matches!(
            outcome,
            TransferOutcome::Failed(RelayError::UnsupportedContent(_))
        ));
        assert!(fx.records().is_empty());
    }

    #[tokio::test]
    async fn insufficient_space_rejects_known_size() {
        let fx = Fixture {
            backend: Arc::new(MockBackend {
                expected_total: 0,
                fail_after: None,
                usage: Some(StorageUsage {
                    limit: 100 * 1024 * 1024,
                    usage: 99 * 1024 * 1024,
                }),
                folder: None,
                uploads_created: AtomicUsize::new(0),
            }),
            ..fixture(0)
        };
        let http = Arc::new(MockHttp {
            data: Vec::new(),
            declared: None,
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let outcome = session(
            attachment_request(50 * 1024 * 1024),
            fx.services(http),
            dir.path(),
        )
        .run(&gate)
        .await;

        assert!(matches!(
            outcome,
            TransferOutcome::Failed(RelayError::InsufficientSpace { .. })
        ));
        assert!(fx.records().is_empty());
    }

    #[tokio::test]
    async fn low_space_warns_but_transfer_proceeds() {
        let size = 128 * 1024;
        let fx = Fixture {
            backend: Arc::new(MockBackend {
                expected_total: size,
                fail_after: None,
                usage: Some(StorageUsage {
                    limit: 100 * 1024 * 1024 * 1024,
                    usage: 95 * 1024 * 1024 * 1024,
                }),
                folder: Some("Backups".to_string()),
                uploads_created: AtomicUsize::new(0),
            }),
            ..fixture(size)
        };
        let http = Arc::new(MockHttp {
            data: vec![0; size as usize],
            declared: Some(size),
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let outcome = session(attachment_request(size), fx.services(http), dir.path())
            .run(&gate)
            .await;

        assert!(matches!(outcome, TransferOutcome::Complete(_)));
        let notices = fx.sink.notices.lock().unwrap().clone();
        assert!(notices.iter().any(|(_, t)| t.contains("almost full")));
        assert!(fx
            .updates()
            .iter()
            .any(|u| u.contains("Uploading to: Backups")));
    }

    #[tokio::test]
    async fn sink_failures_never_change_the_outcome() {
        let size = 256 * 1024;
        let fx = Fixture {
            sink: Arc::new(MockSink {
                failing: true,
                ..MockSink::default()
            }),
            ..fixture(size)
        };
        let http = Arc::new(MockHttp {
            data: vec![0; size as usize],
            declared: Some(size),
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let outcome = session(attachment_request(size), fx.services(http), dir.path())
            .run(&gate)
            .await;

        assert!(matches!(outcome, TransferOutcome::Complete(_)));
        assert_eq!(fx.records().len(), 1);
    }

    #[tokio::test]
    async fn completion_notice_follows_the_toggle() {
        let size = 64 * 1024;
        let fx = fixture(size);
        let http = Arc::new(MockHttp {
            data: vec![0; size as usize],
            declared: Some(size),
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let mut request = attachment_request(size);
        request.notify_on_complete = true;
        let registry = Arc::new(SessionRegistry::new());
        let outcome = session(request, fx.services(http), dir.path())
            .with_registry(registry.clone())
            .run(&gate)
            .await;

        assert!(matches!(outcome, TransferOutcome::Complete(_)));
        let notices = fx.sink.notices.lock().unwrap().clone();
        assert!(notices.iter().any(|(u, t)| *u == 7 && t.contains("Upload complete")));
        assert_eq!(registry.count(), 0, "session must deregister on exit");
    }

    /// Resolver that hands back an already-staged file, the shape media
    /// extraction produces.
    struct StagedResolver {
        path: PathBuf,
    }

    #[async_trait]
    impl SourceResolver for StagedResolver {
        async fn open(&self) -> Result<ResolvedSource, RelayError> {
            Ok(ResolvedSource::Staged {
                path: self.path.clone(),
                file_name: "clip.mp4".to_string(),
                content_type: None,
            })
        }
    }

    #[tokio::test]
    async fn prestaged_file_skips_the_staging_loop() {
        let size = 2 * 1024 * 1024;
        let fx = fixture(size);
        let http = Arc::new(MockHttp {
            data: Vec::new(),
            declared: None,
        });
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("clip.mp4");
        std::fs::write(&staged, vec![0x11; size as usize]).unwrap();
        let gate = ConcurrencyGate::new();

        let request = TransferRequest {
            user_id: 7,
            content: ContentRef::Url("https://youtube.com/watch?v=abc".to_string()),
            dest_folder_id: "folder-1".to_string(),
            notify_on_complete: false,
        };
        let stage_dir = tempfile::tempdir().unwrap();
        let outcome = session(request, fx.services(http), stage_dir.path())
            .with_resolver(Box::new(StagedResolver { path: staged }))
            .run(&gate)
            .await;

        assert!(matches!(outcome, TransferOutcome::Complete(_)));
        let records = fx.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size, size);
        assert_eq!(records[0].file_name, "clip.mp4");
    }

    #[tokio::test]
    async fn empty_source_fails_with_fetch_error() {
        let fx = fixture(0);
        let http = Arc::new(MockHttp {
            data: Vec::new(),
            declared: Some(0),
        });
        let dir = tempfile::tempdir().unwrap();
        let gate = ConcurrencyGate::new();

        let outcome = session(attachment_request(0), fx.services(http), dir.path())
            .run(&gate)
            .await;

        let err = match outcome {
            TransferOutcome::Failed(err) => err,
            other => panic!("expected failure, got {other:?}"),
        };
        assert!(matches!(err, RelayError::SourceFetch(_)));

        // Staging had begun, so the failure is on the record.
        let records = fx.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Failed);
    }
}
