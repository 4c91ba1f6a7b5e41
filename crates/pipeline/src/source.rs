//! Source resolution: turning a content reference into bytes to stage.
//!
//! Three interchangeable strategies sit behind [`SourceResolver`]:
//! attachment references resolved to a fetch URL just-in-time, direct URLs
//! streamed over HTTP, and streaming-site URLs handed to an external
//! extraction tool that materializes a complete local file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use tracing::debug;

use crate::error::RelayError;
use crate::services::{AttachmentFetcher, HttpFetch, TransferStore};
use crate::types::{ContentRef, MessageRef};

/// Fallback name when the source does not carry one.
pub const DEFAULT_FILE_NAME: &str = "UploadedFile";

/// Domains handled by the media-extraction tool instead of a raw fetch.
pub const STREAMING_SITES: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "dailymotion.com",
    "facebook.com",
    "twitter.com",
    "tiktok.com",
    "soundcloud.com",
    "bilibili.com",
    "twitch.tv",
    "instagram.com",
    "reddit.com",
    "rumble.com",
    "odysee.com",
];

/// `true` if the URL points at a recognized streaming/media site.
pub fn is_streaming_site(url: &str) -> bool {
    STREAMING_SITES.iter().any(|site| url.contains(site))
}

/// Which resolver strategy a content reference selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Attachment,
    DirectUrl,
    MediaExtraction,
}

/// Classifies a content reference, made once in `PREPARING`.
///
/// Anything that is neither an attachment nor an http(s) URL is rejected
/// as unsupported before any work starts.
pub fn select_source(content: &ContentRef) -> Result<SourceKind, RelayError> {
    match content {
        ContentRef::Attachment { .. } => Ok(SourceKind::Attachment),
        ContentRef::Url(url) if is_streaming_site(url) => Ok(SourceKind::MediaExtraction),
        ContentRef::Url(url) if url.starts_with("http://") || url.starts_with("https://") => {
            Ok(SourceKind::DirectUrl)
        }
        ContentRef::Url(url) => Err(RelayError::UnsupportedContent(format!(
            "not a fetchable URL: {url}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// ByteSource
// ---------------------------------------------------------------------------

/// A byte stream with an optional declared length.
///
/// Network streams deliver frames of arbitrary size; `read_chunk`
/// re-frames them into the sizes the chunk controller asks for, so the
/// adaptive loop sees exactly the chunk sizes it requested.
pub struct ByteSource {
    stream: BoxStream<'static, Result<Bytes, RelayError>>,
    buf: BytesMut,
    done: bool,
    /// Total length when known up front (e.g. `Content-Length`).
    pub declared_len: Option<u64>,
}

impl ByteSource {
    pub fn new(
        stream: BoxStream<'static, Result<Bytes, RelayError>>,
        declared_len: Option<u64>,
    ) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            done: false,
            declared_len,
        }
    }

    /// A source over in-memory bytes, mainly for tests and local content.
    pub fn from_bytes(data: Vec<u8>, declared_len: Option<u64>) -> Self {
        let frame = Bytes::from(data);
        Self::new(futures_util::stream::iter([Ok(frame)]).boxed(), declared_len)
    }

    /// Reads up to `size` bytes; returns an empty buffer at end of stream.
    pub async fn read_chunk(&mut self, size: usize) -> Result<Bytes, RelayError> {
        while self.buf.len() < size && !self.done {
            match self.stream.next().await {
                Some(Ok(frame)) => self.buf.extend_from_slice(&frame),
                Some(Err(e)) => return Err(e),
                None => self.done = true,
            }
        }
        let take = size.min(self.buf.len());
        Ok(self.buf.split_to(take).freeze())
    }
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// What a resolver produced: a live stream to stage, or a file the
/// extraction tool already materialized on disk.
pub enum ResolvedSource {
    Stream {
        source: ByteSource,
        file_name: String,
        content_type: Option<String>,
    },
    Staged {
        path: PathBuf,
        file_name: String,
        content_type: Option<String>,
    },
}

/// One strategy for producing the bytes of a transfer.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn open(&self) -> Result<ResolvedSource, RelayError>;
}

/// Resolves a platform attachment to a fetch URL immediately before
/// staging (the reference is short-lived and must not be cached).
pub struct AttachmentResolver {
    pub attachment_id: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub size_hint: Option<u64>,
    pub origin: Option<MessageRef>,
    pub fetcher: Arc<dyn AttachmentFetcher>,
    pub store: Arc<dyn TransferStore>,
    pub http: Arc<dyn HttpFetch>,
}

#[async_trait]
impl SourceResolver for AttachmentResolver {
    async fn open(&self) -> Result<ResolvedSource, RelayError> {
        // Recover chat coordinates for attachments that need the
        // privileged fetch channel. Best effort; a lookup failure only
        // means the fetcher works without them.
        let origin = match self.origin {
            Some(origin) => Some(origin),
            None => match self.store.find_transfer(&self.attachment_id).await {
                Ok(origin) => origin,
                Err(e) => {
                    debug!(attachment = %self.attachment_id, error = %e, "origin lookup failed");
                    None
                }
            },
        };

        let resolved = self
            .fetcher
            .resolve_fetch_url(&self.attachment_id, origin)
            .await?;
        let mut source = self.http.get(&resolved.fetch_url).await?;
        if source.declared_len.is_none() {
            source.declared_len = resolved.declared_size.or(self.size_hint);
        }

        Ok(ResolvedSource::Stream {
            source,
            file_name: self
                .file_name
                .clone()
                .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string()),
            content_type: self.content_type.clone(),
        })
    }
}

/// Streams an arbitrary URL; length comes from the response headers when
/// present, else stays unknown.
pub struct DirectUrlResolver {
    pub url: String,
    pub http: Arc<dyn HttpFetch>,
}

#[async_trait]
impl SourceResolver for DirectUrlResolver {
    async fn open(&self) -> Result<ResolvedSource, RelayError> {
        let source = self.http.get(&self.url).await?;
        Ok(ResolvedSource::Stream {
            source,
            file_name: file_name_from_url(&self.url),
            content_type: None,
        })
    }
}

/// Delegates a streaming-site URL to the extraction tool, which writes a
/// complete local file; staging then degenerates to "already staged".
pub struct MediaResolver {
    pub url: String,
    pub extractor: MediaExtractor,
    pub work_dir: PathBuf,
}

#[async_trait]
impl SourceResolver for MediaResolver {
    async fn open(&self) -> Result<ResolvedSource, RelayError> {
        let path = self.extractor.extract(&self.url, &self.work_dir).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());
        Ok(ResolvedSource::Staged {
            path,
            file_name,
            content_type: None,
        })
    }
}

/// Derives a file name from the last URL path segment, ignoring query and
/// fragment.
pub fn file_name_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let rest = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    let name = match rest.trim_end_matches('/').split_once('/') {
        Some((_, path)) => path.rsplit('/').next().unwrap_or(""),
        // Bare host, no path component to name the file after.
        None => "",
    };
    if name.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        name.to_string()
    }
}

// ---------------------------------------------------------------------------
// MediaExtractor
// ---------------------------------------------------------------------------

/// Runs the external best-quality media extraction tool.
///
/// The subprocess runs through `tokio::process`, so other sessions keep
/// receiving progress updates while it works.
#[derive(Debug, Clone)]
pub struct MediaExtractor {
    program: String,
}

impl Default for MediaExtractor {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl MediaExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Extracts `url` into `work_dir` and returns the materialized file.
    pub async fn extract(&self, url: &str, work_dir: &Path) -> Result<PathBuf, RelayError> {
        let template = work_dir.join("%(title)s.%(ext)s");
        let output = tokio::process::Command::new(&self.program)
            .arg("-f")
            .arg("bestvideo+bestaudio/best")
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--restrict-filenames")
            .arg("-o")
            .arg(&template)
            .arg(url)
            .output()
            .await
            .map_err(|e| {
                RelayError::SourceFetch(format!("failed to run {}: {e}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::SourceFetch(format!(
                "{} failed: {}",
                self.program,
                stderr.trim()
            )));
        }

        newest_file(work_dir).await?.ok_or_else(|| {
            RelayError::SourceFetch("extraction produced no output file".to_string())
        })
    }
}

/// Most recently modified regular file in `dir`, if any.
async fn newest_file(dir: &Path) -> Result<Option<PathBuf>, RelayError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

// ---------------------------------------------------------------------------
// HttpClient
// ---------------------------------------------------------------------------

/// Production [`HttpFetch`] backed by `reqwest` with streaming bodies.
pub struct HttpClient {
    client: reqwest::Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HttpFetch for HttpClient {
    async fn get(&self, url: &str) -> Result<ByteSource, RelayError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::SourceFetch(e.to_string()))?;
        let declared_len = resp.content_length();
        let stream = resp
            .bytes_stream()
            .map_err(|e| RelayError::SourceFetch(e.to_string()));
        Ok(ByteSource::new(stream.boxed(), declared_len))
    }
}
