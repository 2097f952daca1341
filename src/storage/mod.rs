//! Storage provider contract.
//!
//! Every backend implements [`StorageProvider`] and translates its native
//! failures into [`StorageError`]. Nothing above this module sees an SDK
//! error type.

use crate::models::file_object::{FileObject, ProviderType, UploadOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::Url;
use std::{
    io,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;

pub mod local;
pub mod registry;

#[cfg(feature = "s3")]
pub mod s3;

#[cfg(feature = "azure")]
pub mod azure;

#[cfg(feature = "firebase")]
pub mod firebase;

#[cfg(feature = "discord")]
pub mod discord;

#[cfg(test)]
pub(crate) mod memory;

/// The only failure vocabulary callers of a provider reason about.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("access denied: {0}")]
    Unauthorized(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Unknown(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// Map an I/O error raised while touching `key`.
    pub fn from_io(err: io::Error, key: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            io::ErrorKind::PermissionDenied => StorageError::Unauthorized(err.to_string()),
            io::ErrorKind::InvalidInput => StorageError::InvalidArgument(err.to_string()),
            io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => StorageError::Unavailable(err.to_string()),
            _ => StorageError::Unknown(err.to_string()),
        }
    }

    /// Map an HTTP status returned by a REST backend.
    pub fn from_status(status: u16, key: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => StorageError::NotFound(key.to_string()),
            401 | 403 => StorageError::Unauthorized(message),
            400 | 413 | 422 => StorageError::InvalidArgument(message),
            408 | 429 | 500..=599 => StorageError::Unavailable(message),
            _ => StorageError::Unknown(message),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A stream of object bytes. Whoever holds it owns the underlying connection
/// or file handle; dropping it releases them.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Uniform contract implemented by every storage backend.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store `size` bytes from `body` under `key`. Either the whole object
    /// becomes visible or nothing does.
    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        size: u64,
        options: &UploadOptions,
    ) -> StorageResult<FileObject>;

    /// Open the object for reading. Metadata is resolved before the stream is
    /// handed back.
    async fn download(&self, key: &str) -> StorageResult<(ByteStream, FileObject)>;

    /// Remove the object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn get_url(&self, key: &str) -> StorageResult<String>;

    /// Time-limited URL. Backends without native support return the direct
    /// URL, so callers must not assume the result expires.
    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String>;

    /// Metadata-only read.
    async fn get_object(&self, key: &str) -> StorageResult<FileObject>;

    /// Cheap, read-only reachability check.
    async fn check_health(&self) -> StorageResult<()>;

    fn provider_type(&self) -> ProviderType;
}

/// Reject keys no backend can address. Runs before any network call.
pub fn ensure_key_present(key: &str) -> StorageResult<()> {
    if key.trim().is_empty() {
        return Err(StorageError::InvalidArgument("object key must not be empty".into()));
    }
    Ok(())
}

/// Resolve the content type for an upload: caller hint, then an
/// extension-based guess, then `application/octet-stream`.
pub fn resolve_content_type(hint: Option<&str>, key: &str) -> String {
    hint.map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| content_type_for_path(key).to_string())
}

/// Guess a MIME type from a key's extension.
pub fn content_type_for_path(path: &str) -> &'static str {
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Append `key` to `base`, percent-encoding each `/`-separated segment so
/// characters like `#`, `?` and `%` stay part of the path.
pub fn object_url(base: &str, key: &str) -> String {
    let base = base.trim_end_matches('/');
    let Ok(mut scratch) = Url::parse("http://localhost/") else {
        return format!("{}/{}", base, key);
    };
    if let Ok(mut segments) = scratch.path_segments_mut() {
        segments.clear().extend(key.split('/'));
    }
    format!("{}{}", base, scratch.path())
}

/// Last segment of a key, used as a download file name.
pub fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Wraps a [`ByteStream`] so it can be handed to client libraries that demand
/// `Sync` request bodies. The stream is only ever polled through `&mut self`,
/// so the mutex is never contended.
pub struct SyncByteStream(Mutex<ByteStream>);

impl SyncByteStream {
    pub fn new(inner: ByteStream) -> Self {
        Self(Mutex::new(inner))
    }
}

impl Stream for SyncByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = match self.get_mut().0.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.as_mut().poll_next(cx)
    }
}
