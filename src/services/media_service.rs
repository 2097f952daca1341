//! MediaService: the upload pipeline and owner-scoped media records.
//!
//! Bytes live in whichever backend the caller picked; SQLite keeps one row per
//! upload pointing at `(provider, key)`. A row is written only after the
//! backend confirmed the object, and removed only after the backend delete
//! succeeded, so a record never points at bytes that were never stored.
//! Rows may share a key; the object goes with the last of them.

use crate::{
    models::{
        file_object::{FileObject, ProviderType, UploadOptions},
        media::{Media, MediaType, Pagination},
    },
    storage::{ByteStream, StorageError, StorageProvider, registry::ProviderRegistry},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media `{0}` not found")]
    NotFound(Uuid),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// Source of "now" for storage keys and record timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A file as received from the client.
pub struct UploadFile {
    /// Name supplied by the client; sanitized before it becomes part of a key.
    pub file_name: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub body: ByteStream,
    pub metadata: HashMap<String, String>,
}

const MEDIA_COLUMNS: &str = "id, user_id, file_name, file_path, file_size, media_type, \
     content_type, provider, public_url, created_at, updated_at";

#[derive(Clone)]
pub struct MediaService {
    db: Arc<SqlitePool>,
    registry: Arc<ProviderRegistry>,
    default_provider: ProviderType,
    clock: Clock,
}

impl MediaService {
    pub fn new(
        db: Arc<SqlitePool>,
        registry: Arc<ProviderRegistry>,
        default_provider: ProviderType,
    ) -> Self {
        Self {
            db,
            registry,
            default_provider,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn default_provider(&self) -> ProviderType {
        self.default_provider
    }

    /// Store `file` for `user_id` and record it.
    ///
    /// `provider` falls back to the configured default; `media_type` may be a
    /// media-type word or a MIME type and overrides detection.
    pub async fn upload(
        &self,
        user_id: &str,
        file: UploadFile,
        provider: Option<&str>,
        media_type: Option<&str>,
    ) -> MediaResult<Media> {
        ensure_user_id(user_id)?;
        let provider_type = match provider.map(str::trim).filter(|p| !p.is_empty()) {
            Some(name) => name
                .parse::<ProviderType>()
                .map_err(|err| MediaError::InvalidArgument(err.to_string()))?,
            None => self.default_provider,
        };
        let backend = self.registry.provider(provider_type).await?;

        let now = (self.clock)();
        let kind = classify_media(media_type, file.content_type.as_deref(), &file.file_name);
        let key = build_key(user_id, kind, now, &file.file_name);
        let options = UploadOptions {
            content_type: file.content_type.clone(),
            metadata: file.metadata,
            acl: None,
        };

        debug!(user_id, key = %key, provider = %provider_type, size = file.size, "uploading media");
        let uploaded = backend.upload(&key, file.body, file.size, &options).await?;
        let object = match backend.get_object(&uploaded.key).await {
            Ok(object) => object,
            Err(err) => {
                warn!(key = %uploaded.key, "metadata read-back failed, using upload result: {}", err);
                uploaded
            }
        };

        let media = Media {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            file_name: file.file_name,
            file_path: object.key.clone(),
            file_size: object.size as i64,
            media_type: kind,
            content_type: object.content_type.clone(),
            provider: backend.provider_type(),
            public_url: object.url.clone(),
            created_at: now,
            updated_at: now,
        };

        if let Err(err) = self.insert(&media).await {
            // Without a row the bytes are unreachable, unless an earlier
            // upload of the same key still points at them.
            match self.references(media.provider, &object.key, None).await {
                Ok(0) | Err(_) => {
                    if let Err(cleanup) = backend.delete(&object.key).await {
                        warn!(key = %object.key, "failed to remove orphaned object: {}", cleanup);
                    }
                }
                Ok(count) => {
                    debug!(key = %object.key, count, "object still referenced, keeping it");
                }
            }
            return Err(err.into());
        }

        info!(id = %media.id, user_id, provider = %media.provider, "media stored");
        Ok(media)
    }

    async fn insert(&self, media: &Media) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO media (
                id, user_id, file_name, file_path, file_size, media_type,
                content_type, provider, public_url, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(media.id)
        .bind(&media.user_id)
        .bind(&media.file_name)
        .bind(&media.file_path)
        .bind(media.file_size)
        .bind(media.media_type)
        .bind(&media.content_type)
        .bind(media.provider)
        .bind(&media.public_url)
        .bind(media.created_at)
        .bind(media.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Records other than `exclude` pointing at `key` on `provider`. Uploads
    /// of the same name on the same day share one backend object.
    async fn references(
        &self,
        provider: ProviderType,
        key: &str,
        exclude: Option<Uuid>,
    ) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM media WHERE provider = ? AND file_path = ? AND id IS NOT ?",
        )
        .bind(provider)
        .bind(key)
        .bind(exclude)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    /// Newest-first page of the user's media.
    pub async fn list(
        &self,
        user_id: &str,
        page: Option<u32>,
        page_size: Option<u32>,
    ) -> MediaResult<(Pagination, Vec<Media>)> {
        let (page, page_size) = Pagination::normalize(page, page_size);
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM media WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&*self.db)
            .await?;

        let offset = (page as i64 - 1) * page_size as i64;
        let items = sqlx::query_as::<_, Media>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE user_id = ?
             ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        ))
        .bind(user_id)
        .bind(page_size as i64)
        .bind(offset)
        .fetch_all(&*self.db)
        .await?;

        Ok((Pagination::new(page, page_size, total.max(0) as u64), items))
    }

    /// Fetch one record. Records owned by someone else are reported as missing.
    pub async fn get(&self, user_id: &str, id: Uuid) -> MediaResult<Media> {
        sqlx::query_as::<_, Media>(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE id = ? AND user_id = ?"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => MediaError::NotFound(id),
            other => MediaError::Database(other),
        })
    }

    /// Remove the backend object, then the record. If the backend refuses,
    /// the record stays so the delete can be retried. An object still
    /// referenced by another record is left in place.
    pub async fn delete(&self, user_id: &str, id: Uuid) -> MediaResult<()> {
        let media = self.get(user_id, id).await?;
        let backend = self.backend_for(&media).await?;
        let shared = self
            .references(media.provider, &media.file_path, Some(id))
            .await?;
        if shared == 0 {
            backend.delete(&media.file_path).await?;
        } else {
            debug!(id = %id, key = %media.file_path, shared, "object shared, keeping bytes");
        }

        sqlx::query("DELETE FROM media WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&*self.db)
            .await?;
        info!(id = %id, user_id, provider = %media.provider, "media deleted");
        Ok(())
    }

    /// Open the stored bytes of a record.
    pub async fn download(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> MediaResult<(Media, ByteStream, FileObject)> {
        let media = self.get(user_id, id).await?;
        let backend = self.backend_for(&media).await?;
        let (stream, object) = backend.download(&media.file_path).await?;
        Ok((media, stream, object))
    }

    /// Best-effort signed URL; failures are logged and yield `None`.
    pub async fn signed_url(&self, media: &Media, ttl: Duration) -> Option<String> {
        let backend = match self.backend_for(media).await {
            Ok(backend) => backend,
            Err(err) => {
                warn!(id = %media.id, "no backend for signed url: {}", err);
                return None;
            }
        };
        match backend.get_signed_url(&media.file_path, ttl).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(id = %media.id, provider = %media.provider, "signing failed: {}", err);
                None
            }
        }
    }

    async fn backend_for(&self, media: &Media) -> MediaResult<Arc<dyn StorageProvider>> {
        Ok(self.registry.provider(media.provider).await?)
    }
}

fn ensure_user_id(user_id: &str) -> MediaResult<()> {
    if user_id.trim().is_empty() {
        return Err(MediaError::InvalidArgument("user id must not be empty".into()));
    }
    if matches!(user_id, "." | "..")
        || user_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(MediaError::InvalidArgument(format!(
            "user id `{}` cannot be used in a storage key",
            user_id
        )));
    }
    Ok(())
}

/// Decide the media type: explicit hint, then the declared content type's
/// primary component, then the file extension.
pub fn classify_media(hint: Option<&str>, content_type: Option<&str>, file_name: &str) -> MediaType {
    if let Some(kind) = hint.and_then(media_type_from_word_or_mime) {
        return kind;
    }
    if let Some(kind) = content_type.and_then(media_type_from_mime) {
        return kind;
    }
    let ext = file_name
        .rsplit(['/', '\\'])
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    media_type_for_extension(&ext)
}

fn media_type_from_word_or_mime(hint: &str) -> Option<MediaType> {
    hint.parse::<MediaType>()
        .ok()
        .or_else(|| media_type_from_mime(hint))
}

fn media_type_from_mime(mime: &str) -> Option<MediaType> {
    let (primary, _) = mime.trim().split_once('/')?;
    match primary.to_ascii_lowercase().as_str() {
        "image" => Some(MediaType::Image),
        "video" => Some(MediaType::Video),
        "audio" => Some(MediaType::Audio),
        _ => None,
    }
}

fn media_type_for_extension(ext: &str) -> MediaType {
    match ext {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "svg" => MediaType::Image,
        "mp4" | "avi" | "mov" | "wmv" | "flv" | "webm" | "mkv" => MediaType::Video,
        "mp3" | "wav" | "flac" | "aac" | "ogg" | "m4a" => MediaType::Audio,
        "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" => MediaType::Document,
        _ => MediaType::Other,
    }
}

/// Reduce a client-supplied name to a single safe path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    match cleaned.trim() {
        "" | "." | ".." => "file".to_string(),
        _ => cleaned,
    }
}

/// `{user}/{media_type}/{YYYYMMDD}/{file}`
pub fn build_key(user_id: &str, kind: MediaType, at: DateTime<Utc>, file_name: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        user_id,
        kind,
        at.format("%Y%m%d"),
        sanitize_file_name(file_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::StorageConfig, db::memory_pool, storage::memory::MemoryProvider};
    use bytes::Bytes;
    use chrono::TimeZone;
    use futures::{StreamExt, stream};
    use std::sync::atomic::Ordering;

    struct Harness {
        service: MediaService,
        local: Arc<MemoryProvider>,
        db: Arc<SqlitePool>,
    }

    async fn harness() -> Harness {
        let local = Arc::new(MemoryProvider::new(ProviderType::Local));
        let registry = ProviderRegistry::new(StorageConfig::default())
            .register(local.clone())
            .register(Arc::new(MemoryProvider::new(ProviderType::S3)));
        let db = Arc::new(memory_pool().await);
        let fixed = Utc.with_ymd_and_hms(2024, 1, 2, 10, 30, 0).unwrap();
        let service = MediaService::new(db.clone(), Arc::new(registry), ProviderType::Local)
            .with_clock(Arc::new(move || fixed));
        Harness { service, local, db }
    }

    fn file(name: &str, data: &'static [u8]) -> UploadFile {
        UploadFile {
            file_name: name.to_string(),
            content_type: None,
            size: data.len() as u64,
            body: Box::pin(stream::iter(vec![Ok(Bytes::from_static(data))])),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn upload_stores_bytes_and_record() {
        let h = harness().await;
        let media = h
            .service
            .upload("U1", file("a.txt", b"0123456789"), None, None)
            .await
            .unwrap();

        assert_eq!(media.file_path, "U1/other/20240102/a.txt");
        assert_eq!(media.file_size, 10);
        assert_eq!(media.media_type, MediaType::Other);
        assert_eq!(media.provider, ProviderType::Local);
        assert_eq!(media.content_type, "text/plain");
        assert_eq!(media.file_name, "a.txt");
        assert!(h.local.contains("U1/other/20240102/a.txt"));

        let stored = h.service.get("U1", media.id).await.unwrap();
        assert_eq!(stored, media);
    }

    #[tokio::test]
    async fn upload_honours_provider_and_type_hint() {
        let h = harness().await;
        let media = h
            .service
            .upload("U1", file("clip.bin", b"xyz"), Some("S3"), Some("video"))
            .await
            .unwrap();
        assert_eq!(media.provider, ProviderType::S3);
        assert_eq!(media.file_path, "U1/video/20240102/clip.bin");
        assert!(!h.local.contains(&media.file_path));
    }

    #[tokio::test]
    async fn upload_rejects_unknown_or_unconfigured_providers() {
        let h = harness().await;
        let err = h
            .service
            .upload("U1", file("a.txt", b"x"), Some("dropbox"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidArgument(_)));

        let err = h
            .service
            .upload("U1", file("a.txt", b"x"), Some("azure"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Storage(StorageError::InvalidArgument(_))));
        assert_eq!(h.local.len(), 0);
    }

    #[tokio::test]
    async fn upload_rejects_unsafe_user_ids() {
        let h = harness().await;
        for user in ["", "a/b", ".."] {
            let err = h
                .service
                .upload(user, file("a.txt", b"x"), None, None)
                .await
                .unwrap_err();
            assert!(matches!(err, MediaError::InvalidArgument(_)), "{user:?}");
        }
    }

    #[tokio::test]
    async fn failed_insert_removes_the_uploaded_object() {
        let h = harness().await;
        sqlx::query("DROP TABLE media").execute(&*h.db).await.unwrap();

        let err = h
            .service
            .upload("U1", file("a.txt", b"0123456789"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Database(_)));
        assert_eq!(h.local.len(), 0);
        assert_eq!(h.local.delete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shared_keys_survive_until_the_last_record_goes() {
        let h = harness().await;
        let first = h
            .service
            .upload("U1", file("a.txt", b"first"), None, None)
            .await
            .unwrap();
        let second = h
            .service
            .upload("U1", file("a.txt", b"second"), None, None)
            .await
            .unwrap();
        assert_eq!(first.file_path, second.file_path);

        h.service.delete("U1", first.id).await.unwrap();
        assert_eq!(h.local.delete_calls.load(Ordering::SeqCst), 0);
        let (_, stream, _) = h.service.download("U1", second.id).await.unwrap();
        let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"second");

        h.service.delete("U1", second.id).await.unwrap();
        assert_eq!(h.local.delete_calls.load(Ordering::SeqCst), 1);
        assert!(!h.local.contains(&second.file_path));
    }

    #[tokio::test]
    async fn failed_insert_keeps_an_object_other_records_use() {
        let h = harness().await;
        let kept = h
            .service
            .upload("U1", file("a.txt", b"first"), None, None)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_more BEFORE INSERT ON media \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&*h.db)
        .await
        .unwrap();

        let err = h
            .service
            .upload("U1", file("a.txt", b"again"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Database(_)));
        assert_eq!(h.local.delete_calls.load(Ordering::SeqCst), 0);
        assert!(h.local.contains(&kept.file_path));
        assert_eq!(h.service.get("U1", kept.id).await.unwrap().file_path, kept.file_path);
    }

    #[tokio::test]
    async fn records_are_scoped_to_their_owner() {
        let h = harness().await;
        let media = h
            .service
            .upload("U1", file("a.txt", b"x"), None, None)
            .await
            .unwrap();

        assert!(matches!(
            h.service.get("U2", media.id).await.unwrap_err(),
            MediaError::NotFound(_)
        ));
        assert!(matches!(
            h.service.delete("U2", media.id).await.unwrap_err(),
            MediaError::NotFound(_)
        ));
        let (pagination, items) = h.service.list("U2", None, None).await.unwrap();
        assert_eq!(pagination.total, 0);
        assert!(items.is_empty());
        assert!(h.local.contains(&media.file_path));
    }

    #[tokio::test]
    async fn delete_removes_backend_object_then_record() {
        let h = harness().await;
        let media = h
            .service
            .upload("U1", file("a.txt", b"x"), None, None)
            .await
            .unwrap();

        h.service.delete("U1", media.id).await.unwrap();
        assert!(!h.local.contains(&media.file_path));
        assert!(matches!(
            h.service.delete("U1", media.id).await.unwrap_err(),
            MediaError::NotFound(_)
        ));
        assert_eq!(h.local.delete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_delete_failure_keeps_the_record() {
        let h = harness().await;
        let media = h
            .service
            .upload("U1", file("a.txt", b"x"), None, None)
            .await
            .unwrap();
        h.local.fail_delete.store(true, Ordering::SeqCst);

        let err = h.service.delete("U1", media.id).await.unwrap_err();
        assert!(matches!(err, MediaError::Storage(StorageError::Unavailable(_))));
        assert!(h.service.get("U1", media.id).await.is_ok());
    }

    #[tokio::test]
    async fn list_paginates_newest_first() {
        let h = harness().await;
        for i in 0..25 {
            let name = format!("f{i:02}.png");
            h.service
                .upload("U1", file(&name, b"px"), None, None)
                .await
                .unwrap();
        }

        let (pagination, items) = h.service.list("U1", Some(3), Some(10)).await.unwrap();
        assert_eq!(pagination.total, 25);
        assert_eq!(pagination.total_pages, 3);
        assert_eq!(items.len(), 5);

        let (_, first) = h.service.list("U1", None, None).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].file_name, "f24.png");
        assert_eq!(first[0].media_type, MediaType::Image);
    }

    #[tokio::test]
    async fn download_and_signed_url_go_to_the_recorded_backend() {
        let h = harness().await;
        let media = h
            .service
            .upload("U1", file("a.txt", b"hello"), Some("s3"), None)
            .await
            .unwrap();

        let (record, mut stream, object) = h.service.download("U1", media.id).await.unwrap();
        assert_eq!(record.id, media.id);
        assert_eq!(object.size, 5);
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");

        let signed = h
            .service
            .signed_url(&media, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(signed.ends_with("?ttl=60"));
    }

    #[test]
    fn classification_order() {
        assert_eq!(classify_media(Some("audio"), Some("image/png"), "a.mp4"), MediaType::Audio);
        assert_eq!(classify_media(Some("image/jpeg"), None, "a.bin"), MediaType::Image);
        assert_eq!(classify_media(Some("nonsense"), Some("video/mp4"), "a.png"), MediaType::Video);
        assert_eq!(classify_media(None, Some("application/pdf"), "a.PDF"), MediaType::Document);
        assert_eq!(classify_media(None, None, "song.m4a"), MediaType::Audio);
        assert_eq!(classify_media(None, Some("text/plain"), "a.txt"), MediaType::Other);
        assert_eq!(classify_media(None, None, "README"), MediaType::Other);
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("bad\u{0}na\nme.txt"), "badname.txt");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name("dir/.."), "file");
        assert_eq!(sanitize_file_name("trailing/"), "file");
    }

    #[test]
    fn keys_embed_owner_type_and_day() {
        let at = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(
            build_key("U1", MediaType::Image, at, "../x.png"),
            "U1/image/20241231/x.png"
        );
    }
}
