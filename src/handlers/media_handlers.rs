//! HTTP handlers for `/api/media`.
//!
//! Upload bodies are spooled to a temporary file so the backend receives an
//! exact size; downloads stream straight from the backend.

use crate::{
    errors::AppError,
    models::media::{Media, Pagination},
    services::media_service::UploadFile,
    state::AppState,
    storage::file_name_of,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, multipart::Field},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io,
    path::{Path as FsPath, PathBuf},
    time::Duration,
};
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Header carrying the authenticated caller.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Extract the caller's id. Authentication happens upstream.
pub fn user_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing X-User-Id header"))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct GetQuery {
    /// When set, the response carries a signed URL valid for this many seconds.
    pub signed_url_ttl: Option<u64>,
}

#[derive(Serialize)]
pub struct MediaList {
    pub data: Vec<Media>,
    pub pagination: Pagination,
}

#[derive(Serialize)]
pub struct MediaResponse {
    #[serde(flatten)]
    pub media: Media,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
}

/// Temporary upload file. `remove` deletes it; a spool dropped on an error
/// path is deleted by a spawned task instead.
struct Spool {
    path: Option<PathBuf>,
}

impl Spool {
    fn new() -> Self {
        Self::in_dir(&std::env::temp_dir())
    }

    fn in_dir(dir: &FsPath) -> Self {
        Self {
            path: Some(dir.join(format!("media-upload-{}", Uuid::new_v4()))),
        }
    }

    fn path(&self) -> &FsPath {
        self.path.as_deref().unwrap_or(FsPath::new(""))
    }

    async fn remove(mut self) {
        if let Some(path) = self.path.take() {
            remove_spool(path).await;
        }
    }
}

async fn remove_spool(path: PathBuf) {
    if let Err(err) = tokio::fs::remove_file(&path).await {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!("failed to remove upload spool {:?}: {}", path, err);
        }
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(remove_spool(path));
            }
            Err(_) => tracing::warn!("upload spool {:?} left behind: no runtime", path),
        }
    }
}

/// Copy one multipart field to `path`, returning the byte count.
async fn spool_field(field: &mut Field<'_>, path: &FsPath) -> Result<u64, AppError> {
    let mut file = File::create(path)
        .await
        .map_err(|err| AppError::internal(format!("creating upload spool: {}", err)))?;
    let mut size = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| AppError::new(err.status(), err.body_text()))?
    {
        size += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|err| AppError::internal(format!("writing upload spool: {}", err)))?;
    }
    file.flush()
        .await
        .map_err(|err| AppError::internal(format!("writing upload spool: {}", err)))?;
    Ok(size)
}

struct SpooledFile {
    spool: Spool,
    file_name: String,
    content_type: Option<String>,
    size: u64,
}

/// POST `/api/media`: multipart with a `file` part and optional `provider`
/// and `media_type` text parts.
pub async fn upload_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let user = user_id(&headers)?;
    let mut spooled: Option<SpooledFile> = None;
    let mut provider: Option<String> = None;
    let mut media_type: Option<String> = None;
    let mut metadata = HashMap::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::new(err.status(), err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let spool = Spool::new();
                let file_name = field.file_name().unwrap_or("file").to_string();
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .filter(|ct| ct != "application/octet-stream");
                let size = spool_field(&mut field, spool.path()).await?;
                spooled = Some(SpooledFile {
                    spool,
                    file_name,
                    content_type,
                    size,
                });
            }
            "provider" | "media_type" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::new(err.status(), err.body_text()))?;
                if name == "provider" {
                    provider = Some(value);
                } else {
                    media_type = Some(value);
                }
            }
            other => {
                if let Some(key) = other.strip_prefix("metadata.") {
                    let key = key.to_string();
                    let value = field
                        .text()
                        .await
                        .map_err(|err| AppError::new(err.status(), err.body_text()))?;
                    metadata.insert(key, value);
                }
            }
        }
    }

    let Some(spooled) = spooled else {
        return Err(AppError::bad_request("multipart body has no `file` part"));
    };
    let reader = File::open(spooled.spool.path())
        .await
        .map_err(|err| AppError::internal(format!("reopening upload spool: {}", err)))?;

    let result = state
        .media
        .upload(
            &user,
            UploadFile {
                file_name: spooled.file_name,
                content_type: spooled.content_type,
                size: spooled.size,
                body: Box::pin(ReaderStream::new(reader)),
                metadata,
            },
            provider.as_deref(),
            media_type.as_deref(),
        )
        .await;
    spooled.spool.remove().await;
    let media = result?;

    Ok((StatusCode::CREATED, Json(media)).into_response())
}

/// GET `/api/media?page=&page_size=`
pub async fn list_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> Result<Json<MediaList>, AppError> {
    let user = user_id(&headers)?;
    let (pagination, data) = state.media.list(&user, q.page, q.page_size).await?;
    Ok(Json(MediaList { data, pagination }))
}

/// GET `/api/media/{id}`
pub async fn get_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(q): Query<GetQuery>,
) -> Result<Json<MediaResponse>, AppError> {
    let user = user_id(&headers)?;
    let media = state.media.get(&user, id).await?;
    let signed_url = match q.signed_url_ttl.filter(|ttl| *ttl > 0) {
        Some(ttl) => {
            state
                .media
                .signed_url(&media, Duration::from_secs(ttl))
                .await
        }
        None => None,
    };
    Ok(Json(MediaResponse { media, signed_url }))
}

/// GET `/api/media/{id}/content`: streams the stored bytes.
pub async fn media_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let user = user_id(&headers)?;
    let (media, stream, object) = state.media.download(&user, id).await?;

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size));
    let disposition = format!(
        "inline; filename=\"{}\"",
        file_name_of(&media.file_path).replace('"', "")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

/// DELETE `/api/media/{id}`
pub async fn delete_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let user = user_id(&headers)?;
    state.media.delete(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn removed_spool_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::in_dir(dir.path());
        tokio::fs::write(spool.path(), b"payload").await.unwrap();
        let path = spool.path().to_path_buf();

        spool.remove().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropped_spool_is_cleaned_up_in_the_background() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::in_dir(dir.path());
        tokio::fs::write(spool.path(), b"payload").await.unwrap();
        let path = spool.path().to_path_buf();

        drop(spool);
        for _ in 0..50 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn removing_a_spool_that_was_never_written_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::in_dir(dir.path());
        spool.remove().await;
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
