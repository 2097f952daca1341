//! `GET /files/{*key}`: serves objects held by the local filesystem backend.
//!
//! Direct URLs are served as is. When a request carries `expires` and
//! `signature` and a signing secret is configured, the signature must verify.

use crate::{
    errors::AppError,
    models::file_object::ProviderType,
    state::AppState,
    storage::{StorageError, local::verify_signed_path},
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, header},
    response::Response,
};
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: Option<i64>,
    pub signature: Option<String>,
}

pub async fn serve_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<SignedQuery>,
) -> Result<Response, AppError> {
    if let (Some(secret), Some(signature)) = (&state.local_signing_secret, q.signature.as_deref()) {
        let expires = q
            .expires
            .ok_or_else(|| StorageError::Unauthorized("signed URL is missing `expires`".into()))?;
        verify_signed_path(secret, &key, expires, signature, Utc::now())?;
    }

    let backend = state
        .media
        .registry()
        .provider(ProviderType::Local)
        .await
        .map_err(|_| AppError::not_found("local storage is not enabled"))?;
    let (stream, object) = backend.download(&key).await?;

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size));
    if let Some(etag) = object.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&object.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    Ok(response)
}
