//! S3-compatible backend (AWS S3, MinIO, R2, ...).
//!
//! Small uploads go out as a single PutObject. Anything larger than one part
//! is sent as a multipart upload that is aborted on any failure, so a
//! half-written object never becomes visible.

use super::{
    ByteStream, StorageError, StorageProvider, StorageResult, ensure_key_present, object_url,
    resolve_content_type,
};
use crate::{
    config::S3Config,
    models::file_object::{FileObject, ObjectAcl, ProviderType, UploadOptions},
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{
        BehaviorVersion, Builder, Credentials, Region, RequestChecksumCalculation,
        ResponseChecksumValidation,
    },
    error::{ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::ByteStream as S3Body,
    types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl},
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Part size for multipart uploads. S3 requires at least 5 MiB per part.
const PART_SIZE: usize = 8 * 1024 * 1024;
const MAX_PRESIGN: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub struct S3Provider {
    client: Client,
    bucket: String,
    base_url: String,
}

impl S3Provider {
    pub async fn new(config: &S3Config) -> StorageResult<Self> {
        if config.bucket.trim().is_empty() {
            return Err(StorageError::InvalidArgument("S3 bucket must be set".into()));
        }
        let endpoint = config
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty());
        if endpoint.is_none() && config.region.trim().is_empty() {
            return Err(StorageError::InvalidArgument(
                "S3 requires an endpoint or a region".into(),
            ));
        }
        let scheme = if config.use_ssl { "https" } else { "http" };

        let client = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "static");
                let mut builder = Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
                    .force_path_style(config.force_path_style);
                if let Some(endpoint) = endpoint {
                    builder = compatible_endpoint(builder, scheme, endpoint);
                }
                Client::from_conf(builder.build())
            }
            (None, None) => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                let mut builder =
                    aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.force_path_style);
                if let Some(endpoint) = endpoint {
                    builder = compatible_endpoint(builder, scheme, endpoint);
                }
                Client::from_conf(builder.build())
            }
            _ => {
                return Err(StorageError::InvalidArgument(
                    "S3 access key and secret key must be set together".into(),
                ));
            }
        };

        debug!(bucket = %config.bucket, endpoint = ?endpoint, "S3 client configured");
        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            base_url: public_base_url(config),
        })
    }

    fn url_for(&self, key: &str) -> String {
        object_url(&self.base_url, key)
    }

    async fn put_single(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        options: &UploadOptions,
    ) -> StorageResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(data.len() as i64)
            .body(S3Body::from(data));
        if !options.metadata.is_empty() {
            request = request.set_metadata(Some(options.metadata.clone()));
        }
        if let Some(acl) = canned_acl(options.acl) {
            request = request.acl(acl);
        }
        request
            .send()
            .await
            .map_err(|err| map_sdk_error(err, key))?;
        Ok(())
    }

    /// Multipart upload starting with an already-buffered first part.
    async fn put_multipart(
        &self,
        key: &str,
        first_part: Bytes,
        mut rest: ByteStream,
        content_type: &str,
        options: &UploadOptions,
    ) -> StorageResult<()> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type);
        if !options.metadata.is_empty() {
            create = create.set_metadata(Some(options.metadata.clone()));
        }
        if let Some(acl) = canned_acl(options.acl) {
            create = create.acl(acl);
        }
        let created = create.send().await.map_err(|err| map_sdk_error(err, key))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Unknown("S3 returned no upload id".into()))?
            .to_string();

        let result = async {
            let mut parts = Vec::new();
            let mut part_number = 1;
            parts.push(self.upload_part(key, &upload_id, part_number, first_part).await?);

            while let Some(chunk) = read_part(&mut rest).await? {
                part_number += 1;
                parts.push(self.upload_part(key, &upload_id, part_number, chunk).await?);
            }

            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|err| map_sdk_error(err, key))?;
            Ok::<(), StorageError>(())
        }
        .await;

        if let Err(err) = &result {
            warn!(key, upload_id, "aborting multipart upload: {}", err);
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(key, upload_id, "abort failed: {}", map_sdk_error(abort_err, key));
            }
        }
        result
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<CompletedPart> {
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(data.len() as i64)
            .body(S3Body::from(data))
            .send()
            .await
            .map_err(|err| map_sdk_error(err, key))?;
        Ok(CompletedPart::builder()
            .set_e_tag(uploaded.e_tag().map(str::to_string))
            .part_number(part_number)
            .build())
    }

    async fn head(&self, key: &str) -> StorageResult<FileObject> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, key))?;

        Ok(FileObject {
            key: key.to_string(),
            url: self.url_for(key),
            size: head.content_length().unwrap_or(0).max(0) as u64,
            content_type: head
                .content_type()
                .map(str::to_string)
                .unwrap_or_else(|| resolve_content_type(None, key)),
            last_modified: head
                .last_modified()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                .unwrap_or_else(Utc::now),
            etag: head.e_tag().map(|e| e.trim_matches('"').to_string()),
            provider: ProviderType::S3,
            signed_url: None,
        })
    }
}

/// Point the client at an S3-compatible store. Checksums are only sent when
/// an operation requires them; many such stores reject aws-chunked bodies.
fn compatible_endpoint(builder: Builder, scheme: &str, endpoint: &str) -> Builder {
    builder
        .endpoint_url(format!("{}://{}", scheme, endpoint))
        .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
        .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
}

/// Buffer up to one part worth of bytes. Returns `None` once the stream is
/// exhausted.
async fn read_part(body: &mut ByteStream) -> StorageResult<Option<Bytes>> {
    let mut buf = BytesMut::new();
    while buf.len() < PART_SIZE {
        match body.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(err)) => return Err(StorageError::from_io(err, "")),
            None => break,
        }
    }
    Ok((!buf.is_empty()).then(|| buf.freeze()))
}

fn canned_acl(acl: Option<ObjectAcl>) -> Option<ObjectCannedAcl> {
    match acl? {
        ObjectAcl::PublicRead => Some(ObjectCannedAcl::PublicRead),
        ObjectAcl::Private => Some(ObjectCannedAcl::Private),
    }
}

/// Direct-access prefix: path-style or virtual-host on a custom endpoint,
/// otherwise the regional AWS host.
fn public_base_url(config: &S3Config) -> String {
    let scheme = if config.use_ssl { "https" } else { "http" };
    match config.endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
        Some(endpoint) if config.force_path_style => {
            format!("{}://{}/{}", scheme, endpoint, config.bucket)
        }
        Some(endpoint) => format!("{}://{}.{}", scheme, config.bucket, endpoint),
        None => format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region),
    }
}

/// Translate SDK failures into the shared taxonomy.
fn map_sdk_error<E, R>(err: SdkError<E, R>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    if matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
    ) {
        return StorageError::Unavailable(format!("{:?}", err));
    }
    let message = err
        .message()
        .or(err.code())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:?}", err));
    classify_code(err.code(), key, message)
}

fn classify_code(code: Option<&str>, key: &str, message: String) -> StorageError {
    match code {
        Some("NoSuchKey" | "NotFound" | "NoSuchBucket") => StorageError::NotFound(key.to_string()),
        Some(
            "AccessDenied"
            | "Forbidden"
            | "InvalidAccessKeyId"
            | "SignatureDoesNotMatch"
            | "ExpiredToken"
            | "InvalidToken",
        ) => StorageError::Unauthorized(message),
        Some("InvalidArgument" | "InvalidBucketName" | "KeyTooLongError" | "EntityTooLarge") => {
            StorageError::InvalidArgument(message)
        }
        Some("SlowDown" | "ServiceUnavailable" | "InternalError" | "RequestTimeout") => {
            StorageError::Unavailable(message)
        }
        _ => StorageError::Unknown(message),
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    async fn upload(
        &self,
        key: &str,
        mut body: ByteStream,
        size: u64,
        options: &UploadOptions,
    ) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        let content_type = resolve_content_type(options.content_type.as_deref(), key);

        let first = read_part(&mut body).await?.unwrap_or_default();
        if first.len() < PART_SIZE {
            self.put_single(key, first, &content_type, options).await?;
        } else {
            self.put_multipart(key, first, body, &content_type, options)
                .await?;
        }

        debug!(provider = "s3", key, declared_size = size, "stored object");
        self.head(key).await
    }

    async fn download(&self, key: &str) -> StorageResult<(ByteStream, FileObject)> {
        ensure_key_present(key)?;
        let object = self.head(key).await?;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, key))?;
        let reader = response.body.into_async_read();
        Ok((Box::pin(ReaderStream::new(reader)), object))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        ensure_key_present(key)?;
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match map_sdk_error(err, key) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn get_url(&self, key: &str) -> StorageResult<String> {
        ensure_key_present(key)?;
        self.head(key).await.map(|object| object.url)
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        ensure_key_present(key)?;
        if expires_in.is_zero() || expires_in > MAX_PRESIGN {
            return Err(StorageError::InvalidArgument(
                "expiration must be between 1 second and 7 days".into(),
            ));
        }
        self.head(key).await?;
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|err| StorageError::InvalidArgument(err.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| map_sdk_error(err, key))?;
        Ok(presigned.uri().to_string())
    }

    async fn get_object(&self, key: &str) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        self.head(key).await
    }

    async fn check_health(&self) -> StorageResult<()> {
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, &self.bucket))?;
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::S3
    }
}
