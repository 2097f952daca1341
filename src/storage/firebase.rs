//! Firebase Storage backend, spoken to through the Cloud Storage JSON API.
//!
//! Every object lives under the configured app namespace; callers only ever
//! see the key below it.

use super::{
    ByteStream, StorageError, StorageProvider, StorageResult, SyncByteStream, ensure_key_present,
    resolve_content_type,
};
use crate::{
    config::FirebaseConfig,
    models::file_object::{FileObject, ObjectAcl, ProviderType, UploadOptions},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use google_cloud_storage::{
    client::{Client, ClientConfig, google_cloud_auth::credentials::CredentialsFile},
    http::{
        Error as GcsError,
        object_access_controls::PredefinedObjectAcl,
        objects::{
            Object,
            delete::DeleteObjectRequest,
            download::Range,
            get::GetObjectRequest,
            list::ListObjectsRequest,
            upload::{Media, UploadObjectRequest, UploadType},
        },
    },
    sign::{SignedURLMethod, SignedURLOptions},
};
use reqwest::Url;
use std::{io, time::Duration};
use tracing::debug;

const PUBLIC_HOST: &str = "https://firebasestorage.googleapis.com/v0/b/";
const MAX_SIGNED: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub struct FirebaseProvider {
    client: Client,
    bucket: String,
    namespace: String,
}

impl FirebaseProvider {
    pub async fn new(config: &FirebaseConfig) -> StorageResult<Self> {
        if config.bucket.trim().is_empty() {
            return Err(StorageError::InvalidArgument(
                "Firebase bucket must be set".into(),
            ));
        }

        let client_config = match (&config.emulator_host, &config.credentials_file) {
            (Some(host), _) => Ok(ClientConfig {
                storage_endpoint: format!("http://{}", host.trim_end_matches('/')),
                ..ClientConfig::default()
            }
            .anonymous()),
            (None, Some(path)) => {
                let credentials = CredentialsFile::new_from_file(path.to_string_lossy().into_owned())
                    .await
                    .map_err(|err| {
                        StorageError::InvalidArgument(format!(
                            "reading Firebase credentials {}: {}",
                            path.display(),
                            err
                        ))
                    })?;
                ClientConfig::default().with_credentials(credentials).await
            }
            (None, None) => ClientConfig::default().with_auth().await,
        }
        .map_err(|err| StorageError::Unauthorized(format!("Firebase auth: {}", err)))?;

        debug!(bucket = %config.bucket, namespace = %config.namespace, "Firebase client configured");
        Ok(Self {
            client: Client::new(client_config),
            bucket: config.bucket.clone(),
            namespace: config.namespace.trim_matches('/').to_string(),
        })
    }

    fn object_name(&self, key: &str) -> String {
        object_name(&self.namespace, key)
    }

    fn to_file_object(&self, key: &str, object: &Object) -> FileObject {
        FileObject {
            key: key.to_string(),
            url: public_url(&self.bucket, &object.name),
            size: object.size.max(0) as u64,
            content_type: object
                .content_type
                .clone()
                .unwrap_or_else(|| resolve_content_type(None, key)),
            last_modified: object
                .updated
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.unix_timestamp(), t.nanosecond()))
                .unwrap_or_else(Utc::now),
            etag: Some(object.etag.clone()).filter(|e| !e.is_empty()),
            provider: ProviderType::Firebase,
            signed_url: None,
        }
    }

    async fn fetch(&self, key: &str) -> StorageResult<FileObject> {
        let object = self
            .client
            .get_object(&GetObjectRequest {
                bucket: self.bucket.clone(),
                object: self.object_name(key),
                ..Default::default()
            })
            .await
            .map_err(|err| map_gcs_error(err, key))?;
        Ok(self.to_file_object(key, &object))
    }
}

fn object_name(namespace: &str, key: &str) -> String {
    if namespace.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", namespace, key)
    }
}

/// Firebase's download endpoint takes the full object name as one
/// percent-encoded path segment.
fn public_url(bucket: &str, name: &str) -> String {
    let Ok(mut url) = Url::parse(PUBLIC_HOST) else {
        return String::new();
    };
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(bucket).push("o").push(name);
    }
    url.set_query(Some("alt=media"));
    url.to_string()
}

fn map_gcs_error(err: GcsError, key: &str) -> StorageError {
    match err {
        GcsError::Response(response) => {
            StorageError::from_status(response.code, key, response.message)
        }
        GcsError::HttpClient(err) if err.is_timeout() || err.is_connect() => {
            StorageError::Unavailable(err.to_string())
        }
        GcsError::TokenSource(err) => StorageError::Unauthorized(err.to_string()),
        other => StorageError::Unknown(other.to_string()),
    }
}

#[async_trait]
impl StorageProvider for FirebaseProvider {
    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        size: u64,
        options: &UploadOptions,
    ) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        let mut media = Media::new(self.object_name(key));
        media.content_type = resolve_content_type(options.content_type.as_deref(), key).into();
        media.content_length = Some(size);

        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            predefined_acl: match options.acl {
                Some(ObjectAcl::PublicRead) => Some(PredefinedObjectAcl::PublicRead),
                Some(ObjectAcl::Private) => Some(PredefinedObjectAcl::Private),
                None => None,
            },
            ..Default::default()
        };

        let object = self
            .client
            .upload_streamed_object(&request, SyncByteStream::new(body), &UploadType::Simple(media))
            .await
            .map_err(|err| map_gcs_error(err, key))?;

        debug!(provider = "firebase", key, size = object.size, "stored object");
        Ok(self.to_file_object(key, &object))
    }

    async fn download(&self, key: &str) -> StorageResult<(ByteStream, FileObject)> {
        ensure_key_present(key)?;
        let object = self.fetch(key).await?;
        let stream = self
            .client
            .download_streamed_object(
                &GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: self.object_name(key),
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|err| map_gcs_error(err, key))?
            .map_err(|err| io::Error::other(err.to_string()));
        Ok((Box::pin(stream), object))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        ensure_key_present(key)?;
        let result = self
            .client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: self.object_name(key),
                ..Default::default()
            })
            .await;
        match result.map_err(|err| map_gcs_error(err, key)) {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn get_url(&self, key: &str) -> StorageResult<String> {
        ensure_key_present(key)?;
        self.fetch(key).await.map(|object| object.url)
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        ensure_key_present(key)?;
        if expires_in.is_zero() || expires_in > MAX_SIGNED {
            return Err(StorageError::InvalidArgument(
                "expiration must be between 1 second and 7 days".into(),
            ));
        }
        self.fetch(key).await?;
        self.client
            .signed_url(
                &self.bucket,
                &self.object_name(key),
                None,
                None,
                SignedURLOptions {
                    method: SignedURLMethod::GET,
                    expires: expires_in,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| StorageError::Unknown(format!("signing {}: {}", key, err)))
    }

    async fn get_object(&self, key: &str) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        self.fetch(key).await
    }

    async fn check_health(&self) -> StorageResult<()> {
        self.client
            .list_objects(&ListObjectsRequest {
                bucket: self.bucket.clone(),
                prefix: Some(self.namespace.clone()).filter(|ns| !ns.is_empty()),
                max_results: Some(1),
                ..Default::default()
            })
            .await
            .map_err(|err| map_gcs_error(err, &self.bucket))?;
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Firebase
    }
}
