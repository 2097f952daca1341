//! Azure Blob Storage backend.
//!
//! Uploads are staged as uncommitted blocks and only become visible when the
//! block list is committed.

use super::{
    ByteStream, StorageError, StorageProvider, StorageResult, ensure_key_present, object_url,
    resolve_content_type,
};
use crate::{
    config::AzureConfig,
    models::file_object::{FileObject, ProviderType, UploadOptions},
};
use async_trait::async_trait;
use azure_core::{error::ErrorKind, request_options::Metadata};
use azure_storage::{StorageCredentials, shared_access_signature::service_sas::BlobSasPermissions};
use azure_storage_blobs::prelude::*;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::{io, time::Duration};
use time::OffsetDateTime;
use tracing::debug;

const BLOCK_SIZE: usize = 4 * 1024 * 1024;

pub struct AzureProvider {
    container: ContainerClient,
    account: String,
    container_name: String,
}

impl AzureProvider {
    pub fn new(config: &AzureConfig) -> StorageResult<Self> {
        for (field, value) in [
            ("account", &config.account),
            ("access key", &config.access_key),
            ("container", &config.container),
        ] {
            if value.trim().is_empty() {
                return Err(StorageError::InvalidArgument(format!(
                    "Azure {} must be set",
                    field
                )));
            }
        }
        let credentials =
            StorageCredentials::access_key(config.account.clone(), config.access_key.clone());
        let container = BlobServiceClient::new(config.account.clone(), credentials)
            .container_client(config.container.clone());
        Ok(Self {
            container,
            account: config.account.clone(),
            container_name: config.container.clone(),
        })
    }

    fn url_for(&self, key: &str) -> String {
        object_url(
            &format!(
                "https://{}.blob.core.windows.net/{}",
                self.account, self.container_name
            ),
            key,
        )
    }

    async fn properties(&self, key: &str) -> StorageResult<FileObject> {
        let response = self
            .container
            .blob_client(key)
            .get_properties()
            .await
            .map_err(|err| map_azure_error(err, key))?;
        let props = response.blob.properties;
        let content_type = if props.content_type.is_empty() {
            resolve_content_type(None, key)
        } else {
            props.content_type.clone()
        };

        Ok(FileObject {
            key: key.to_string(),
            url: self.url_for(key),
            size: props.content_length,
            content_type,
            last_modified: to_chrono(props.last_modified),
            etag: Some(props.etag.to_string().trim_matches('"').to_string()),
            provider: ProviderType::Azure,
            signed_url: None,
        })
    }
}

fn to_chrono(t: OffsetDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(t.unix_timestamp(), t.nanosecond()).unwrap_or_else(Utc::now)
}

/// Block ids must all share one length within a blob.
fn block_name(index: usize) -> String {
    format!("block-{:08}", index)
}

fn block_id(index: usize) -> BlockId {
    BlockId::new(block_name(index))
}

fn map_azure_error(err: azure_core::Error, key: &str) -> StorageError {
    match err.kind() {
        ErrorKind::HttpResponse { status, error_code } => classify_response(
            u16::from(*status),
            error_code.as_deref(),
            key,
            err.to_string(),
        ),
        ErrorKind::Io => StorageError::Unavailable(err.to_string()),
        ErrorKind::Credential => StorageError::Unauthorized(err.to_string()),
        _ => StorageError::Unknown(err.to_string()),
    }
}

fn classify_response(status: u16, code: Option<&str>, key: &str, message: String) -> StorageError {
    match code {
        Some("BlobNotFound" | "ContainerNotFound") => StorageError::NotFound(key.to_string()),
        Some("AuthenticationFailed" | "AuthorizationFailure" | "InsufficientAccountPermissions") => {
            StorageError::Unauthorized(message)
        }
        Some("ServerBusy" | "OperationTimedOut" | "InternalError") => {
            StorageError::Unavailable(message)
        }
        _ => StorageError::from_status(status, key, message),
    }
}

#[async_trait]
impl StorageProvider for AzureProvider {
    async fn upload(
        &self,
        key: &str,
        mut body: ByteStream,
        size: u64,
        options: &UploadOptions,
    ) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        let blob = self.container.blob_client(key);
        let content_type = resolve_content_type(options.content_type.as_deref(), key);

        let mut blocks = Vec::new();
        let mut buffer = BytesMut::with_capacity(BLOCK_SIZE);
        loop {
            let next = body.next().await;
            let finished = next.is_none();
            if let Some(chunk) = next {
                buffer.extend_from_slice(&chunk.map_err(|err| StorageError::from_io(err, key))?);
            }
            if buffer.len() >= BLOCK_SIZE || (finished && !buffer.is_empty()) {
                let data: Bytes = buffer.split().freeze();
                let id = block_id(blocks.len());
                blob.put_block(id.clone(), data)
                    .await
                    .map_err(|err| map_azure_error(err, key))?;
                blocks.push(BlobBlockType::new_uncommitted(id));
            }
            if finished {
                break;
            }
        }

        let mut metadata = Metadata::new();
        for (name, value) in &options.metadata {
            metadata.insert(name.clone(), value.clone());
        }
        blob.put_block_list(BlockList { blocks })
            .content_type(content_type)
            .metadata(metadata)
            .await
            .map_err(|err| map_azure_error(err, key))?;

        debug!(provider = "azure", key, declared_size = size, "committed block list");
        self.properties(key).await
    }

    async fn download(&self, key: &str) -> StorageResult<(ByteStream, FileObject)> {
        ensure_key_present(key)?;
        let object = self.properties(key).await?;
        let stream = self
            .container
            .blob_client(key)
            .get()
            .into_stream()
            .then(|chunk| async move {
                let response = chunk.map_err(|err| io::Error::other(err.to_string()))?;
                response
                    .data
                    .collect()
                    .await
                    .map_err(|err| io::Error::other(err.to_string()))
            });
        Ok((Box::pin(stream), object))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        ensure_key_present(key)?;
        match self.container.blob_client(key).delete().await {
            Ok(_) => Ok(()),
            Err(err) => match map_azure_error(err, key) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn get_url(&self, key: &str) -> StorageResult<String> {
        ensure_key_present(key)?;
        self.properties(key).await.map(|object| object.url)
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        ensure_key_present(key)?;
        if expires_in.is_zero() {
            return Err(StorageError::InvalidArgument(
                "expiration must be positive".into(),
            ));
        }
        self.properties(key).await?;
        let blob = self.container.blob_client(key);
        let permissions = BlobSasPermissions {
            read: true,
            ..Default::default()
        };
        let sas = blob
            .shared_access_signature(permissions, OffsetDateTime::now_utc() + expires_in)
            .await
            .map_err(|err| map_azure_error(err, key))?;
        let url = blob
            .generate_signed_blob_url(&sas)
            .map_err(|err| map_azure_error(err, key))?;
        Ok(url.to_string())
    }

    async fn get_object(&self, key: &str) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        self.properties(key).await
    }

    async fn check_health(&self) -> StorageResult<()> {
        self.container
            .get_properties()
            .await
            .map_err(|err| map_azure_error(err, &self.container_name))?;
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Azure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AzureConfig {
        AzureConfig {
            account: "mediaacct".into(),
            // base64 of "not-a-real-key"
            access_key: "bm90LWEtcmVhbC1rZXk=".into(),
            container: "uploads".into(),
        }
    }

    #[test]
    fn construction_requires_every_field() {
        assert!(AzureProvider::new(&config()).is_ok());
        for broken in [
            AzureConfig {
                account: "".into(),
                ..config()
            },
            AzureConfig {
                access_key: " ".into(),
                ..config()
            },
            AzureConfig {
                container: "".into(),
                ..config()
            },
        ] {
            assert!(matches!(
                AzureProvider::new(&broken).err().unwrap(),
                StorageError::InvalidArgument(_)
            ));
        }
    }

    #[test]
    fn direct_url_addresses_the_blob() {
        let provider = AzureProvider::new(&config()).unwrap();
        assert_eq!(
            provider.url_for("u1/image/20240102/cat.png"),
            "https://mediaacct.blob.core.windows.net/uploads/u1/image/20240102/cat.png"
        );
        assert_eq!(
            provider.url_for("u1/other/20240102/notes #2.txt"),
            "https://mediaacct.blob.core.windows.net/uploads/u1/other/20240102/notes%20%232.txt"
        );
    }

    #[test]
    fn block_ids_have_uniform_length() {
        assert_eq!(block_name(0), "block-00000000");
        assert_eq!(block_name(0).len(), block_name(12_345).len());
    }

    #[test]
    fn service_codes_take_precedence_over_status() {
        assert!(classify_response(404, Some("BlobNotFound"), "k", String::new()).is_not_found());
        assert!(classify_response(404, None, "k", String::new()).is_not_found());
        assert!(matches!(
            classify_response(403, Some("AuthenticationFailed"), "k", "sig".into()),
            StorageError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_response(500, Some("ServerBusy"), "k", "busy".into()),
            StorageError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let provider = AzureProvider::new(&config()).unwrap();
        assert!(matches!(
            provider.get_object("").await.unwrap_err(),
            StorageError::InvalidArgument(_)
        ));
        assert!(matches!(
            provider.delete(" ").await.unwrap_err(),
            StorageError::InvalidArgument(_)
        ));
    }
}
