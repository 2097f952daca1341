//! In-memory provider used by pipeline and health tests.

use super::{
    ByteStream, StorageError, StorageProvider, StorageResult, ensure_key_present,
    resolve_content_type,
};
use crate::models::file_object::{FileObject, ProviderType, UploadOptions};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream};
use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

pub struct MemoryProvider {
    provider: ProviderType,
    objects: Mutex<HashMap<String, (Bytes, FileObject)>>,
    pub fail_delete: AtomicBool,
    pub fail_health: AtomicBool,
    pub hang_health: AtomicBool,
    pub delete_calls: AtomicUsize,
}

impl MemoryProvider {
    pub fn new(provider: ProviderType) -> Self {
        Self {
            provider,
            objects: Mutex::new(HashMap::new()),
            fail_delete: AtomicBool::new(false),
            fail_health: AtomicBool::new(false),
            hang_health: AtomicBool::new(false),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        _size: u64,
        options: &UploadOptions,
    ) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        let chunks: Vec<Bytes> = body
            .map(|chunk| chunk.map_err(|err| StorageError::Unknown(err.to_string())))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<StorageResult<_>>()?;
        let data = Bytes::from(chunks.concat());
        let object = FileObject {
            key: key.to_string(),
            url: format!("memory://{}/{}", self.provider, key),
            size: data.len() as u64,
            content_type: resolve_content_type(options.content_type.as_deref(), key),
            last_modified: Utc::now(),
            etag: Some(format!("{:x}", md5::compute(&data))),
            provider: self.provider,
            signed_url: None,
        };
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, object.clone()));
        Ok(object)
    }

    async fn download(&self, key: &str) -> StorageResult<(ByteStream, FileObject)> {
        let (data, object) = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok((Box::pin(stream::iter(vec![Ok(data)])), object))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        ensure_key_present(key)?;
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("backend offline".into()));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn get_url(&self, key: &str) -> StorageResult<String> {
        Ok(self.get_object(key).await?.url)
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let url = self.get_url(key).await?;
        Ok(format!("{}?ttl={}", url, expires_in.as_secs()))
    }

    async fn get_object(&self, key: &str) -> StorageResult<FileObject> {
        ensure_key_present(key)?;
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(_, object)| object.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn check_health(&self) -> StorageResult<()> {
        if self.hang_health.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail_health.load(Ordering::SeqCst) {
            return Err(StorageError::Unauthorized("invalid credentials".into()));
        }
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        self.provider
    }
}
