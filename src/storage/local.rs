//! Filesystem backend.
//!
//! Objects live at `root/{key}`. Content type, ETag and user metadata are
//! kept in a JSON sidecar under `root/.media-meta/{key}.json` because a plain
//! file cannot carry them. Uploads stream into a temporary file that is
//! fsynced and renamed into place, so a key is either fully present or absent.

use super::{
    ByteStream, StorageError, StorageProvider, StorageResult, ensure_key_present, object_url,
    resolve_content_type,
};
use crate::{
    config::LocalConfig,
    models::file_object::{FileObject, ProviderType, UploadOptions},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use futures::{StreamExt, pin_mut};
use hmac::{Hmac, Mac};
use md5::Context;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const META_DIR: &str = ".media-meta";
const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Serialize, Deserialize, Debug, Default)]
struct Sidecar {
    content_type: String,
    etag: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

pub struct LocalProvider {
    root: PathBuf,
    base_url: String,
    signing_secret: Option<Vec<u8>>,
}

impl LocalProvider {
    /// Validate the configuration and make sure the root directory exists.
    pub async fn new(config: &LocalConfig) -> StorageResult<Self> {
        if config.root.as_os_str().is_empty() {
            return Err(StorageError::InvalidArgument(
                "local storage root must not be empty".into(),
            ));
        }
        if config.base_url.trim().is_empty() {
            return Err(StorageError::InvalidArgument(
                "local storage base URL must not be empty".into(),
            ));
        }
        fs::create_dir_all(&config.root).await.map_err(|err| {
            StorageError::Unavailable(format!(
                "cannot create storage root {}: {}",
                config.root.display(),
                err
            ))
        })?;

        debug!(root = %config.root.display(), "local storage ready");
        Ok(Self {
            root: config.root.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            signing_secret: config
                .signing_secret
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec()),
        })
    }

    /// Keys are relative paths below the root. Rejects anything that could
    /// escape it or collide with the sidecar directory.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        ensure_key_present(key)?;
        if key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidArgument("object key too long".into()));
        }
        if key.starts_with('/') || key.split('/').any(|seg| seg == ".." || seg == ".") {
            return Err(StorageError::InvalidArgument(format!(
                "object key `{}` is not a relative path",
                key
            )));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidArgument(
                "object key contains forbidden characters".into(),
            ));
        }
        if key == META_DIR || key.starts_with(&format!("{}/", META_DIR)) {
            return Err(StorageError::InvalidArgument(
                "object key uses a reserved prefix".into(),
            ));
        }
        Ok(())
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{}.json", key))
    }

    fn url_for(&self, key: &str) -> String {
        object_url(&self.base_url, key)
    }

    /// Stat the payload and merge in the sidecar, if any.
    async fn read_object(&self, key: &str) -> StorageResult<FileObject> {
        let meta = fs::metadata(self.object_path(key))
            .await
            .map_err(|err| StorageError::from_io(err, key))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let sidecar = match fs::read(self.sidecar_path(key)).await {
            Ok(raw) => serde_json::from_slice::<Sidecar>(&raw).unwrap_or_else(|err| {
                warn!(key, "ignoring unreadable sidecar: {}", err);
                Sidecar::default()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Sidecar::default(),
            Err(err) => return Err(StorageError::from_io(err, key)),
        };

        let last_modified = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let content_type = if sidecar.content_type.is_empty() {
            resolve_content_type(None, key)
        } else {
            sidecar.content_type
        };

        Ok(FileObject {
            key: key.to_string(),
            url: self.url_for(key),
            size: meta.len(),
            content_type,
            last_modified,
            etag: (!sidecar.etag.is_empty()).then_some(sidecar.etag),
            provider: ProviderType::Local,
            signed_url: None,
        })
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Stream `body` into `file`, returning the byte count and MD5 digest.
async fn write_stream(file: &mut File, body: ByteStream) -> io::Result<(u64, String)> {
    let mut size_bytes: u64 = 0;
    let mut digest = Context::new();
    pin_mut!(body);
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as u64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((size_bytes, format!("{:x}", digest.compute())))
}

/// Write `sidecar` to a temporary file beside `path`, returning the temp path.
async fn stage_sidecar(path: &Path, sidecar: &Sidecar) -> io::Result<PathBuf> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "sidecar path has no parent"))?;
    fs::create_dir_all(dir).await?;
    let staged = dir.join(format!(".tmp-{}.json", Uuid::new_v4()));
    let encoded = serde_json::to_vec(sidecar).map_err(io::Error::other)?;
    fs::write(&staged, encoded).await?;
    Ok(staged)
}

/// Rename `from` over `to`. Platforms that refuse to overwrite get the old
/// file removed first.
async fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(to).await?;
            fs::rename(from, to).await
        }
        other => other,
    }
}

/// Compute the URL-safe signature for `key` valid until `expires` (unix seconds).
pub fn sign_path(secret: &[u8], key: &str, expires: i64) -> StorageResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| StorageError::InvalidArgument(format!("invalid signing secret: {}", err)))?;
    mac.update(format!("{}\n{}", key, expires).as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Check a signature produced by [`sign_path`] against the current time.
pub fn verify_signed_path(
    secret: &[u8],
    key: &str,
    expires: i64,
    signature: &str,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    if now.timestamp() > expires {
        return Err(StorageError::Unauthorized("signed URL has expired".into()));
    }
    let provided = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| StorageError::Unauthorized("malformed signature".into()))?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| StorageError::InvalidArgument(format!("invalid signing secret: {}", err)))?;
    mac.update(format!("{}\n{}", key, expires).as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| StorageError::Unauthorized("signature mismatch".into()))
}

#[async_trait]
impl StorageProvider for LocalProvider {
    async fn upload(
        &self,
        key: &str,
        body: ByteStream,
        _size: u64,
        options: &UploadOptions,
    ) -> StorageResult<FileObject> {
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::InvalidArgument("object path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StorageError::from_io(err, key))?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path)
            .await
            .map_err(|err| StorageError::from_io(err, key))?;

        let (size_bytes, etag) = match write_stream(&mut file, body).await {
            Ok(written) => written,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::from_io(err, key));
            }
        };
        drop(file);

        // The sidecar is staged next to its final path and only renamed in
        // once the payload is committed.
        let sidecar = Sidecar {
            content_type: resolve_content_type(options.content_type.as_deref(), key),
            etag,
            metadata: options.metadata.clone(),
        };
        let sidecar_path = self.sidecar_path(key);
        let sidecar_tmp = match stage_sidecar(&sidecar_path, &sidecar).await {
            Ok(staged) => staged,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::from_io(err, key));
            }
        };

        if let Err(err) = replace_file(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            let _ = fs::remove_file(&sidecar_tmp).await;
            return Err(StorageError::from_io(err, key));
        }
        if let Err(err) = replace_file(&sidecar_tmp, &sidecar_path).await {
            // Never leave the previous object's metadata next to new bytes.
            let _ = fs::remove_file(&sidecar_tmp).await;
            let _ = fs::remove_file(&sidecar_path).await;
            warn!(key, "payload stored without sidecar: {}", err);
            return Err(StorageError::from_io(err, key));
        }

        debug!(provider = "local", key, size_bytes, "stored object");
        self.read_object(key).await
    }

    async fn download(&self, key: &str) -> StorageResult<(ByteStream, FileObject)> {
        self.ensure_key_safe(key)?;
        let object = self.read_object(key).await?;
        let file = File::open(self.object_path(key))
            .await
            .map_err(|err| StorageError::from_io(err, key))?;
        Ok((Box::pin(ReaderStream::new(file)), object))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::from_io(err, key)),
        }

        let sidecar_path = self.sidecar_path(key);
        match fs::remove_file(&sidecar_path).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(key, "failed to remove sidecar: {}", err),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.root).await;
        }
        if let Some(parent) = sidecar_path.parent() {
            self.prune_empty_dirs(parent, &self.root.join(META_DIR)).await;
        }
        Ok(())
    }

    async fn get_url(&self, key: &str) -> StorageResult<String> {
        self.ensure_key_safe(key)?;
        Ok(self.read_object(key).await?.url)
    }

    async fn get_signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let url = self.get_url(key).await?;
        let Some(secret) = &self.signing_secret else {
            debug!(key, "no signing secret configured, returning direct URL");
            return Ok(url);
        };
        let ttl = chrono::Duration::from_std(expires_in)
            .map_err(|_| StorageError::InvalidArgument("expiry out of range".into()))?;
        let expires = (Utc::now() + ttl).timestamp();
        let signature = sign_path(secret, key, expires)?;
        Ok(format!("{}?expires={}&signature={}", url, expires, signature))
    }

    async fn get_object(&self, key: &str) -> StorageResult<FileObject> {
        self.ensure_key_safe(key)?;
        self.read_object(key).await
    }

    async fn check_health(&self) -> StorageResult<()> {
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|err| StorageError::Unavailable(format!("storage root: {}", err)))?;
        if !meta.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "storage root {} is not a directory",
                self.root.display()
            )));
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|err| StorageError::Unavailable(format!("storage root: {}", err)))?;
        entries
            .next_entry()
            .await
            .map_err(|err| StorageError::Unavailable(format!("storage root: {}", err)))?;
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Local
    }
}
