//! Backend-neutral description of a stored object and the knobs callers can
//! pass alongside an upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};
use thiserror::Error;

/// The storage backend that produced (and can re-locate) an object.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum ProviderType {
    Local,
    S3,
    Azure,
    Firebase,
    Discord,
}

impl ProviderType {
    pub const ALL: [ProviderType; 5] = [
        ProviderType::Local,
        ProviderType::S3,
        ProviderType::Azure,
        ProviderType::Firebase,
        ProviderType::Discord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Local => "local",
            ProviderType::S3 => "s3",
            ProviderType::Azure => "azure",
            ProviderType::Firebase => "firebase",
            ProviderType::Discord => "discord",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown storage provider `{0}`")]
pub struct UnknownProvider(pub String);

impl FromStr for ProviderType {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        ProviderType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == normalized)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

/// Object-level access hint. Backends without per-object ACLs ignore it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectAcl {
    Private,
    PublicRead,
}

/// Optional parameters accompanying an upload.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UploadOptions {
    /// Overrides the extension-based content type guess.
    pub content_type: Option<String>,

    /// Free-form user metadata. Backends that cannot store it drop it silently.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    pub acl: Option<ObjectAcl>,
}

impl UploadOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Canonical description of an object as reported by its backend.
///
/// `key` together with `provider` is enough to find the object again; nothing
/// else about the upload needs to be remembered.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FileObject {
    /// Backend-relative identifier (path, blob name, or logical Discord key).
    pub key: String,

    /// Best-effort direct URL. Empty when the backend has no unsigned addressing.
    pub url: String,

    /// Size in bytes, as reported by the backend.
    pub size: u64,

    pub content_type: String,

    pub last_modified: DateTime<Utc>,

    /// Absent for backends without content hashing.
    pub etag: Option<String>,

    pub provider: ProviderType,

    /// Time-limited URL; only filled in when explicitly requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
}
