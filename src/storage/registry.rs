//! Provider registry.
//!
//! Resolves a [`ProviderType`] to a ready adapter built from the process-wide
//! [`StorageConfig`]. Adapters are constructed on first use and then shared;
//! a failed construction is not cached, so a later call retries it.

use super::{StorageError, StorageProvider, StorageResult, local::LocalProvider};
use crate::{
    config::{AzureConfig, DiscordConfig, FirebaseConfig, S3Config, StorageConfig},
    models::file_object::ProviderType,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Discovery entry for UIs that let a user pick a backend.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ProviderInfo {
    #[serde(rename = "type")]
    pub provider: ProviderType,
    pub name: &'static str,
    pub description: &'static str,
}

/// Every backend this build knows about, whether or not it is configured.
pub fn supported_providers() -> Vec<ProviderInfo> {
    ProviderType::ALL
        .into_iter()
        .map(|provider| {
            let (name, description) = match provider {
                ProviderType::Local => ("Local Storage", "Files stored on the server's filesystem"),
                ProviderType::S3 => (
                    "S3 Compatible",
                    "Amazon S3, MinIO and other S3-compatible object stores",
                ),
                ProviderType::Azure => ("Azure Blob Storage", "Microsoft Azure block blobs"),
                ProviderType::Firebase => (
                    "Firebase Storage",
                    "Google Firebase Cloud Storage bucket",
                ),
                ProviderType::Discord => (
                    "Discord",
                    "Attachments in a Discord channel (best effort, size-limited)",
                ),
            };
            ProviderInfo {
                provider,
                name,
                description,
            }
        })
        .collect()
}

type ProviderCell = OnceCell<Arc<dyn StorageProvider>>;

pub struct ProviderRegistry {
    config: StorageConfig,
    cells: HashMap<ProviderType, ProviderCell>,
}

impl ProviderRegistry {
    pub fn new(config: StorageConfig) -> Self {
        let cells = ProviderType::ALL
            .into_iter()
            .map(|provider| (provider, OnceCell::new()))
            .collect();
        Self { config, cells }
    }

    /// Install a pre-built provider, replacing whatever the config would build.
    pub fn register(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        let kind = provider.provider_type();
        self.cells.insert(kind, OnceCell::new_with(Some(provider)));
        self
    }

    /// Types that can be constructed: configured blocks plus injected providers.
    pub fn configured_types(&self) -> Vec<ProviderType> {
        ProviderType::ALL
            .into_iter()
            .filter(|provider| {
                self.config.is_configured(*provider)
                    || self
                        .cells
                        .get(provider)
                        .is_some_and(|cell| cell.initialized())
            })
            .collect()
    }

    /// Resolve `provider` to a ready adapter, building it on first use.
    pub async fn provider(&self, provider: ProviderType) -> StorageResult<Arc<dyn StorageProvider>> {
        let cell = self
            .cells
            .get(&provider)
            .ok_or_else(|| StorageError::InvalidArgument(format!("unknown provider {}", provider)))?;

        cell.get_or_try_init(|| async {
            let built = self.build(provider).await;
            match &built {
                Ok(_) => info!(provider = %provider, "storage provider initialized"),
                Err(err) => warn!(provider = %provider, "storage provider unavailable: {}", err),
            }
            built
        })
        .await
        .cloned()
    }

    /// Resolve a provider by name as supplied by a caller.
    pub async fn provider_by_name(&self, name: &str) -> StorageResult<Arc<dyn StorageProvider>> {
        let provider = name
            .parse::<ProviderType>()
            .map_err(|err| StorageError::InvalidArgument(err.to_string()))?;
        self.provider(provider).await
    }

    async fn build(&self, provider: ProviderType) -> StorageResult<Arc<dyn StorageProvider>> {
        let unconfigured =
            || StorageError::InvalidArgument(format!("storage provider `{}` is not configured", provider));

        match provider {
            ProviderType::Local => {
                let cfg = self.config.local.as_ref().ok_or_else(unconfigured)?;
                Ok(Arc::new(LocalProvider::new(cfg).await?))
            }
            ProviderType::S3 => build_s3(self.config.s3.as_ref().ok_or_else(unconfigured)?).await,
            ProviderType::Azure => {
                build_azure(self.config.azure.as_ref().ok_or_else(unconfigured)?).await
            }
            ProviderType::Firebase => {
                build_firebase(self.config.firebase.as_ref().ok_or_else(unconfigured)?).await
            }
            ProviderType::Discord => {
                build_discord(self.config.discord.as_ref().ok_or_else(unconfigured)?).await
            }
        }
    }
}

#[cfg(feature = "s3")]
async fn build_s3(cfg: &S3Config) -> StorageResult<Arc<dyn StorageProvider>> {
    Ok(Arc::new(super::s3::S3Provider::new(cfg).await?))
}

#[cfg(not(feature = "s3"))]
async fn build_s3(_cfg: &S3Config) -> StorageResult<Arc<dyn StorageProvider>> {
    Err(compiled_out("s3"))
}

#[cfg(feature = "azure")]
async fn build_azure(cfg: &AzureConfig) -> StorageResult<Arc<dyn StorageProvider>> {
    Ok(Arc::new(super::azure::AzureProvider::new(cfg)?))
}

#[cfg(not(feature = "azure"))]
async fn build_azure(_cfg: &AzureConfig) -> StorageResult<Arc<dyn StorageProvider>> {
    Err(compiled_out("azure"))
}

#[cfg(feature = "firebase")]
async fn build_firebase(cfg: &FirebaseConfig) -> StorageResult<Arc<dyn StorageProvider>> {
    Ok(Arc::new(super::firebase::FirebaseProvider::new(cfg).await?))
}

#[cfg(not(feature = "firebase"))]
async fn build_firebase(_cfg: &FirebaseConfig) -> StorageResult<Arc<dyn StorageProvider>> {
    Err(compiled_out("firebase"))
}

#[cfg(feature = "discord")]
async fn build_discord(cfg: &DiscordConfig) -> StorageResult<Arc<dyn StorageProvider>> {
    Ok(Arc::new(super::discord::DiscordProvider::new(cfg).await?))
}

#[cfg(not(feature = "discord"))]
async fn build_discord(_cfg: &DiscordConfig) -> StorageResult<Arc<dyn StorageProvider>> {
    Err(compiled_out("discord"))
}

#[allow(dead_code)]
fn compiled_out(feature: &str) -> StorageError {
    StorageError::Unavailable(format!(
        "this build does not include the `{}` storage backend",
        feature
    ))
}
