//! Aggregate health across storage backends.

use crate::{
    models::file_object::ProviderType,
    storage::{StorageError, registry::ProviderRegistry},
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::warn;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub message: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct HealthReport {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub providers: BTreeMap<String, ProviderHealth>,
}

#[derive(Clone)]
pub struct HealthService {
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
}

impl HealthService {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(registry: Arc<ProviderRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Check every configured backend concurrently. One slow or broken
    /// backend never hides the others.
    pub async fn check_all(&self) -> HealthReport {
        let types = self.registry.configured_types();
        let results = join_all(types.into_iter().map(|provider| async move {
            (provider, self.check_one(provider).await)
        }))
        .await;
        report(results)
    }

    /// Check a single backend named by the caller.
    pub async fn check_named(&self, name: &str) -> Result<HealthReport, StorageError> {
        let provider = name
            .parse::<ProviderType>()
            .map_err(|err| StorageError::InvalidArgument(err.to_string()))?;
        Ok(report(vec![(provider, self.check_one(provider).await)]))
    }

    async fn check_one(&self, provider: ProviderType) -> ProviderHealth {
        let attempt = async {
            let backend = self.registry.provider(provider).await?;
            backend.check_health().await
        };
        let outcome = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "health check timed out after {}s",
                self.timeout.as_secs_f64()
            )),
        };
        match outcome {
            Ok(()) => ProviderHealth {
                status: HealthStatus::Healthy,
                message: "ok".into(),
            },
            Err(message) => {
                warn!(provider = %provider, "health check failed: {}", message);
                ProviderHealth {
                    status: HealthStatus::Unhealthy,
                    message,
                }
            }
        }
    }
}

fn report(results: Vec<(ProviderType, ProviderHealth)>) -> HealthReport {
    let providers: BTreeMap<String, ProviderHealth> = results
        .into_iter()
        .map(|(provider, health)| (provider.to_string(), health))
        .collect();
    HealthReport {
        healthy: providers
            .values()
            .all(|health| health.status == HealthStatus::Healthy),
        checked_at: Utc::now(),
        providers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::StorageConfig, storage::memory::MemoryProvider};
    use std::sync::atomic::Ordering;

    fn registry(providers: Vec<Arc<MemoryProvider>>) -> Arc<ProviderRegistry> {
        let mut registry = ProviderRegistry::new(StorageConfig::default());
        for provider in providers {
            registry = registry.register(provider);
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn one_failure_does_not_hide_the_rest() {
        let local = Arc::new(MemoryProvider::new(ProviderType::Local));
        let s3 = Arc::new(MemoryProvider::new(ProviderType::S3));
        let azure = Arc::new(MemoryProvider::new(ProviderType::Azure));
        s3.fail_health.store(true, Ordering::SeqCst);

        let service = HealthService::new(
            registry(vec![local, s3, azure]),
            HealthService::DEFAULT_TIMEOUT,
        );
        let report = service.check_all().await;

        assert!(!report.healthy);
        assert_eq!(report.providers.len(), 3);
        assert_eq!(report.providers["local"].status, HealthStatus::Healthy);
        assert_eq!(report.providers["azure"].status, HealthStatus::Healthy);
        assert_eq!(report.providers["s3"].status, HealthStatus::Unhealthy);
        assert!(report.providers["s3"].message.contains("invalid credentials"));
    }

    #[tokio::test]
    async fn hanging_backend_times_out() {
        let local = Arc::new(MemoryProvider::new(ProviderType::Local));
        let discord = Arc::new(MemoryProvider::new(ProviderType::Discord));
        discord.hang_health.store(true, Ordering::SeqCst);

        let service = HealthService::new(registry(vec![local, discord]), Duration::from_millis(50));
        let report = service.check_all().await;

        assert!(!report.healthy);
        assert_eq!(report.providers["local"].status, HealthStatus::Healthy);
        assert!(report.providers["discord"].message.contains("timed out"));
    }

    #[tokio::test]
    async fn single_provider_mode() {
        let service = HealthService::new(
            registry(vec![Arc::new(MemoryProvider::new(ProviderType::Local))]),
            HealthService::DEFAULT_TIMEOUT,
        );

        let report = service.check_named("local").await.unwrap();
        assert!(report.healthy);
        assert_eq!(report.providers.len(), 1);

        // Known but unconfigured: reported, not rejected.
        let report = service.check_named("firebase").await.unwrap();
        assert!(!report.healthy);
        assert!(report.providers["firebase"].message.contains("not configured"));

        assert!(matches!(
            service.check_named("dropbox").await.unwrap_err(),
            StorageError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn report_serializes_with_lowercase_status() {
        let service = HealthService::new(
            registry(vec![Arc::new(MemoryProvider::new(ProviderType::Local))]),
            HealthService::DEFAULT_TIMEOUT,
        );
        let json = serde_json::to_value(service.check_all().await).unwrap();
        assert_eq!(json["healthy"], true);
        assert_eq!(json["providers"]["local"]["status"], "healthy");
    }
}
