use crate::models::file_object::ProviderType;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub default_provider: ProviderType,
    pub health_timeout: Duration,
    /// Largest request body accepted by the upload endpoint.
    pub max_upload_bytes: usize,
    pub storage: StorageConfig,
}

/// One optional block per backend. A missing block means that provider type
/// cannot be constructed; the others stay usable.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub local: Option<LocalConfig>,
    pub s3: Option<S3Config>,
    pub azure: Option<AzureConfig>,
    pub firebase: Option<FirebaseConfig>,
    pub discord: Option<DiscordConfig>,
}

impl StorageConfig {
    pub fn is_configured(&self, provider: ProviderType) -> bool {
        match provider {
            ProviderType::Local => self.local.is_some(),
            ProviderType::S3 => self.s3.is_some(),
            ProviderType::Azure => self.azure.is_some(),
            ProviderType::Firebase => self.firebase.is_some(),
            ProviderType::Discord => self.discord.is_some(),
        }
    }
}

#[derive(Clone)]
pub struct LocalConfig {
    /// Directory holding object payloads.
    pub root: PathBuf,
    /// Public prefix under which `/files/{key}` is reachable.
    pub base_url: String,
    /// HMAC secret for signed URLs. Without it signed URLs fall back to the
    /// direct URL.
    pub signing_secret: Option<String>,
}

#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Host (and optional port) of an S3-compatible endpoint, without scheme.
    /// Empty means AWS itself.
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub use_ssl: bool,
    pub force_path_style: bool,
}

#[derive(Clone)]
pub struct AzureConfig {
    pub account: String,
    pub access_key: String,
    pub container: String,
}

#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    pub bucket: String,
    /// Service account JSON. Falls back to application default credentials.
    pub credentials_file: Option<PathBuf>,
    /// App namespace prepended to every object name.
    pub namespace: String,
    /// `host:port` of a Storage emulator. Requests go there unauthenticated.
    pub emulator_host: Option<String>,
}

#[derive(Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub channel_id: String,
    pub max_file_size: u64,
    /// Number of recent messages scanned when resolving a key.
    pub search_limit: usize,
    pub api_base: String,
}

impl DiscordConfig {
    pub const DEFAULT_MAX_FILE_SIZE: u64 = 25 * 1024 * 1024;
    pub const DEFAULT_SEARCH_LIMIT: usize = 100;
    pub const DEFAULT_API_BASE: &'static str = "https://discord.com/api/v10";
}

// Credentials stay out of `{:?}` output, which is logged at startup.
impl std::fmt::Debug for LocalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConfig")
            .field("root", &self.root)
            .field("base_url", &self.base_url)
            .field("signed_urls", &self.signing_secret.is_some())
            .finish()
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("use_ssl", &self.use_ssl)
            .field("force_path_style", &self.force_path_style)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("account", &self.account)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("channel_id", &self.channel_id)
            .field("max_file_size", &self.max_file_size)
            .field("search_limit", &self.search_limit)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-backend media storage service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for the local storage backend (overrides MEDIA_STORE_LOCAL_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Provider used when an upload names none (overrides MEDIA_STORE_DEFAULT_PROVIDER)
    #[arg(long)]
    pub default_provider: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("MEDIA_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("MEDIA_STORE_PORT")?.unwrap_or(3000);
        let env_db = env::var("MEDIA_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/media_store.db".into());
        let env_default_provider =
            env::var("MEDIA_STORE_DEFAULT_PROVIDER").unwrap_or_else(|_| "local".into());
        let health_timeout_secs = env_parse("MEDIA_STORE_HEALTH_TIMEOUT_SECS")?.unwrap_or(5);
        let max_upload_bytes =
            env_parse("MEDIA_STORE_MAX_UPLOAD_BYTES")?.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        // --- Merge ---
        let host = args.host.unwrap_or(env_host);
        let port = args.port.unwrap_or(env_port);
        let default_provider = args
            .default_provider
            .unwrap_or(env_default_provider)
            .parse::<ProviderType>()
            .context("parsing default provider")?;

        let storage = StorageConfig {
            local: Some(local_from_env(args.storage_dir, &host, port)),
            s3: s3_from_env()?,
            azure: azure_from_env(),
            firebase: firebase_from_env(),
            discord: discord_from_env()?,
        };

        let cfg = Self {
            host,
            port,
            database_url: args.database_url.unwrap_or(env_db),
            default_provider,
            health_timeout: Duration::from_secs(health_timeout_secs),
            max_upload_bytes,
            storage,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn local_from_env(storage_dir: Option<String>, host: &str, port: u16) -> LocalConfig {
    let root = storage_dir
        .or_else(|| env_opt("MEDIA_STORE_LOCAL_DIR"))
        .unwrap_or_else(|| "./data/media".into());
    let public_host = if matches!(host, "0.0.0.0" | "::") {
        "localhost"
    } else {
        host
    };
    LocalConfig {
        root: PathBuf::from(root),
        base_url: env_opt("MEDIA_STORE_LOCAL_BASE_URL")
            .unwrap_or_else(|| format!("http://{}:{}/files", public_host, port)),
        signing_secret: env_opt("MEDIA_STORE_LOCAL_SIGNING_SECRET"),
    }
}

fn s3_from_env() -> Result<Option<S3Config>> {
    let Some(bucket) = env_opt("MEDIA_STORE_S3_BUCKET") else {
        return Ok(None);
    };
    Ok(Some(S3Config {
        bucket,
        endpoint: env_opt("MEDIA_STORE_S3_ENDPOINT"),
        region: env_opt("MEDIA_STORE_S3_REGION").unwrap_or_else(|| "us-east-1".into()),
        access_key: env_opt("MEDIA_STORE_S3_ACCESS_KEY"),
        secret_key: env_opt("MEDIA_STORE_S3_SECRET_KEY"),
        use_ssl: env_parse("MEDIA_STORE_S3_USE_SSL")?.unwrap_or(true),
        force_path_style: env_parse("MEDIA_STORE_S3_FORCE_PATH_STYLE")?.unwrap_or(false),
    }))
}

fn azure_from_env() -> Option<AzureConfig> {
    let account = env_opt("MEDIA_STORE_AZURE_ACCOUNT")?;
    Some(AzureConfig {
        account,
        access_key: env_opt("MEDIA_STORE_AZURE_ACCESS_KEY").unwrap_or_default(),
        container: env_opt("MEDIA_STORE_AZURE_CONTAINER").unwrap_or_default(),
    })
}

fn firebase_from_env() -> Option<FirebaseConfig> {
    let bucket = env_opt("MEDIA_STORE_FIREBASE_BUCKET")?;
    Some(FirebaseConfig {
        bucket,
        credentials_file: env_opt("MEDIA_STORE_FIREBASE_CREDENTIALS_FILE").map(PathBuf::from),
        namespace: env_opt("MEDIA_STORE_FIREBASE_NAMESPACE").unwrap_or_default(),
        emulator_host: env_opt("MEDIA_STORE_FIREBASE_EMULATOR_HOST"),
    })
}

fn discord_from_env() -> Result<Option<DiscordConfig>> {
    let Some(bot_token) = env_opt("MEDIA_STORE_DISCORD_BOT_TOKEN") else {
        return Ok(None);
    };
    Ok(Some(DiscordConfig {
        bot_token,
        channel_id: env_opt("MEDIA_STORE_DISCORD_CHANNEL_ID").unwrap_or_default(),
        max_file_size: env_parse("MEDIA_STORE_DISCORD_MAX_FILE_SIZE")?
            .unwrap_or(DiscordConfig::DEFAULT_MAX_FILE_SIZE),
        search_limit: env_parse("MEDIA_STORE_DISCORD_SEARCH_LIMIT")?
            .unwrap_or(DiscordConfig::DEFAULT_SEARCH_LIMIT),
        api_base: env_opt("MEDIA_STORE_DISCORD_API_BASE")
            .unwrap_or_else(|| DiscordConfig::DEFAULT_API_BASE.into()),
    }))
}

/// Non-empty environment variable, if set.
fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_config_reports_configured_blocks() {
        let cfg = StorageConfig {
            local: Some(LocalConfig {
                root: PathBuf::from("/tmp/media"),
                base_url: "http://localhost:3000/files".into(),
                signing_secret: None,
            }),
            ..Default::default()
        };
        assert!(cfg.is_configured(ProviderType::Local));
        assert!(!cfg.is_configured(ProviderType::S3));
        assert!(!cfg.is_configured(ProviderType::Discord));
    }

    #[test]
    fn debug_output_hides_credentials() {
        let cfg = DiscordConfig {
            bot_token: "super-secret-token".into(),
            channel_id: "123".into(),
            max_file_size: DiscordConfig::DEFAULT_MAX_FILE_SIZE,
            search_limit: DiscordConfig::DEFAULT_SEARCH_LIMIT,
            api_base: DiscordConfig::DEFAULT_API_BASE.into(),
        };
        let rendered = format!("{:?}", cfg);
        assert!(rendered.contains("123"));
        assert!(!rendered.contains("super-secret-token"));
    }
}
