//! s3fs: a remote file system backed by an S3 bucket
//!
//! Files are addressed as `scheme://path` (`s3://`, `public://`,
//! `private://`, `temporary://`). Metadata of remote files lives in a
//! SQLite cache so stat and listing calls never hit the bucket; the cache is
//! rebuilt from a full bucket listing by [`refresh::CacheRefresher`], and
//! local files are pushed to the bucket by [`migrate::Migrator`].

pub mod batch;
pub mod config;
pub mod credentials;
pub mod file_service;
pub mod metadata_cache;
pub mod migrate;
pub mod paths;
pub mod providers;
pub mod refresh;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use config::{ConfigError, S3fsConfig};
use credentials::CredentialError;
use file_service::{FileService, ServiceSettings};
use metadata_cache::{CacheError, SqliteMetadataCache};
use migrate::{MigrateScheme, Migrator, UploadCondition};
use providers::{ObjectStore, ProviderError, S3Client, S3Config};
use refresh::CacheRefresher;

/// Timeout for credential lookups (instance metadata service)
const CREDENTIAL_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Cannot open metadata cache: {0}")]
    Cache(#[from] CacheError),
}

/// A configured file system: object store, metadata cache and the services
/// built on them
pub struct S3fs {
    config: S3fsConfig,
    store: Arc<dyn ObjectStore>,
    cache: Arc<SqliteMetadataCache>,
    files: Arc<FileService>,
}

impl S3fs {
    /// Validate the configuration, resolve credentials and open the cache.
    /// No request is sent to the bucket.
    pub async fn connect(config: S3fsConfig) -> Result<Self, ConnectError> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CREDENTIAL_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;
        let credentials = config.credentials.resolve(&http).await?;
        tracing::debug!("[CREDS] Using credentials from {:?}", config.credentials);

        let client = S3Client::new(S3Config {
            endpoint: config.endpoint(),
            region: config.region.clone(),
            bucket: config.bucket.clone(),
            path_style: config.use_path_style,
            credentials,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })?;

        Self::with_store(config, Arc::new(client))
    }

    /// Build on an existing object store
    pub fn with_store(config: S3fsConfig, store: Arc<dyn ObjectStore>) -> Result<Self, ConnectError> {
        let cache = Arc::new(SqliteMetadataCache::open(&config.cache.database, &config.cache.table)?);
        let files = Arc::new(FileService::new(
            store.clone(),
            cache.clone(),
            ServiceSettings::from(&config),
        ));
        Ok(Self {
            config,
            store,
            cache,
            files,
        })
    }

    pub fn config(&self) -> &S3fsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<SqliteMetadataCache> {
        &self.cache
    }

    pub fn files(&self) -> &Arc<FileService> {
        &self.files
    }

    /// Verify the bucket is reachable with the configured credentials
    pub async fn check_access(&self) -> Result<(), ProviderError> {
        self.store.check_access().await
    }

    pub fn refresher(&self) -> CacheRefresher {
        CacheRefresher::new(
            self.store.clone(),
            self.cache.clone(),
            self.config.key_mapper(),
            self.config.use_versioning,
        )
    }

    pub fn migrator(&self, scheme: MigrateScheme, condition: UploadCondition) -> Migrator {
        Migrator::new(self.files.clone(), scheme, condition)
    }
}
