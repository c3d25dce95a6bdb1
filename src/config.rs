// s3fs configuration
// JSON config file, validated before any network call

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::credentials::{CredentialError, CredentialSource};
use crate::metadata_cache::validate_table_name;
use crate::paths::KeyMapper;
use crate::providers::Encryption;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// Which schemes are served from the bucket instead of the local disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Takeover {
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub private: bool,
}

/// Local directories backing the non-remote schemes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDirs {
    /// Root of `public://` when not taken over (and migration source)
    pub public: Option<PathBuf>,
    /// Root of `private://` when not taken over (and migration source)
    pub private: Option<PathBuf>,
    /// Root of `temporary://`
    #[serde(default = "default_temporary_dir")]
    pub temporary: PathBuf,
}

impl Default for LocalDirs {
    fn default() -> Self {
        Self {
            public: None,
            private: None,
            temporary: default_temporary_dir(),
        }
    }
}

fn default_temporary_dir() -> PathBuf {
    std::env::temp_dir().join("s3fs")
}

/// Metadata cache location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// SQLite database file
    #[serde(default = "default_cache_database")]
    pub database: PathBuf,
    /// Live table name; the shadow table is `<table>_temp`
    #[serde(default = "default_cache_table")]
    pub table: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            database: default_cache_database(),
            table: default_cache_table(),
        }
    }
}

fn default_cache_database() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("s3fs")
        .join("metadata.db")
}

fn default_cache_table() -> String {
    "s3fs_file".to_string()
}

/// s3fs configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3fsConfig {
    /// Bucket name
    pub bucket: String,
    /// AWS region (e.g., us-east-1)
    #[serde(default = "default_region")]
    pub region: String,
    /// Folder inside the bucket that holds everything (empty = bucket root)
    #[serde(default)]
    pub root_folder: String,
    /// Folder for `public://` files, below the root folder
    #[serde(default = "default_public_folder")]
    pub public_folder: String,
    /// Folder for `private://` files, below the root folder
    #[serde(default = "default_private_folder")]
    pub private_folder: String,
    #[serde(default)]
    pub takeover: Takeover,
    #[serde(default)]
    pub local: LocalDirs,
    /// Server-side encryption for uploads
    #[serde(default)]
    pub encryption: Encryption,
    /// `Cache-Control` header sent with uploads
    #[serde(default)]
    pub cache_control: Option<String>,
    /// Custom S3-compatible host, with or without scheme
    #[serde(default)]
    pub hostname: Option<String>,
    /// Use https for custom hosts given without a scheme
    #[serde(default = "default_true")]
    pub use_https: bool,
    /// Path-style addressing (MinIO and most custom hosts)
    #[serde(default)]
    pub use_path_style: bool,
    /// Reject every remote write
    #[serde(default)]
    pub read_only: bool,
    /// Track object versions in the cache
    #[serde(default)]
    pub use_versioning: bool,
    /// Ask the bucket instead of the cache for stat queries
    #[serde(default)]
    pub ignore_cache: bool,
    /// Upload `public://` and `s3://` files with the private ACL too
    #[serde(default)]
    pub upload_as_private: bool,
    /// Domain used in public URLs instead of the bucket endpoint
    #[serde(default)]
    pub cname: Option<String>,
    /// Path prefixes (relative to the scheme root) served through presigned URLs
    #[serde(default)]
    pub presigned_prefixes: Vec<String>,
    /// Lifetime of presigned URLs in seconds
    #[serde(default = "default_presigned_timeout")]
    pub presigned_timeout_secs: u64,
    #[serde(default)]
    pub credentials: CredentialSource,
    #[serde(default)]
    pub cache: CacheSettings,
    /// Retries for throttled / failed S3 requests
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_public_folder() -> String {
    "s3fs-public".to_string()
}

fn default_private_folder() -> String {
    "s3fs-private".to_string()
}

fn default_true() -> bool {
    true
}

fn default_presigned_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout() -> u64 {
    60
}

impl S3fsConfig {
    /// Minimal configuration for a bucket, everything else at defaults
    pub fn for_bucket(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            region: default_region(),
            root_folder: String::new(),
            public_folder: default_public_folder(),
            private_folder: default_private_folder(),
            takeover: Takeover::default(),
            local: LocalDirs::default(),
            encryption: Encryption::default(),
            cache_control: None,
            hostname: None,
            use_https: true,
            use_path_style: false,
            read_only: false,
            use_versioning: false,
            ignore_cache: false,
            upload_as_private: false,
            cname: None,
            presigned_prefixes: Vec::new(),
            presigned_timeout_secs: default_presigned_timeout(),
            credentials: CredentialSource::default(),
            cache: CacheSettings::default(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout(),
        }
    }

    /// Load and validate the config file at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let config: S3fsConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!("Loaded s3fs config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to disk
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content).map_err(io_err)?;
        Ok(())
    }

    /// Validate the configuration without touching the network
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("Bucket name is required".to_string()));
        }
        if !is_valid_bucket_name(&self.bucket) {
            return Err(ConfigError::Invalid(format!("Invalid bucket name: {}", self.bucket)));
        }

        // Custom hosts (MinIO, R2, ...) accept arbitrary region strings
        if self.hostname.is_none() && !is_valid_aws_region(&self.region) {
            return Err(ConfigError::Invalid(format!("Invalid region: {}", self.region)));
        }

        for (name, folder) in [("public_folder", &self.public_folder), ("private_folder", &self.private_folder)] {
            if folder.trim_matches('/').is_empty() {
                return Err(ConfigError::Invalid(format!("{} cannot be empty", name)));
            }
        }
        if self.public_folder.trim_matches('/') == self.private_folder.trim_matches('/') {
            return Err(ConfigError::Invalid(
                "public_folder and private_folder must differ".to_string(),
            ));
        }

        validate_table_name(&self.cache.table).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if let CredentialSource::SharedFile { path: Some(path), .. } = &self.credentials {
            if !path.is_file() {
                return Err(ConfigError::Invalid(format!(
                    "Credentials file {:?} does not exist",
                    path
                )));
            }
        }

        Ok(())
    }

    /// Endpoint URL for the S3 client, `None` for AWS
    pub fn endpoint(&self) -> Option<String> {
        let host = self.hostname.as_deref()?.trim();
        if host.is_empty() {
            return None;
        }
        if host.starts_with("http://") || host.starts_with("https://") {
            Some(host.to_string())
        } else if self.use_https {
            Some(format!("https://{}", host))
        } else {
            Some(format!("http://{}", host))
        }
    }

    pub fn key_mapper(&self) -> KeyMapper {
        KeyMapper::new(&self.root_folder, &self.public_folder, &self.private_folder)
    }
}

/// Get the default path of the config file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("s3fs")
        .join("config.json")
}

fn is_valid_bucket_name(name: &str) -> bool {
    let len_ok = (3..=63).contains(&name.len());
    let chars_ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let edges_ok = name
        .chars()
        .next()
        .zip(name.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
    len_ok && chars_ok && edges_ok
}

fn is_valid_aws_region(region: &str) -> bool {
    // e.g. us-east-1, eu-central-2, us-gov-west-1, ap-southeast-4
    regex::Regex::new(r"^[a-z]{2}(-gov|-iso[a-z]?)?-[a-z]+-\d{1,2}$")
        .map(|re| re.is_match(region))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config: S3fsConfig = serde_json::from_str(r#"{"bucket": "my-site"}"#).unwrap();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.public_folder, "s3fs-public");
        assert_eq!(config.cache.table, "s3fs_file");
        assert!(config.use_https);
        assert!(!config.takeover.public);
        assert!(matches!(config.credentials, CredentialSource::Environment));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_json() {
        let json = r#"{
            "bucket": "assets.example.com",
            "region": "eu-west-1",
            "root_folder": "site-a",
            "takeover": {"public": true},
            "encryption": "aes256",
            "cache_control": "public, max-age=300",
            "credentials": {"type": "static", "access_key_id": "AKIA", "secret_access_key": "s"},
            "cache": {"database": "/tmp/s3fs.db", "table": "site_a_files"}
        }"#;
        let config: S3fsConfig = serde_json::from_str(json).unwrap();
        assert!(config.takeover.public);
        assert_eq!(config.encryption, Encryption::Aes256);
        assert_eq!(config.cache.table, "site_a_files");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = S3fsConfig::for_bucket("");
        assert!(config.validate().is_err());

        config.bucket = "Bad_Bucket".to_string();
        assert!(config.validate().is_err());

        config.bucket = "good-bucket".to_string();
        config.region = "mars-1".to_string();
        assert!(config.validate().is_err());

        // Custom hosts take any region label
        config.hostname = Some("minio.local:9000".to_string());
        assert!(config.validate().is_ok());

        config.private_folder = config.public_folder.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_credentials_file_is_config_error() {
        let mut config = S3fsConfig::for_bucket("good-bucket");
        config.credentials = CredentialSource::SharedFile {
            path: Some(PathBuf::from("/nonexistent/credentials")),
            profile: None,
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_endpoint() {
        let mut config = S3fsConfig::for_bucket("b-1");
        assert_eq!(config.endpoint(), None);
        config.hostname = Some("minio.local:9000".to_string());
        assert_eq!(config.endpoint().as_deref(), Some("https://minio.local:9000"));
        config.use_https = false;
        assert_eq!(config.endpoint().as_deref(), Some("http://minio.local:9000"));
        config.hostname = Some("https://r2.example.com".to_string());
        assert_eq!(config.endpoint().as_deref(), Some("https://r2.example.com"));
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s3fs").join("config.json");
        let mut config = S3fsConfig::for_bucket("round-trip");
        config.read_only = true;
        config.save(&path).unwrap();

        let loaded = S3fsConfig::load(&path).unwrap();
        assert_eq!(loaded.bucket, "round-trip");
        assert!(loaded.read_only);

        assert!(matches!(
            S3fsConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Unreadable { .. })
        ));
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(S3fsConfig::load(&path), Err(ConfigError::Malformed { .. })));
    }

    #[test]
    fn test_region_patterns() {
        for region in ["us-east-1", "eu-central-2", "us-gov-west-1", "ap-southeast-4"] {
            assert!(is_valid_aws_region(region), "{}", region);
        }
        assert!(!is_valid_aws_region("useast1"));
    }
}
