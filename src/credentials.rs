//! AWS credential resolution
//!
//! Credentials come from one of four sources: static keys in the config
//! file, the standard `AWS_*` environment variables, a shared credentials
//! file (`~/.aws/credentials`), or the EC2 instance profile through IMDSv2.
//! Instance-profile credentials can be cached on disk so that short-lived
//! CLI runs do not hit the metadata service every time.

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMDS_BASE_URL: &str = "http://169.254.169.254";
const IMDS_TOKEN_TTL_SECS: &str = "21600";
const INSTANCE_CACHE_FILE: &str = "instance-profile-credentials.json";
/// Cached credentials closer than this to expiry are fetched again
const EXPIRY_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Cannot read credentials file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Profile '{profile}' not found in {path}")]
    ProfileNotFound { profile: String, path: PathBuf },

    #[error("Missing credential field: {0}")]
    MissingField(String),

    #[error("Instance metadata service error: {0}")]
    MetadataService(String),
}

/// Signing credentials for S3 requests
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    /// Present for temporary (STS / instance profile) credentials
    pub session_token: Option<SecretString>,
    pub expiration: Option<DateTime<Utc>>,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: SecretString::from(secret_access_key.into()),
            session_token: None,
            expiration: None,
        }
    }

    /// True when the credentials expire within the safety margin
    pub fn is_expiring(&self, now: DateTime<Utc>) -> bool {
        match self.expiration {
            Some(expiration) => expiration - Duration::minutes(EXPIRY_MARGIN_MINUTES) <= now,
            None => false,
        }
    }
}

/// Where credentials are loaded from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    /// Keys stored in the config file
    Static {
        access_key_id: String,
        #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
        secret_access_key: SecretString,
    },
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_SESSION_TOKEN`
    #[default]
    Environment,
    /// Shared credentials file; defaults to `~/.aws/credentials` and the
    /// `default` profile (or `AWS_PROFILE`)
    SharedFile {
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        profile: Option<String>,
    },
    /// EC2 instance profile, optionally cached in `cache_dir`
    InstanceProfile {
        #[serde(default)]
        cache_dir: Option<PathBuf>,
    },
}

fn serialize_secret<S: serde::Serializer>(secret: &SecretString, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D: serde::Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
    String::deserialize(d).map(SecretString::from)
}

impl CredentialSource {
    /// Resolve the credentials this source points at
    pub async fn resolve(&self, http: &Client) -> Result<AwsCredentials, CredentialError> {
        match self {
            CredentialSource::Static {
                access_key_id,
                secret_access_key,
            } => Ok(AwsCredentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: None,
                expiration: None,
            }),
            CredentialSource::Environment => from_environment(),
            CredentialSource::SharedFile { path, profile } => {
                let path = path.clone().unwrap_or_else(default_shared_file_path);
                let profile = profile
                    .clone()
                    .or_else(|| std::env::var("AWS_PROFILE").ok())
                    .unwrap_or_else(|| "default".to_string());
                load_shared_file(&path, &profile)
            }
            CredentialSource::InstanceProfile { cache_dir } => {
                resolve_instance_profile(http, cache_dir.as_deref()).await
            }
        }
    }
}

fn from_environment() -> Result<AwsCredentials, CredentialError> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
        .map_err(|_| CredentialError::MissingField("AWS_ACCESS_KEY_ID".to_string()))?;
    let secret = std::env::var("AWS_SECRET_ACCESS_KEY")
        .map_err(|_| CredentialError::MissingField("AWS_SECRET_ACCESS_KEY".to_string()))?;
    let mut credentials = AwsCredentials::new(access_key_id, secret);
    credentials.session_token = std::env::var("AWS_SESSION_TOKEN").ok().map(SecretString::from);
    Ok(credentials)
}

fn default_shared_file_path() -> PathBuf {
    if let Ok(path) = std::env::var("AWS_SHARED_CREDENTIALS_FILE") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".aws")
        .join("credentials")
}

/// Parse an INI-style shared credentials file into `profile -> key -> value`
fn parse_shared_file(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut profiles: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            // Config-file style "[profile name]" is accepted too
            let name = section.trim().trim_start_matches("profile ").trim().to_string();
            profiles.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        if let (Some(profile), Some((key, value))) = (&current, line.split_once('=')) {
            profiles
                .entry(profile.clone())
                .or_default()
                .insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    profiles
}

pub fn load_shared_file(path: &Path, profile: &str) -> Result<AwsCredentials, CredentialError> {
    let content = std::fs::read_to_string(path).map_err(|source| CredentialError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let profiles = parse_shared_file(&content);
    let values = profiles.get(profile).ok_or_else(|| CredentialError::ProfileNotFound {
        profile: profile.to_string(),
        path: path.to_path_buf(),
    })?;

    let field = |name: &str| {
        values
            .get(name)
            .cloned()
            .ok_or_else(|| CredentialError::MissingField(format!("{} in profile '{}'", name, profile)))
    };

    let mut credentials = AwsCredentials::new(field("aws_access_key_id")?, field("aws_secret_access_key")?);
    credentials.session_token = values.get("aws_session_token").cloned().map(SecretString::from);
    Ok(credentials)
}

/// On-disk form of instance-profile credentials
#[derive(Debug, Serialize, Deserialize)]
struct CachedCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    expiration: Option<DateTime<Utc>>,
}

impl From<&AwsCredentials> for CachedCredentials {
    fn from(credentials: &AwsCredentials) -> Self {
        Self {
            access_key_id: credentials.access_key_id.clone(),
            secret_access_key: credentials.secret_access_key.expose_secret().to_string(),
            session_token: credentials
                .session_token
                .as_ref()
                .map(|t| t.expose_secret().to_string()),
            expiration: credentials.expiration,
        }
    }
}

impl From<CachedCredentials> for AwsCredentials {
    fn from(cached: CachedCredentials) -> Self {
        Self {
            access_key_id: cached.access_key_id,
            secret_access_key: SecretString::from(cached.secret_access_key),
            session_token: cached.session_token.map(SecretString::from),
            expiration: cached.expiration,
        }
    }
}

/// Load cached credentials if present and not about to expire
fn load_cached(cache_dir: &Path, now: DateTime<Utc>) -> Option<AwsCredentials> {
    let path = cache_dir.join(INSTANCE_CACHE_FILE);
    let data = std::fs::read_to_string(&path).ok()?;
    let cached: CachedCredentials = match serde_json::from_str(&data) {
        Ok(cached) => cached,
        Err(e) => {
            tracing::warn!("[CREDS] Ignoring unreadable credential cache {:?}: {}", path, e);
            return None;
        }
    };
    let credentials = AwsCredentials::from(cached);
    if credentials.is_expiring(now) {
        None
    } else {
        Some(credentials)
    }
}

fn store_cached(cache_dir: &Path, credentials: &AwsCredentials) -> std::io::Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    let path = cache_dir.join(INSTANCE_CACHE_FILE);
    let data = serde_json::to_string(&CachedCredentials::from(credentials))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// IMDS role credential document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImdsCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: String,
    expiration: DateTime<Utc>,
}

async fn resolve_instance_profile(
    http: &Client,
    cache_dir: Option<&Path>,
) -> Result<AwsCredentials, CredentialError> {
    if let Some(dir) = cache_dir {
        if let Some(credentials) = load_cached(dir, Utc::now()) {
            tracing::debug!("[CREDS] Using cached instance profile credentials");
            return Ok(credentials);
        }
    }

    let credentials = fetch_instance_profile(http).await?;

    if let Some(dir) = cache_dir {
        if let Err(e) = store_cached(dir, &credentials) {
            tracing::warn!("[CREDS] Failed to cache instance profile credentials: {}", e);
        }
    }

    Ok(credentials)
}

async fn fetch_instance_profile(http: &Client) -> Result<AwsCredentials, CredentialError> {
    let imds_err = |e: reqwest::Error| CredentialError::MetadataService(e.to_string());

    let token = http
        .put(format!("{}/latest/api/token", IMDS_BASE_URL))
        .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
        .send()
        .await
        .map_err(imds_err)?
        .error_for_status()
        .map_err(imds_err)?
        .text()
        .await
        .map_err(imds_err)?;

    let roles_url = format!("{}/latest/meta-data/iam/security-credentials/", IMDS_BASE_URL);
    let roles = http
        .get(&roles_url)
        .header("X-aws-ec2-metadata-token", &token)
        .send()
        .await
        .map_err(imds_err)?
        .error_for_status()
        .map_err(imds_err)?
        .text()
        .await
        .map_err(imds_err)?;

    let role = roles
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| CredentialError::MetadataService("No IAM role attached to this instance".to_string()))?;

    let document: ImdsCredentials = http
        .get(format!("{}{}", roles_url, role))
        .header("X-aws-ec2-metadata-token", &token)
        .send()
        .await
        .map_err(imds_err)?
        .error_for_status()
        .map_err(imds_err)?
        .json()
        .await
        .map_err(imds_err)?;

    tracing::info!("[CREDS] Loaded instance profile credentials for role {}", role);

    Ok(AwsCredentials {
        access_key_id: document.access_key_id,
        secret_access_key: SecretString::from(document.secret_access_key),
        session_token: Some(SecretString::from(document.token)),
        expiration: Some(document.expiration),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
[default]
aws_access_key_id = AKIADEFAULT
aws_secret_access_key = defaultsecret

[profile staging]
aws_access_key_id=AKIASTAGING
aws_secret_access_key=stagingsecret
aws_session_token=tok
";

    #[test]
    fn test_parse_shared_file_profiles() {
        let profiles = parse_shared_file(SAMPLE);
        assert_eq!(profiles["default"]["aws_access_key_id"], "AKIADEFAULT");
        assert_eq!(profiles["staging"]["aws_session_token"], "tok");
    }

    #[test]
    fn test_load_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, SAMPLE).unwrap();

        let creds = load_shared_file(&path, "staging").unwrap();
        assert_eq!(creds.access_key_id, "AKIASTAGING");
        assert_eq!(creds.secret_access_key.expose_secret(), "stagingsecret");
        assert!(creds.session_token.is_some());

        let missing = load_shared_file(&path, "prod");
        assert!(matches!(missing, Err(CredentialError::ProfileNotFound { .. })));
    }

    #[test]
    fn test_unreadable_shared_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_shared_file(&dir.path().join("nope"), "default");
        assert!(matches!(result, Err(CredentialError::Unreadable { .. })));
    }

    #[test]
    fn test_instance_cache_respects_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();

        let mut fresh = AwsCredentials::new("AKIA", "secret");
        fresh.expiration = Some(now + Duration::hours(1));
        store_cached(dir.path(), &fresh).unwrap();
        let loaded = load_cached(dir.path(), now).expect("fresh credentials are reused");
        assert_eq!(loaded.access_key_id, "AKIA");

        let mut stale = AwsCredentials::new("AKIA", "secret");
        stale.expiration = Some(now + Duration::minutes(2));
        store_cached(dir.path(), &stale).unwrap();
        assert!(load_cached(dir.path(), now).is_none());
    }

    #[test]
    fn test_debug_redacts_static_secret() {
        let source = CredentialSource::Static {
            access_key_id: "AKIA".to_string(),
            secret_access_key: SecretString::from("hunter2".to_string()),
        };
        let printed = format!("{:?}", source);
        assert!(printed.contains("AKIA"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_static_secret_survives_config_round_trip() {
        let json = r#"{"type":"static","access_key_id":"AKIA","secret_access_key":"hunter2"}"#;
        let source: CredentialSource = serde_json::from_str(json).unwrap();
        match &source {
            CredentialSource::Static { secret_access_key, .. } => {
                assert_eq!(secret_access_key.expose_secret(), "hunter2")
            }
            other => panic!("unexpected source: {other:?}"),
        }
        let saved = serde_json::to_value(&source).unwrap();
        assert_eq!(saved["secret_access_key"], "hunter2");

        let default: CredentialSource = serde_json::from_str(r#"{"type":"environment"}"#).unwrap();
        assert!(matches!(default, CredentialSource::Environment));
        assert!(matches!(CredentialSource::default(), CredentialSource::Environment));
    }
}
