//! Shared types for the object store layer
//!
//! Listing entries, pagination tokens, upload options, the resolved S3
//! connection settings and the provider error type.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::credentials::AwsCredentials;

/// Sentinel version id S3 reports for objects written before versioning
/// was enabled on the bucket
pub const NULL_VERSION: &str = "null";

/// One object (or object version) from a bucket listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Full bucket key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time (epoch seconds)
    pub last_modified: i64,
    /// ETag without surrounding quotes
    pub etag: Option<String>,
    /// Version id, already normalized (`"null"` becomes `None`)
    pub version_id: Option<String>,
    /// Whether this is the current version (always true for plain listings)
    pub is_latest: bool,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64, last_modified: i64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified,
            etag: None,
            version_id: None,
            is_latest: true,
        }
    }

    /// Zero-byte objects whose key ends in `/` stand for folders
    pub fn is_folder_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// Drop the sentinel `"null"` version id
pub fn normalize_version(version: Option<String>) -> Option<String> {
    version.filter(|v| !v.is_empty() && v != NULL_VERSION)
}

/// Where the next listing page starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageToken {
    /// ListObjectsV2 continuation token
    Continuation(String),
    /// ListObjectVersions markers
    Versions {
        key_marker: String,
        version_id_marker: Option<String>,
    },
}

/// One page of a bucket listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    /// `None` once the listing is exhausted
    pub next: Option<PageToken>,
}

/// Result of a successful write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Version id assigned by a versioned bucket, normalized
    pub version_id: Option<String>,
}

/// Server-side encryption applied to uploads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encryption {
    #[default]
    None,
    /// SSE-S3
    Aes256,
    /// SSE-KMS with the bucket's default key
    AwsKms,
}

impl Encryption {
    /// Value of the `x-amz-server-side-encryption` header
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            Encryption::None => None,
            Encryption::Aes256 => Some("AES256"),
            Encryption::AwsKms => Some("aws:kms"),
        }
    }
}

/// Canned ACL applied to uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CannedAcl {
    Private,
    PublicRead,
}

impl CannedAcl {
    pub fn as_str(&self) -> &'static str {
        match self {
            CannedAcl::Private => "private",
            CannedAcl::PublicRead => "public-read",
        }
    }
}

/// Headers sent with PutObject / CopyObject
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub acl: Option<CannedAcl>,
    pub encryption: Encryption,
}

/// Resolved connection settings for the S3 client
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3-compatible endpoint URL (`None` for AWS S3)
    pub endpoint: Option<String>,
    /// AWS region (e.g., us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Use path-style addressing (for MinIO, etc.)
    pub path_style: bool,
    /// Signing credentials
    pub credentials: AwsCredentials,
    /// Maximum retries for 429/5xx responses
    pub max_retries: u32,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

/// Errors returned by object store operations
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Compact summary of a listing page, for log lines
pub struct PageSummary<'a>(pub &'a ListPage);

impl fmt::Display for PageSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} objects, {}",
            self.0.objects.len(),
            if self.0.next.is_some() { "more pages" } else { "last page" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version(Some("null".to_string())), None);
        assert_eq!(normalize_version(Some(String::new())), None);
        assert_eq!(normalize_version(None), None);
        assert_eq!(normalize_version(Some("3HL4kqtJ".to_string())), Some("3HL4kqtJ".to_string()));
    }

    #[test]
    fn test_folder_marker() {
        assert!(ObjectInfo::new("dir/", 0, 0).is_folder_marker());
        assert!(!ObjectInfo::new("dir/a.txt", 3, 0).is_folder_marker());
    }

    #[test]
    fn test_encryption_header() {
        assert_eq!(Encryption::None.header_value(), None);
        assert_eq!(Encryption::Aes256.header_value(), Some("AES256"));
        assert_eq!(Encryption::AwsKms.header_value(), Some("aws:kms"));
    }
}
