//! Scheme-prefixed paths and their mapping onto bucket keys
//!
//! A file path such as `public://styles/logo.png` is made of a scheme and a
//! slash-separated path. Remote paths are stored under a key built from the
//! configured root folder and the scheme's folder, and cached under a
//! canonical `s3://` URI relative to the root folder.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length (in characters) of a cached URI. Mirrors the width of the
/// `uri` column the cache was designed around.
pub const MAX_URI_LENGTH: usize = 255;

/// Logical storage namespace prefix of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// The bucket itself, relative to the root folder
    S3,
    /// Public files, stored under the public folder when taken over
    Public,
    /// Private files, stored under the private folder when taken over
    Private,
    /// Scratch space, always on the local filesystem
    Temporary,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::S3 => "s3",
            Scheme::Public => "public",
            Scheme::Private => "private",
            Scheme::Temporary => "temporary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "s3" => Some(Scheme::S3),
            "public" => Some(Scheme::Public),
            "private" => Some(Scheme::Private),
            "temporary" => Some(Scheme::Temporary),
            _ => None,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Malformed URI: {0}")]
    Malformed(String),

    #[error("Unknown scheme: {0}")]
    UnknownScheme(String),

    #[error("Path is longer than {max} characters: {uri}")]
    TooLong { uri: String, max: usize },

    #[error("Path contains characters outside the basic multilingual plane: {0}")]
    UnsupportedCharacters(String),

    #[error("Path escapes its scheme root: {0}")]
    Traversal(String),
}

/// A parsed `scheme://path` reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileUri {
    pub scheme: Scheme,
    /// Normalized path: no leading or trailing slash, empty for the root
    pub path: String,
}

impl FileUri {
    pub fn new(scheme: Scheme, path: &str) -> Result<Self, PathError> {
        Ok(Self {
            scheme,
            path: normalize_path(path)?,
        })
    }

    pub fn parse(uri: &str) -> Result<Self, PathError> {
        let (scheme, path) = uri
            .split_once("://")
            .ok_or_else(|| PathError::Malformed(uri.to_string()))?;
        let scheme = Scheme::parse(scheme).ok_or_else(|| PathError::UnknownScheme(scheme.to_string()))?;
        Self::new(scheme, path)
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Last path segment (empty for the root)
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    /// Parent directory, or `None` for the root
    pub fn parent(&self) -> Option<FileUri> {
        if self.is_root() {
            return None;
        }
        Some(FileUri {
            scheme: self.scheme,
            path: parent_path(&self.path).to_string(),
        })
    }

    /// Sibling entry in the same directory
    pub fn with_file_name(&self, name: &str) -> FileUri {
        let parent = parent_path(&self.path);
        let path = if parent.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent, name)
        };
        FileUri { scheme: self.scheme, path }
    }

    pub fn join(&self, name: &str) -> FileUri {
        let path = if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.path, name)
        };
        FileUri { scheme: self.scheme, path }
    }
}

impl fmt::Display for FileUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path)
    }
}

/// Collapse duplicate slashes, strip `.` segments and reject `..`
fn normalize_path(path: &str) -> Result<String, PathError> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(path.to_string())),
            s => segments.push(s),
        }
    }
    Ok(segments.join("/"))
}

/// Parent of a normalized path (`""` for top-level entries)
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// All proper ancestors of a normalized path, nearest first, root excluded.
///
/// `a/b/c.txt` yields `a/b` then `a`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path;
    std::iter::from_fn(move || {
        let parent = parent_path(current);
        if parent.is_empty() {
            return None;
        }
        current = parent;
        Some(parent)
    })
}

/// Reject URIs the cache cannot hold: too long, or containing code points
/// that need four bytes in UTF-8.
pub fn validate_cache_uri(uri: &str) -> Result<(), PathError> {
    if uri.chars().count() > MAX_URI_LENGTH {
        return Err(PathError::TooLong {
            uri: uri.to_string(),
            max: MAX_URI_LENGTH,
        });
    }
    if uri.chars().any(|c| c.len_utf8() > 3) {
        return Err(PathError::UnsupportedCharacters(uri.to_string()));
    }
    Ok(())
}

/// Translates between scheme paths, bucket keys and cache URIs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapper {
    root_folder: String,
    public_folder: String,
    private_folder: String,
}

impl KeyMapper {
    pub fn new(root_folder: &str, public_folder: &str, private_folder: &str) -> Self {
        Self {
            root_folder: root_folder.trim_matches('/').to_string(),
            public_folder: public_folder.trim_matches('/').to_string(),
            private_folder: private_folder.trim_matches('/').to_string(),
        }
    }

    fn scheme_folder(&self, scheme: Scheme) -> &str {
        match scheme {
            Scheme::Public => &self.public_folder,
            Scheme::Private => &self.private_folder,
            Scheme::S3 | Scheme::Temporary => "",
        }
    }

    /// Path relative to the root folder (what an `s3://` URI carries)
    pub fn relative_path(&self, uri: &FileUri) -> String {
        join_segments(&[self.scheme_folder(uri.scheme), &uri.path])
    }

    /// Full bucket key of a remote path
    pub fn to_key(&self, uri: &FileUri) -> String {
        join_segments(&[&self.root_folder, self.scheme_folder(uri.scheme), &uri.path])
    }

    /// Canonical cache URI of a remote path
    pub fn cache_uri(&self, uri: &FileUri) -> String {
        format!("s3://{}", self.relative_path(uri))
    }

    /// Key prefix every object of this installation lives under
    pub fn list_prefix(&self) -> String {
        if self.root_folder.is_empty() {
            String::new()
        } else {
            format!("{}/", self.root_folder)
        }
    }

    /// Strip the root folder from a listed key. Returns `None` for keys
    /// outside the root folder and for the root marker itself.
    pub fn key_to_relative<'k>(&self, key: &'k str) -> Option<&'k str> {
        let relative = if self.root_folder.is_empty() {
            key
        } else {
            key.strip_prefix(self.root_folder.as_str())?.strip_prefix('/')?
        };
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            None
        } else {
            Some(relative)
        }
    }
}

fn join_segments(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}
