//! File service adapter
//!
//! Routes file operations on `scheme://path` URIs either to the local
//! filesystem or to the bucket. Remote writes go through the object store
//! and are mirrored into the metadata cache; remote reads of metadata are
//! answered from the cache unless `ignore_cache` is set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{LocalDirs, S3fsConfig, Takeover};
use crate::metadata_cache::{CacheError, MetadataRecord, MetadataStore};
use crate::paths::{ancestors, validate_cache_uri, FileUri, KeyMapper, PathError, Scheme};
use crate::providers::{CannedAcl, Encryption, ObjectStore, ProviderError, PutOptions};

#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Cannot copy a file onto itself: {0}")]
    SameFile(String),

    #[error("{0} is a directory")]
    IsDirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("The remote file system is read-only")]
    ReadOnly,

    #[error("No local directory configured for {0}://")]
    NoLocalDirectory(Scheme),

    #[error("{0} is not stored in the bucket")]
    NotRemote(String),

    #[error("Failed to write {uri}: {source}")]
    WriteFailed {
        uri: String,
        #[source]
        source: ProviderError,
    },

    #[error("Failed to read {uri}: {source}")]
    ReadFailed {
        uri: String,
        #[source]
        source: ProviderError,
    },

    #[error("Copied to {destination} but could not remove {source_uri}: {reason}")]
    SourceNotRemoved {
        source_uri: String,
        destination: String,
        reason: String,
    },

    #[error("Local file error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

type Result<T> = std::result::Result<T, FileServiceError>;

/// What to do when the destination already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Pick a free name: `name_0.ext`, `name_1.ext`, ...
    #[default]
    Rename,
    Replace,
    Error,
}

/// Where a URI is actually stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTarget {
    Local(PathBuf),
    Remote(FileUri),
}

/// The part of the configuration the file service acts on
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub mapper: KeyMapper,
    pub takeover: Takeover,
    pub local: LocalDirs,
    pub read_only: bool,
    pub ignore_cache: bool,
    pub upload_as_private: bool,
    pub encryption: Encryption,
    pub cache_control: Option<String>,
    pub cname: Option<String>,
    pub presigned_prefixes: Vec<String>,
    pub presigned_timeout_secs: u64,
}

impl From<&S3fsConfig> for ServiceSettings {
    fn from(config: &S3fsConfig) -> Self {
        Self {
            mapper: config.key_mapper(),
            takeover: config.takeover.clone(),
            local: config.local.clone(),
            read_only: config.read_only,
            ignore_cache: config.ignore_cache,
            upload_as_private: config.upload_as_private,
            encryption: config.encryption,
            cache_control: config.cache_control.clone(),
            cname: config.cname.clone(),
            presigned_prefixes: config.presigned_prefixes.clone(),
            presigned_timeout_secs: config.presigned_timeout_secs,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FileServiceError + '_ {
    move |source| FileServiceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn system_time_to_unix(time: std::io::Result<std::time::SystemTime>) -> i64 {
    time.map(|t| DateTime::<Utc>::from(t).timestamp()).unwrap_or(0)
}

/// Split `name.ext` into (`name`, `.ext`); dotfiles and names without a dot
/// have no extension
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

pub struct FileService {
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn MetadataStore>,
    settings: ServiceSettings,
}

impl FileService {
    pub fn new(store: Arc<dyn ObjectStore>, cache: Arc<dyn MetadataStore>, settings: ServiceSettings) -> Self {
        Self { store, cache, settings }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    // ============ Resolution ============

    /// Decide where a URI lives under the current takeover settings
    pub fn resolve(&self, uri: &FileUri) -> Result<StorageTarget> {
        let local_root = match uri.scheme {
            Scheme::S3 => return Ok(StorageTarget::Remote(uri.clone())),
            Scheme::Public if self.settings.takeover.public => return Ok(StorageTarget::Remote(uri.clone())),
            Scheme::Private if self.settings.takeover.private => return Ok(StorageTarget::Remote(uri.clone())),
            Scheme::Public => self.settings.local.public.as_ref(),
            Scheme::Private => self.settings.local.private.as_ref(),
            Scheme::Temporary => Some(&self.settings.local.temporary),
        };
        let root = local_root.ok_or(FileServiceError::NoLocalDirectory(uri.scheme))?;
        Ok(StorageTarget::Local(root.join(&uri.path)))
    }

    fn key(&self, uri: &FileUri) -> String {
        self.settings.mapper.to_key(uri)
    }

    fn cache_uri(&self, uri: &FileUri) -> String {
        self.settings.mapper.cache_uri(uri)
    }

    /// Checks every remote write runs before touching the network
    fn preflight(&self, uri: &FileUri) -> Result<()> {
        if self.settings.read_only {
            return Err(FileServiceError::ReadOnly);
        }
        validate_cache_uri(&self.cache_uri(uri))?;
        Ok(())
    }

    fn put_options(&self, uri: &FileUri) -> PutOptions {
        let acl = if uri.scheme == Scheme::Private || self.settings.upload_as_private {
            CannedAcl::Private
        } else {
            CannedAcl::PublicRead
        };
        PutOptions {
            content_type: Some(mime_guess::from_path(&uri.path).first_or_octet_stream().to_string()),
            cache_control: self.settings.cache_control.clone(),
            acl: Some(acl),
            encryption: self.settings.encryption,
        }
    }

    /// Record a remote file and its ancestor directories in the cache.
    /// The object is already written; a cache failure is logged and left for
    /// the next refresh to reconcile.
    fn record_remote_file(&self, uri: &FileUri, size: u64, version: Option<String>) -> MetadataRecord {
        let relative = self.settings.mapper.relative_path(uri);
        let record = MetadataRecord::file(format!("s3://{}", relative), size, Utc::now().timestamp(), version);

        let mut records = vec![record.clone()];
        records.extend(ancestors(&relative).map(|dir| MetadataRecord::directory(format!("s3://{}", dir))));
        if let Err(e) = self.cache.put_many(&records) {
            tracing::error!("[CACHE] Failed to record {}: {}", record.uri, e);
        }
        record
    }

    // ============ Metadata ============

    /// Metadata of a URI, `None` if it does not exist
    pub async fn stat(&self, uri: &str) -> Result<Option<MetadataRecord>> {
        let uri = FileUri::parse(uri)?;
        let target = self.resolve(&uri)?;
        self.stat_target(&uri, &target).await
    }

    pub async fn exists(&self, uri: &str) -> Result<bool> {
        Ok(self.stat(uri).await?.is_some())
    }

    async fn stat_target(&self, uri: &FileUri, target: &StorageTarget) -> Result<Option<MetadataRecord>> {
        match target {
            StorageTarget::Local(path) => match tokio::fs::metadata(path).await {
                Ok(meta) => Ok(Some(MetadataRecord {
                    uri: uri.to_string(),
                    filesize: if meta.is_dir() { 0 } else { meta.len() },
                    timestamp: system_time_to_unix(meta.modified()),
                    is_directory: meta.is_dir(),
                    version: None,
                })),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(io_error(path)(e)),
            },
            StorageTarget::Remote(remote) => self.stat_remote(remote).await,
        }
    }

    async fn stat_remote(&self, uri: &FileUri) -> Result<Option<MetadataRecord>> {
        let cache_uri = self.cache_uri(uri);
        // Scheme roots are directories even before anything is cached below them
        if uri.is_root() {
            return Ok(Some(MetadataRecord::directory(cache_uri)));
        }
        if !self.settings.ignore_cache {
            return Ok(self.cache.get(&cache_uri)?);
        }

        let key = self.key(uri);
        let read_failed = |source| FileServiceError::ReadFailed {
            uri: uri.to_string(),
            source,
        };
        if let Some(info) = self.store.head_object(&key).await.map_err(read_failed)? {
            return Ok(Some(MetadataRecord::file(cache_uri, info.size, info.last_modified, info.version_id)));
        }

        // No object: it is a directory if anything lives below it
        let page = self
            .store
            .list_page(&format!("{}/", key), None, 1, false)
            .await
            .map_err(|source| FileServiceError::ReadFailed {
                uri: uri.to_string(),
                source,
            })?;
        Ok((!page.objects.is_empty()).then(|| MetadataRecord::directory(cache_uri)))
    }

    /// Entries directly inside a directory
    pub async fn list_dir(&self, uri: &str) -> Result<Vec<MetadataRecord>> {
        let dir = FileUri::parse(uri)?;
        match self.resolve(&dir)? {
            StorageTarget::Remote(remote) => {
                let children = self.cache.list_children(&self.cache_uri(&remote))?;
                Ok(children
                    .into_iter()
                    .map(|mut record| {
                        let name = record.uri.rsplit('/').next().unwrap_or_default().to_string();
                        record.uri = remote.join(&name).to_string();
                        record
                    })
                    .collect())
            }
            StorageTarget::Local(path) => {
                let mut entries = tokio::fs::read_dir(&path).await.map_err(io_error(&path))?;
                let mut records = Vec::new();
                while let Some(entry) = entries.next_entry().await.map_err(io_error(&path))? {
                    let meta = entry.metadata().await.map_err(io_error(&entry.path()))?;
                    let name = entry.file_name().to_string_lossy().to_string();
                    records.push(MetadataRecord {
                        uri: dir.join(&name).to_string(),
                        filesize: if meta.is_dir() { 0 } else { meta.len() },
                        timestamp: system_time_to_unix(meta.modified()),
                        is_directory: meta.is_dir(),
                        version: None,
                    });
                }
                records.sort_by(|a, b| a.uri.cmp(&b.uri));
                Ok(records)
            }
        }
    }

    // ============ Writes ============

    /// Pick the final destination according to the conflict policy. A
    /// directory is never replaced by a file.
    async fn prepare_destination(&self, destination: FileUri, policy: ConflictPolicy) -> Result<FileUri> {
        let target = self.resolve(&destination)?;
        match self.stat_target(&destination, &target).await? {
            None => return Ok(destination),
            Some(existing) if existing.is_directory => {
                return Err(FileServiceError::IsDirectory(destination.to_string()))
            }
            Some(_) => {}
        }

        match policy {
            ConflictPolicy::Replace => Ok(destination),
            ConflictPolicy::Error => Err(FileServiceError::AlreadyExists(destination.to_string())),
            ConflictPolicy::Rename => {
                let name = destination.file_name().to_string();
                let (stem, ext) = split_extension(&name);
                let mut counter = 0u32;
                loop {
                    let candidate = destination.with_file_name(&format!("{}_{}{}", stem, counter, ext));
                    let target = self.resolve(&candidate)?;
                    if self.stat_target(&candidate, &target).await?.is_none() {
                        tracing::debug!("Renamed destination {} to {}", destination, candidate);
                        return Ok(candidate);
                    }
                    counter += 1;
                }
            }
        }
    }

    /// An existing directory as destination receives the source's name
    async fn directory_destination(&self, source: &FileUri, destination: FileUri) -> Result<FileUri> {
        let target = self.resolve(&destination)?;
        match self.stat_target(&destination, &target).await? {
            Some(record) if record.is_directory => Ok(destination.join(source.file_name())),
            _ => Ok(destination),
        }
    }

    fn same_location(&self, a: &StorageTarget, b: &StorageTarget) -> bool {
        match (a, b) {
            (StorageTarget::Local(a), StorageTarget::Local(b)) => a == b,
            (StorageTarget::Remote(a), StorageTarget::Remote(b)) => self.key(a) == self.key(b),
            _ => false,
        }
    }

    /// Copy a file. Returns the URI it was finally written to.
    pub async fn copy(&self, source: &str, destination: &str, policy: ConflictPolicy) -> Result<String> {
        let source = FileUri::parse(source)?;
        let destination = FileUri::parse(destination)?;
        let source_target = self.resolve(&source)?;
        if let StorageTarget::Remote(remote) = self.resolve(&destination)? {
            self.preflight(&remote)?;
        }

        let source_record = self
            .stat_target(&source, &source_target)
            .await?
            .filter(|r| !r.is_directory)
            .ok_or_else(|| FileServiceError::NotFound(source.to_string()))?;

        let destination = self.directory_destination(&source, destination).await?;
        if self.same_location(&source_target, &self.resolve(&destination)?) && policy != ConflictPolicy::Rename {
            return Err(FileServiceError::SameFile(source.to_string()));
        }

        let destination = self.prepare_destination(destination, policy).await?;
        let destination_target = self.resolve(&destination)?;
        if let StorageTarget::Remote(remote) = &destination_target {
            // Renaming may have pushed the path over the limit
            self.preflight(remote)?;
        }

        self.transfer(&source, &source_target, source_record.filesize, &destination, &destination_target)
            .await?;
        tracing::info!("Copied {} to {}", source, destination);
        Ok(destination.to_string())
    }

    async fn transfer(
        &self,
        source: &FileUri,
        from: &StorageTarget,
        size: u64,
        destination: &FileUri,
        to: &StorageTarget,
    ) -> Result<()> {
        let write_failed = |source| FileServiceError::WriteFailed {
            uri: destination.to_string(),
            source,
        };

        match (from, to) {
            (StorageTarget::Remote(src), StorageTarget::Remote(dst)) => {
                let result = self
                    .store
                    .copy_object(&self.key(src), &self.key(dst), &self.put_options(dst))
                    .await
                    .map_err(write_failed)?;
                self.record_remote_file(dst, size, result.version_id);
            }
            (StorageTarget::Local(path), StorageTarget::Remote(dst)) => {
                let result = self
                    .store
                    .upload_file(path, &self.key(dst), &self.put_options(dst))
                    .await
                    .map_err(write_failed)?;
                self.record_remote_file(dst, size, result.version_id);
            }
            (StorageTarget::Remote(src), StorageTarget::Local(path)) => {
                let data = self
                    .store
                    .get_object(&self.key(src))
                    .await
                    .map_err(|e| FileServiceError::ReadFailed {
                        uri: source.to_string(),
                        source: e,
                    })?;
                write_local(path, &data).await?;
            }
            (StorageTarget::Local(from_path), StorageTarget::Local(to_path)) => {
                if let Some(parent) = to_path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
                }
                tokio::fs::copy(from_path, to_path).await.map_err(io_error(to_path))?;
            }
        }
        Ok(())
    }

    /// Move a file: copy, then delete the source.
    ///
    /// The source is only deleted after the destination is written. If that
    /// delete fails the data exists in both places and the call fails with
    /// `SourceNotRemoved`.
    pub async fn move_file(&self, source: &str, destination: &str, policy: ConflictPolicy) -> Result<String> {
        let source_uri = FileUri::parse(source)?;
        if matches!(self.resolve(&source_uri)?, StorageTarget::Remote(_)) && self.settings.read_only {
            return Err(FileServiceError::ReadOnly);
        }

        let written = self.copy(source, destination, policy).await?;
        if let Err(e) = self.delete(source).await {
            tracing::error!("Moved {} to {} but the source could not be removed: {}", source, written, e);
            return Err(FileServiceError::SourceNotRemoved {
                source_uri: source.to_string(),
                destination: written,
                reason: e.to_string(),
            });
        }
        Ok(written)
    }

    /// Write a buffer to a file. Returns the URI it was finally written to.
    pub async fn save_data(&self, data: &[u8], destination: &str, policy: ConflictPolicy) -> Result<String> {
        let destination = FileUri::parse(destination)?;
        if let StorageTarget::Remote(remote) = self.resolve(&destination)? {
            self.preflight(&remote)?;
        }

        let destination = self.prepare_destination(destination, policy).await?;
        match self.resolve(&destination)? {
            StorageTarget::Remote(remote) => {
                self.preflight(&remote)?;
                let result = self
                    .store
                    .put_object(&self.key(&remote), data.to_vec(), &self.put_options(&remote))
                    .await
                    .map_err(|source| FileServiceError::WriteFailed {
                        uri: remote.to_string(),
                        source,
                    })?;
                self.record_remote_file(&remote, data.len() as u64, result.version_id);
            }
            StorageTarget::Local(path) => write_local(&path, data).await?,
        }
        Ok(destination.to_string())
    }

    /// Upload a local file to the remote location of `destination`,
    /// regardless of takeover settings. Existing objects are replaced.
    pub async fn upload_to_remote(&self, local_path: &Path, destination: &FileUri) -> Result<MetadataRecord> {
        if destination.scheme == Scheme::Temporary {
            return Err(FileServiceError::NotRemote(destination.to_string()));
        }
        self.preflight(destination)?;

        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(io_error(local_path))?
            .len();
        let result = self
            .store
            .upload_file(local_path, &self.key(destination), &self.put_options(destination))
            .await
            .map_err(|source| FileServiceError::WriteFailed {
                uri: destination.to_string(),
                source,
            })?;
        Ok(self.record_remote_file(destination, size, result.version_id))
    }

    /// Cached record of the remote location of `uri`
    pub fn cached_record(&self, uri: &FileUri) -> Result<Option<MetadataRecord>> {
        Ok(self.cache.get(&self.cache_uri(uri))?)
    }

    pub async fn delete(&self, uri: &str) -> Result<()> {
        let uri = FileUri::parse(uri)?;
        match self.resolve(&uri)? {
            StorageTarget::Remote(remote) => {
                if self.settings.read_only {
                    return Err(FileServiceError::ReadOnly);
                }
                if remote.is_root() {
                    return Err(FileServiceError::NotFound(remote.to_string()));
                }
                self.store
                    .delete_object(&self.key(&remote))
                    .await
                    .map_err(|source| FileServiceError::WriteFailed {
                        uri: remote.to_string(),
                        source,
                    })?;
                self.cache.delete(&self.cache_uri(&remote))?;
                tracing::debug!("Deleted {}", remote);
            }
            StorageTarget::Local(path) => match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FileServiceError::NotFound(uri.to_string()))
                }
                Err(e) => return Err(io_error(&path)(e)),
            },
        }
        Ok(())
    }

    /// Create a directory and its parents. Remote directories exist only as
    /// cache records.
    pub async fn mkdir(&self, uri: &str) -> Result<()> {
        let uri = FileUri::parse(uri)?;
        match self.resolve(&uri)? {
            StorageTarget::Remote(remote) => {
                self.preflight(&remote)?;
                let relative = self.settings.mapper.relative_path(&remote);
                if relative.is_empty() {
                    return Ok(());
                }
                let mut records = vec![MetadataRecord::directory(format!("s3://{}", relative))];
                records.extend(ancestors(&relative).map(|dir| MetadataRecord::directory(format!("s3://{}", dir))));
                self.cache.put_many(&records)?;
            }
            StorageTarget::Local(path) => {
                tokio::fs::create_dir_all(&path).await.map_err(io_error(&path))?;
            }
        }
        Ok(())
    }

    /// Remove an empty directory
    pub async fn rmdir(&self, uri: &str) -> Result<()> {
        let uri = FileUri::parse(uri)?;
        match self.resolve(&uri)? {
            StorageTarget::Remote(remote) => {
                if self.settings.read_only {
                    return Err(FileServiceError::ReadOnly);
                }
                let cache_uri = self.cache_uri(&remote);
                match self.cache.get(&cache_uri)? {
                    Some(record) if record.is_directory => {}
                    _ => return Err(FileServiceError::NotFound(remote.to_string())),
                }
                if !self.cache.list_children(&cache_uri)?.is_empty() {
                    return Err(FileServiceError::DirectoryNotEmpty(remote.to_string()));
                }
                // A folder marker object would bring the directory back on refresh
                self.store
                    .delete_object(&format!("{}/", self.key(&remote)))
                    .await
                    .map_err(|source| FileServiceError::WriteFailed {
                        uri: remote.to_string(),
                        source,
                    })?;
                self.cache.delete(&cache_uri)?;
            }
            StorageTarget::Local(path) => {
                let mut entries = tokio::fs::read_dir(&path).await.map_err(io_error(&path))?;
                if entries.next_entry().await.map_err(io_error(&path))?.is_some() {
                    return Err(FileServiceError::DirectoryNotEmpty(uri.to_string()));
                }
                tokio::fs::remove_dir(&path).await.map_err(io_error(&path))?;
            }
        }
        Ok(())
    }

    // ============ URLs ============

    /// Public URL of a remote file. Private files and configured prefixes
    /// get a presigned URL.
    pub fn external_url(&self, uri: &str) -> Result<String> {
        let uri = FileUri::parse(uri)?;
        let remote = match self.resolve(&uri)? {
            StorageTarget::Remote(remote) => remote,
            StorageTarget::Local(_) => return Err(FileServiceError::NotRemote(uri.to_string())),
        };
        let key = self.key(&remote);

        let presign = remote.scheme == Scheme::Private
            || self
                .settings
                .presigned_prefixes
                .iter()
                .any(|prefix| remote.path.starts_with(prefix.trim_start_matches('/')));
        if presign {
            return self
                .store
                .presigned_url(&key, self.settings.presigned_timeout_secs)
                .map_err(|source| FileServiceError::ReadFailed {
                    uri: remote.to_string(),
                    source,
                });
        }

        match self.settings.cname.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(cname) => {
                let encoded: Vec<String> = key.split('/').map(|s| urlencoding::encode(s).into_owned()).collect();
                let base = if cname.starts_with("http://") || cname.starts_with("https://") {
                    cname.trim_end_matches('/').to_string()
                } else {
                    format!("https://{}", cname.trim_end_matches('/'))
                };
                Ok(format!("{}/{}", base, encoded.join("/")))
            }
            None => Ok(self.store.object_url(&key)),
        }
    }
}

async fn write_local(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
    }
    tokio::fs::write(path, data).await.map_err(io_error(path))
}
