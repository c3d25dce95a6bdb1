//! Object Store Module
//!
//! The file system layer talks to the bucket through the `ObjectStore`
//! trait. The production implementation is `S3Client`; tests use an
//! in-memory store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ FileService  │   │CacheRefresher│   │   Migrator   │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        └──────────────────┼──────────────────┘
//!                           ▼
//!              ┌─────────────────────────┐
//!              │   ObjectStore (trait)   │
//!              │ list, head, put, copy…  │
//!              └────────────┬────────────┘
//!                           ▼
//!                    ┌────────────┐
//!                    │  S3Client  │──► retry ──► reqwest
//!                    └────────────┘
//! ```

pub mod types;
pub mod retry;
pub mod s3;
#[cfg(test)]
pub(crate) mod memory;

pub use types::*;
pub use s3::S3Client;

use async_trait::async_trait;
use std::path::Path;

/// Remote object store operations used by the file system layer
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get display name for this store
    fn display_name(&self) -> String;

    /// Verify the bucket is reachable with the configured credentials
    async fn check_access(&self) -> Result<(), ProviderError>;

    /// Fetch one page of the bucket listing under `prefix`.
    ///
    /// With `versions` set, every version of every key is listed and
    /// `ObjectInfo::is_latest` marks the current one.
    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&PageToken>,
        max_keys: usize,
        versions: bool,
    ) -> Result<ListPage, ProviderError>;

    /// Object metadata, `None` if the key does not exist
    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>, ProviderError>;

    /// Download an object into memory
    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ProviderError>;

    /// Upload an object from memory
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<WriteResult, ProviderError>;

    /// Upload a local file
    async fn upload_file(
        &self,
        local_path: &Path,
        key: &str,
        options: &PutOptions,
    ) -> Result<WriteResult, ProviderError> {
        let data = tokio::fs::read(local_path).await?;
        self.put_object(key, data, options).await
    }

    /// Copy an object within the bucket without transferring its content
    async fn copy_object(
        &self,
        from_key: &str,
        to_key: &str,
        options: &PutOptions,
    ) -> Result<WriteResult, ProviderError>;

    /// Delete an object
    async fn delete_object(&self, key: &str) -> Result<(), ProviderError>;

    /// Plain (unsigned) URL of an object
    fn object_url(&self, key: &str) -> String;

    /// Time-limited signed GET URL of an object
    fn presigned_url(&self, key: &str, expires_in_secs: u64) -> Result<String, ProviderError>;
}
