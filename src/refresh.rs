//! Metadata cache refresh
//!
//! Rebuilds the whole cache from the bucket listing. Each step fetches one
//! page of up to 1000 keys and writes its file records into the shadow
//! table; folder paths are collected in the cursor. After the last page the
//! folder records are written and the shadow table is swapped in.
//!
//! A failed page fetch aborts the refresh before the swap, so the live cache
//! keeps serving the previous listing. The abandoned shadow table is
//! dropped by the next refresh.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::batch::{estimate_percent, run_to_completion, BatchJob, Progress, Step};
use crate::metadata_cache::{CacheError, MetadataRecord, MetadataStore};
use crate::paths::{ancestors, validate_cache_uri, KeyMapper};
use crate::providers::{normalize_version, ObjectInfo, ObjectStore, PageToken, ProviderError};

/// Keys requested per listing call
pub const PAGE_SIZE: usize = 1000;

/// Progress estimate used when the cache is empty
pub const DEFAULT_ESTIMATE: u64 = 10_000;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Listing the bucket failed: {0}")]
    Listing(#[from] ProviderError),

    #[error("Writing the metadata cache failed: {0}")]
    Cache(#[from] CacheError),
}

/// Refresh state carried from one step to the next
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshCursor {
    /// Where the next page starts; `None` before the first page
    pub token: Option<PageToken>,
    /// File records written so far
    pub processed: u64,
    /// Keys left out of the cache (unsupported paths)
    pub skipped: u64,
    pub pages: u64,
    /// Row count of the previous cache, or `DEFAULT_ESTIMATE`
    pub estimated_total: u64,
    /// Folder paths (relative to the root folder) seen so far
    pub folders: BTreeSet<String>,
    pub started_at: DateTime<Utc>,
}

/// Summary of a completed refresh
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub files: u64,
    pub folders: u64,
    pub skipped: u64,
    pub pages: u64,
    pub elapsed: Duration,
}

/// Rebuilds the metadata cache from the bucket
pub struct CacheRefresher {
    store: Arc<dyn ObjectStore>,
    cache: Arc<dyn MetadataStore>,
    mapper: KeyMapper,
    versioning: bool,
}

impl CacheRefresher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<dyn MetadataStore>,
        mapper: KeyMapper,
        versioning: bool,
    ) -> Self {
        Self {
            store,
            cache,
            mapper,
            versioning,
        }
    }

    /// Run a full refresh without progress reporting
    pub async fn refresh(&self) -> Result<RefreshReport, RefreshError> {
        run_to_completion(self, None, |_| {}).await
    }

    fn add_folder(folders: &mut BTreeSet<String>, folder: &str) {
        if folder.is_empty() {
            return;
        }
        folders.insert(folder.to_string());
        for ancestor in ancestors(folder) {
            folders.insert(ancestor.to_string());
        }
    }

    /// Turn one listing page into file records, updating the cursor
    fn collect_records(&self, objects: Vec<ObjectInfo>, cursor: &mut RefreshCursor) -> Vec<MetadataRecord> {
        let mut records = Vec::with_capacity(objects.len());

        for object in objects {
            // Older versions of a key stay out of the cache
            if !object.is_latest {
                continue;
            }
            let Some(relative) = self.mapper.key_to_relative(&object.key) else {
                continue;
            };

            if object.is_folder_marker() {
                Self::add_folder(&mut cursor.folders, relative.trim_end_matches('/'));
                continue;
            }

            let uri = format!("s3://{}", relative);
            if let Err(e) = validate_cache_uri(&uri) {
                tracing::debug!("[REFRESH] Skipping {}: {}", object.key, e);
                cursor.skipped += 1;
                continue;
            }

            if let Some(parent) = ancestors(relative).next() {
                Self::add_folder(&mut cursor.folders, parent);
            }
            records.push(MetadataRecord::file(
                uri,
                object.size,
                object.last_modified,
                normalize_version(object.version_id),
            ));
        }

        records
    }

    /// Write folder records and swap the shadow table in
    fn finish(&self, cursor: RefreshCursor) -> Result<RefreshReport, RefreshError> {
        let mut skipped = cursor.skipped;
        let folders: Vec<MetadataRecord> = cursor
            .folders
            .iter()
            .map(|folder| format!("s3://{}", folder))
            .filter(|uri| match validate_cache_uri(uri) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("[REFRESH] Skipping folder: {}", e);
                    skipped += 1;
                    false
                }
            })
            .map(MetadataRecord::directory)
            .collect();

        self.cache.write_rebuild(&folders)?;
        self.cache.commit_rebuild()?;

        let elapsed = (Utc::now() - cursor.started_at).to_std().unwrap_or_default();
        let report = RefreshReport {
            files: cursor.processed,
            folders: folders.len() as u64,
            skipped,
            pages: cursor.pages,
            elapsed,
        };
        tracing::info!(
            "[REFRESH] Cache rebuilt: {} files, {} folders, {} skipped in {:.1}s",
            report.files,
            report.folders,
            report.skipped,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }
}

#[async_trait]
impl BatchJob for CacheRefresher {
    type Cursor = RefreshCursor;
    type Report = RefreshReport;
    type Error = RefreshError;

    async fn start(&self) -> Result<RefreshCursor, RefreshError> {
        let previous = self.cache.row_count()?;
        self.cache.begin_rebuild()?;
        tracing::info!(
            "[REFRESH] Refreshing metadata cache from {} ({} rows cached)",
            self.store.display_name(),
            previous
        );

        Ok(RefreshCursor {
            token: None,
            processed: 0,
            skipped: 0,
            pages: 0,
            estimated_total: if previous > 0 { previous } else { DEFAULT_ESTIMATE },
            folders: BTreeSet::new(),
            started_at: Utc::now(),
        })
    }

    async fn step(
        &self,
        mut cursor: RefreshCursor,
        _report: &mut (dyn for<'p> FnMut(&'p Progress) + Send),
    ) -> Result<Step<RefreshCursor, RefreshReport>, RefreshError> {
        let prefix = self.mapper.list_prefix();
        let page = self
            .store
            .list_page(&prefix, cursor.token.as_ref(), PAGE_SIZE, self.versioning)
            .await
            .map_err(|e| {
                tracing::error!("[REFRESH] Page {} failed, cache left unchanged: {}", cursor.pages + 1, e);
                e
            })?;

        let records = self.collect_records(page.objects, &mut cursor);
        self.cache.write_rebuild(&records)?;
        cursor.processed += records.len() as u64;
        cursor.pages += 1;

        match page.next {
            Some(token) => {
                cursor.token = Some(token);
                Ok(Step::Continue(cursor))
            }
            None => Ok(Step::Finished(self.finish(cursor)?)),
        }
    }

    fn progress(&self, cursor: &RefreshCursor) -> Progress {
        Progress {
            percent: estimate_percent(cursor.processed, cursor.estimated_total),
            processed: cursor.processed,
            message: format!("Cached {} files ({} pages)", cursor.processed, cursor.pages),
        }
    }
}
