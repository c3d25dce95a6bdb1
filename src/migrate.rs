//! Local-to-bucket migration
//!
//! Copies the files of the local `public://` and/or `private://` directories
//! to their remote locations, whether or not those schemes are taken over
//! yet. Files are compared with their cached record first, so a re-run only
//! uploads what changed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use walkdir::WalkDir;

use crate::batch::{run_to_completion, BatchJob, CursorFile, Progress, Step};
use crate::file_service::FileService;
use crate::metadata_cache::MetadataRecord;
use crate::paths::{FileUri, Scheme};

/// Files handled per batch step
pub const CHUNK_SIZE: usize = 50;

/// Progress is recomputed and reported every this many files
pub const PROGRESS_INTERVAL: usize = 5;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("The remote file system is read-only")]
    ReadOnly,

    #[error("No local directory configured for {0}://")]
    NoLocalDirectory(Scheme),
}

/// When an already-cached file is uploaded again
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum UploadCondition {
    /// Upload every file
    #[default]
    Always,
    /// Upload when the local file is newer than the cached record
    Newer,
    /// Upload when the size differs from the cached record
    Size,
    /// Upload when either `newer` or `size` holds
    #[value(name = "newer_size")]
    NewerSize,
}

impl UploadCondition {
    /// Whether a local file with `mtime` and `size` should be uploaded over
    /// `cached`. Uncached files are always uploaded.
    pub fn should_upload(&self, mtime: i64, size: u64, cached: Option<&MetadataRecord>) -> bool {
        let Some(cached) = cached else {
            return true;
        };
        let newer = mtime > cached.timestamp;
        let resized = size != cached.filesize;
        match self {
            UploadCondition::Always => true,
            UploadCondition::Newer => newer,
            UploadCondition::Size => resized,
            UploadCondition::NewerSize => newer || resized,
        }
    }
}

/// Which local directories to migrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MigrateScheme {
    Public,
    Private,
    All,
}

impl MigrateScheme {
    pub fn schemes(&self) -> &'static [Scheme] {
        match self {
            MigrateScheme::Public => &[Scheme::Public],
            MigrateScheme::Private => &[Scheme::Private],
            MigrateScheme::All => &[Scheme::Public, Scheme::Private],
        }
    }
}

/// A local file waiting to be migrated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFile {
    pub scheme: Scheme,
    /// Path below the scheme's local directory, `/`-separated
    pub relative: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCursor {
    pub files: Vec<PendingFile>,
    pub position: usize,
    pub uploaded: u32,
    pub skipped: u32,
    pub errors: Vec<MigrationFailure>,
    pub started_at: DateTime<Utc>,
}

/// Summary of a completed migration
#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub uploaded: u32,
    pub skipped: u32,
    pub failed: u32,
    pub errors: Vec<MigrationFailure>,
    pub elapsed: Duration,
}

enum Outcome {
    Uploaded,
    Skipped,
}

pub struct Migrator {
    service: Arc<FileService>,
    scheme: MigrateScheme,
    condition: UploadCondition,
}

impl Migrator {
    pub fn new(service: Arc<FileService>, scheme: MigrateScheme, condition: UploadCondition) -> Self {
        Self {
            service,
            scheme,
            condition,
        }
    }

    pub async fn run(&self, state: Option<&CursorFile>) -> Result<MigrationReport, MigrationError> {
        run_to_completion(self, state, |_| {}).await
    }

    fn local_root(&self, scheme: Scheme) -> Result<&Path, MigrationError> {
        let local = &self.service.settings().local;
        let root = match scheme {
            Scheme::Public => local.public.as_deref(),
            Scheme::Private => local.private.as_deref(),
            Scheme::S3 | Scheme::Temporary => None,
        };
        root.ok_or(MigrationError::NoLocalDirectory(scheme))
    }

    /// Walk the local directory of `scheme`. Entries that cannot be read
    /// are recorded in `failures` and the walk goes on.
    fn collect_files(
        &self,
        scheme: Scheme,
        files: &mut Vec<PendingFile>,
        failures: &mut Vec<MigrationFailure>,
    ) -> Result<(), MigrationError> {
        let root = self.local_root(scheme)?;
        if !root.exists() {
            tracing::warn!("[BATCH] Local {}:// directory {:?} does not exist, nothing to copy", scheme, root);
            return Ok(());
        }

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let relative = e
                        .path()
                        .map(|p| p.strip_prefix(root).unwrap_or(p).to_string_lossy().replace('\\', "/"))
                        .unwrap_or_default();
                    let path = format!("{}://{}", scheme, relative);
                    tracing::warn!("[BATCH] Cannot scan {}: {}", path, e);
                    failures.push(MigrationFailure {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            files.push(PendingFile {
                scheme,
                relative: relative.to_string_lossy().replace('\\', "/"),
                local_path: entry.path().to_path_buf(),
            });
        }
        Ok(())
    }

    async fn migrate_file(&self, file: &PendingFile) -> Result<Outcome, String> {
        let destination = FileUri::new(file.scheme, &file.relative).map_err(|e| e.to_string())?;
        let meta = tokio::fs::metadata(&file.local_path)
            .await
            .map_err(|e| format!("Cannot read {:?}: {}", file.local_path, e))?;
        let mtime = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp())
            .unwrap_or(0);

        let cached = self.service.cached_record(&destination).map_err(|e| e.to_string())?;
        if !self.condition.should_upload(mtime, meta.len(), cached.as_ref()) {
            return Ok(Outcome::Skipped);
        }

        self.service
            .upload_to_remote(&file.local_path, &destination)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Outcome::Uploaded)
    }
}

#[async_trait]
impl BatchJob for Migrator {
    type Cursor = MigrationCursor;
    type Report = MigrationReport;
    type Error = MigrationError;

    async fn start(&self) -> Result<MigrationCursor, MigrationError> {
        if self.service.settings().read_only {
            return Err(MigrationError::ReadOnly);
        }

        let mut files = Vec::new();
        let mut errors = Vec::new();
        for scheme in self.scheme.schemes() {
            self.collect_files(*scheme, &mut files, &mut errors)?;
        }
        tracing::info!(
            "[BATCH] Copying {} local files to the bucket (condition: {:?})",
            files.len(),
            self.condition
        );

        Ok(MigrationCursor {
            files,
            position: 0,
            uploaded: 0,
            skipped: 0,
            errors,
            started_at: Utc::now(),
        })
    }

    async fn step(
        &self,
        mut cursor: MigrationCursor,
        report: &mut (dyn for<'p> FnMut(&'p Progress) + Send),
    ) -> Result<Step<MigrationCursor, MigrationReport>, MigrationError> {
        let end = (cursor.position + CHUNK_SIZE).min(cursor.files.len());

        for index in cursor.position..end {
            let file = &cursor.files[index];
            match self.migrate_file(file).await {
                Ok(Outcome::Uploaded) => cursor.uploaded += 1,
                Ok(Outcome::Skipped) => cursor.skipped += 1,
                Err(reason) => {
                    tracing::warn!("[BATCH] Failed to copy {}://{}: {}", file.scheme, file.relative, reason);
                    cursor.errors.push(MigrationFailure {
                        path: format!("{}://{}", file.scheme, file.relative),
                        reason,
                    });
                }
            }

            let done = index + 1;
            if done % PROGRESS_INTERVAL == 0 {
                let progress = progress_at(done, cursor.files.len());
                tracing::info!("[BATCH] {} ({:.0}%)", progress.message, progress.percent);
                report(&progress);
            }
        }
        cursor.position = end;

        if cursor.position < cursor.files.len() {
            return Ok(Step::Continue(cursor));
        }

        let elapsed = (Utc::now() - cursor.started_at).to_std().unwrap_or_default();
        let report = MigrationReport {
            uploaded: cursor.uploaded,
            skipped: cursor.skipped,
            failed: cursor.errors.len() as u32,
            errors: cursor.errors,
            elapsed,
        };
        tracing::info!(
            "[BATCH] Copy finished: {} uploaded, {} skipped, {} failed in {:.1}s",
            report.uploaded,
            report.skipped,
            report.failed,
            report.elapsed.as_secs_f64()
        );
        Ok(Step::Finished(report))
    }

    fn progress(&self, cursor: &MigrationCursor) -> Progress {
        progress_at(cursor.position, cursor.files.len())
    }
}

fn progress_at(done: usize, total: usize) -> Progress {
    let percent = if total == 0 {
        0.0
    } else {
        done as f64 / total as f64 * 100.0
    };
    Progress {
        percent,
        processed: done as u64,
        message: format!("Copied {} of {} files", done, total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::S3fsConfig;
    use crate::file_service::ServiceSettings;
    use crate::metadata_cache::{MetadataStore, SqliteMetadataCache};
    use crate::providers::memory::MemoryObjectStore;
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        cache: Arc<SqliteMetadataCache>,
        service: Arc<FileService>,
        local: tempfile::TempDir,
    }

    fn fixture_with(configure: impl FnOnce(&mut S3fsConfig)) -> Fixture {
        let local = tempfile::tempdir().unwrap();
        let mut config = S3fsConfig::for_bucket("test-bucket");
        config.local.public = Some(local.path().join("public"));
        config.local.private = Some(local.path().join("private"));
        configure(&mut config);

        let store = Arc::new(MemoryObjectStore::new());
        let cache = Arc::new(SqliteMetadataCache::in_memory("s3fs_file").unwrap());
        let service = Arc::new(FileService::new(store.clone(), cache.clone(), ServiceSettings::from(&config)));
        Fixture {
            store,
            cache,
            service,
            local,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn write(root: &Path, relative: &str, data: &[u8]) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_upload_conditions() {
        let cached = MetadataRecord::file("s3://x", 10, 1_000, None);
        assert!(UploadCondition::Newer.should_upload(0, 10, None));
        assert!(UploadCondition::Always.should_upload(500, 10, Some(&cached)));
        assert!(!UploadCondition::Newer.should_upload(1_000, 99, Some(&cached)));
        assert!(UploadCondition::Newer.should_upload(1_001, 10, Some(&cached)));
        assert!(UploadCondition::Size.should_upload(0, 11, Some(&cached)));
        assert!(!UploadCondition::Size.should_upload(5_000, 10, Some(&cached)));
        assert!(UploadCondition::NewerSize.should_upload(5_000, 10, Some(&cached)));
        assert!(!UploadCondition::NewerSize.should_upload(10, 10, Some(&cached)));
    }

    #[tokio::test]
    async fn test_copies_public_and_private() {
        let f = fixture();
        write(&f.local.path().join("public"), "css/site.css", b"body{}");
        write(&f.local.path().join("private"), "exports/users.csv", b"id");

        let migrator = Migrator::new(f.service.clone(), MigrateScheme::All, UploadCondition::Always);
        let report = migrator.run(None).await.unwrap();

        assert_eq!(report.uploaded, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(f.store.object("s3fs-public/css/site.css").unwrap().body, b"body{}");
        assert_eq!(f.store.object("s3fs-private/exports/users.csv").unwrap().acl, Some("private"));
        assert!(f.cache.get("s3://s3fs-public/css").unwrap().unwrap().is_directory);
    }

    #[tokio::test]
    async fn test_newer_condition_skips_up_to_date_files() {
        let f = fixture();
        write(&f.local.path().join("public"), "logo.png", b"png");
        let future = Utc::now().timestamp() + 86_400;
        let cached = MetadataRecord::file("s3://s3fs-public/logo.png", 3, future, None);
        f.cache.put(&cached).unwrap();

        let migrator = Migrator::new(f.service.clone(), MigrateScheme::Public, UploadCondition::Newer);
        let report = migrator.run(None).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.uploaded, 0);
        assert_eq!(f.store.puts.load(Ordering::SeqCst), 0);
        assert_eq!(f.cache.get("s3://s3fs-public/logo.png").unwrap().unwrap(), cached);
    }

    #[tokio::test]
    async fn test_failures_are_collected() {
        let f = fixture();
        let public = f.local.path().join("public");
        write(&public, "ok.txt", b"fine");
        write(&public, &format!("{}/{}.txt", "a".repeat(200), "b".repeat(100)), b"long");
        write(&public, "nested/🙂.txt", b"emoji");

        let migrator = Migrator::new(f.service.clone(), MigrateScheme::Public, UploadCondition::Always);
        let report = migrator.run(None).await.unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().any(|e| e.path.contains("🙂")));
        assert!(f.store.contains("s3fs-public/ok.txt"));
    }

    #[tokio::test]
    async fn test_runs_in_chunks() {
        let f = fixture();
        let public = f.local.path().join("public");
        for i in 0..120 {
            write(&public, &format!("bulk/{:03}.txt", i), b"b");
        }

        let migrator = Migrator::new(f.service.clone(), MigrateScheme::Public, UploadCondition::Always);
        let mut updates = 0;
        let report = run_to_completion(&migrator, None, |_| updates += 1).await.unwrap();

        assert_eq!(report.uploaded, 120);
        // One update before each of the three steps, one per five files and
        // the final report
        assert_eq!(updates, 3 + 120 / PROGRESS_INTERVAL + 1);
        assert_eq!(f.store.puts.load(Ordering::SeqCst), 120);
    }

    #[tokio::test]
    async fn test_progress_every_five_files() {
        let f = fixture();
        let public = f.local.path().join("public");
        for i in 0..40 {
            write(&public, &format!("f{:02}.txt", i), b"x");
        }

        let migrator = Migrator::new(f.service.clone(), MigrateScheme::Public, UploadCondition::Always);
        let mut seen = Vec::new();
        run_to_completion(&migrator, None, |p| seen.push(p.percent)).await.unwrap();

        // Start of the step, one update per five files, then the final report
        assert_eq!(seen.len(), 1 + 40 / PROGRESS_INTERVAL + 1);
        assert_eq!(seen[0], 0.0);
        assert_eq!(seen[1], 12.5);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100.0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_directory_does_not_stop_the_copy() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        let public = f.local.path().join("public");
        write(&public, "a.txt", b"a");
        write(&public, "locked/secret.txt", b"s");
        write(&public, "z.txt", b"z");
        let locked = public.join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        // Privileged users can still read the directory
        let readable = std::fs::read_dir(&locked).is_ok();

        let migrator = Migrator::new(f.service.clone(), MigrateScheme::Public, UploadCondition::Always);
        let report = migrator.run(None).await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        let report = report.unwrap();

        assert!(f.store.contains("s3fs-public/a.txt"));
        assert!(f.store.contains("s3fs-public/z.txt"));
        if readable {
            assert_eq!(report.failed, 0);
        } else {
            assert_eq!(report.uploaded, 2);
            assert_eq!(report.failed, 1);
            assert_eq!(report.errors[0].path, "public://locked");
        }
    }

    #[tokio::test]
    async fn test_read_only_refuses_to_start() {
        let f = fixture_with(|c| c.read_only = true);
        let migrator = Migrator::new(f.service.clone(), MigrateScheme::All, UploadCondition::Always);
        assert!(matches!(migrator.run(None).await, Err(MigrationError::ReadOnly)));
    }

    #[tokio::test]
    async fn test_missing_local_directory() {
        let f = fixture_with(|c| c.local.private = None);
        let migrator = Migrator::new(f.service.clone(), MigrateScheme::Private, UploadCondition::Always);
        assert!(matches!(
            migrator.run(None).await,
            Err(MigrationError::NoLocalDirectory(Scheme::Private))
        ));
    }
}
