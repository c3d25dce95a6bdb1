// Batch step runner
// Long jobs run as a sequence of bounded steps; each step takes the cursor
// produced by the previous one and returns the next cursor or a final report.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Outcome of one batch step
#[derive(Debug)]
pub enum Step<C, R> {
    /// More work remains; pass this cursor to the next step
    Continue(C),
    /// The job is done
    Finished(R),
}

/// Progress snapshot reported between steps
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Completion in percent (0.0 - 100.0)
    pub percent: f64,
    /// Items processed so far
    pub processed: u64,
    /// Human-readable status line
    pub message: String,
}

/// A resumable job driven one step at a time
#[async_trait]
pub trait BatchJob: Send + Sync {
    type Cursor: Serialize + DeserializeOwned + Send;
    type Report: Send;
    type Error: std::error::Error + Send;

    /// Create the initial cursor (and any state the job needs, such as the
    /// shadow table of a cache refresh)
    async fn start(&self) -> Result<Self::Cursor, Self::Error>;

    /// Run one bounded unit of work. Jobs with long steps may call `report`
    /// with intermediate progress.
    async fn step(
        &self,
        cursor: Self::Cursor,
        report: &mut (dyn for<'p> FnMut(&'p Progress) + Send),
    ) -> Result<Step<Self::Cursor, Self::Report>, Self::Error>;

    /// Progress of a cursor, for display only
    fn progress(&self, cursor: &Self::Cursor) -> Progress;
}

/// Optional on-disk copy of a job's cursor, so an interrupted run can pick
/// up where it stopped
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load a saved cursor (returns None if not found or unreadable)
    pub fn load<C: DeserializeOwned>(&self) -> Option<C> {
        let data = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&data) {
            Ok(cursor) => Some(cursor),
            Err(e) => {
                tracing::warn!("[BATCH] Ignoring unreadable state file {:?}: {}", self.path, e);
                None
            }
        }
    }

    pub fn save<C: Serialize>(&self, cursor: &C) -> Result<(), String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create state directory: {}", e))?;
        }
        let data = serde_json::to_string(cursor)
            .map_err(|e| format!("Failed to serialize batch state: {}", e))?;
        // Write-then-rename; readers never see a partial file
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data).map_err(|e| format!("Failed to write batch state: {}", e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| format!("Failed to write batch state: {}", e))?;
        Ok(())
    }

    pub fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("[BATCH] Failed to remove state file {:?}: {}", self.path, e);
            }
        }
    }
}

/// Drive a job to completion.
///
/// With a `state` file the cursor is saved after every step, and a cursor
/// found there at start-up is resumed instead of starting afresh. The file
/// is removed once the job finishes. A step error stops the run and leaves
/// the last good cursor on disk.
pub async fn run_to_completion<J, F>(
    job: &J,
    state: Option<&CursorFile>,
    mut on_progress: F,
) -> Result<J::Report, J::Error>
where
    J: BatchJob,
    F: FnMut(&Progress) + Send,
{
    let resumed = state.and_then(|s| s.load::<J::Cursor>());
    let mut cursor = match resumed {
        Some(cursor) => {
            tracing::info!("[BATCH] Resuming from saved state");
            cursor
        }
        None => job.start().await?,
    };

    loop {
        on_progress(&job.progress(&cursor));
        match job.step(cursor, &mut on_progress).await? {
            Step::Continue(next) => {
                if let Some(state) = state {
                    if let Err(e) = state.save(&next) {
                        tracing::warn!("[BATCH] {}", e);
                    }
                }
                cursor = next;
            }
            Step::Finished(report) => {
                if let Some(state) = state {
                    state.clear();
                }
                on_progress(&Progress {
                    percent: 100.0,
                    processed: 0,
                    message: "Finished".to_string(),
                });
                return Ok(report);
            }
        }
    }
}

/// Percentage of `processed` against `estimate`, held below 100 until the
/// job reports completion
pub fn estimate_percent(processed: u64, estimate: u64) -> f64 {
    if estimate == 0 {
        return 0.0;
    }
    (processed as f64 / estimate as f64 * 100.0).min(99.0)
}
