//! Filesystem artifact store.
//!
//! Implements the `ArtifactStore` trait from `kanflow-core` with files stored
//! under the data directory:
//!
//! ```text
//! {data_dir}/runs/{run_id}/
//!   progress.md
//!   step-outputs/
//!     plan.yml
//!     implement-0.md
//! ```
//!
//! Progress appends are serialized per run through an async mutex held in a
//! concurrent map. The log size is only checked every N appends; once it is
//! past the cap, further appends are skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use kanflow_core::workflow::artifacts::{
    output_file_name, validate_run_id, ArtifactError, ArtifactStore,
};
use kanflow_types::config::EngineLimits;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const PROGRESS_FILE: &str = "progress.md";
const STEP_OUTPUTS_DIR: &str = "step-outputs";

/// Append bookkeeping for one run's progress log.
#[derive(Debug, Default)]
struct ProgressLog {
    appends: u64,
    capped: bool,
}

/// Filesystem-backed artifact store.
#[derive(Debug)]
pub struct FsArtifactStore {
    base_dir: PathBuf,
    progress: DashMap<String, Arc<Mutex<ProgressLog>>>,
    max_progress_bytes: u64,
    check_interval: u32,
}

impl FsArtifactStore {
    /// Create a store rooted at `base_dir` with default limits.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_limits(base_dir, &EngineLimits::default())
    }

    pub fn with_limits(base_dir: impl Into<PathBuf>, limits: &EngineLimits) -> Self {
        Self {
            base_dir: base_dir.into(),
            progress: DashMap::new(),
            max_progress_bytes: limits.progress_log_max_bytes,
            check_interval: limits.progress_size_check_interval.max(1),
        }
    }

    /// `{base_dir}/runs/{run_id}/`.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join("runs").join(run_id)
    }

    /// `{base_dir}/runs/{run_id}/progress.md`.
    pub fn progress_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(PROGRESS_FILE)
    }

    fn progress_lock(&self, run_id: &str) -> Arc<Mutex<ProgressLog>> {
        Arc::clone(
            self.progress
                .entry(run_id.to_string())
                .or_default()
                .value(),
        )
    }
}

async fn file_size(path: &Path) -> Result<u64, std::io::Error> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

impl ArtifactStore for FsArtifactStore {
    async fn write_step_output(
        &self,
        run_id: &str,
        file_name: &str,
        content: &str,
    ) -> Result<String, ArtifactError> {
        validate_run_id(run_id)?;
        let file_name = output_file_name(file_name)?;

        let dir = self.run_dir(run_id).join(STEP_OUTPUTS_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(&file_name);
        tokio::fs::write(&path, content).await?;

        tracing::debug!(run_id, path = %path.display(), bytes = content.len(), "step output written");
        Ok(path.to_string_lossy().into_owned())
    }

    async fn append_progress(&self, run_id: &str, entry: &str) -> Result<(), ArtifactError> {
        validate_run_id(run_id)?;
        let lock = self.progress_lock(run_id);
        let mut log = lock.lock().await;
        if log.capped {
            return Ok(());
        }

        let path = self.progress_path(run_id);
        log.appends += 1;
        if log.appends % u64::from(self.check_interval) == 0
            && file_size(&path).await? > self.max_progress_bytes
        {
            tracing::warn!(run_id, "progress log exceeds size cap, skipping further appends");
            log.capped = true;
            return Ok(());
        }

        tokio::fs::create_dir_all(self.run_dir(run_id)).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        if !entry.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn read_progress(&self, run_id: &str) -> Result<String, ArtifactError> {
        validate_run_id(run_id)?;
        match tokio::fs::read_to_string(self.progress_path(run_id)).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn finish_run(&self, run_id: &str) {
        if self.progress.remove(run_id).is_some() {
            tracing::debug!(run_id, "progress bookkeeping released");
        }
    }
}
