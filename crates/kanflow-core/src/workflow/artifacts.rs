//! Per-run artifact storage: step output files and the progress log.
//!
//! `ArtifactStore` is the storage port. The filesystem implementation lives
//! in `kanflow-infra`; `MemoryArtifactStore` backs tests and embedding.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use kanflow_types::config::EngineLimits;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("invalid run id '{0}'")]
    InvalidRunId(String),

    #[error("invalid artifact file name '{0}'")]
    InvalidFileName(String),

    #[error("artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

/// Replace every character outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reject run ids that would not survive sanitization unchanged.
pub fn validate_run_id(run_id: &str) -> Result<(), ArtifactError> {
    if run_id.is_empty()
        || run_id == "."
        || run_id == ".."
        || sanitize_file_name(run_id) != run_id
    {
        return Err(ArtifactError::InvalidRunId(run_id.to_string()));
    }
    Ok(())
}

/// Sanitize an output file name, refusing names that collapse to nothing.
pub fn output_file_name(name: &str) -> Result<String, ArtifactError> {
    let sanitized = sanitize_file_name(name);
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        return Err(ArtifactError::InvalidFileName(name.to_string()));
    }
    Ok(sanitized)
}

// ---------------------------------------------------------------------------
// ArtifactStore trait
// ---------------------------------------------------------------------------

/// Storage for step outputs and the per-run progress log.
///
/// Uses RPITIT for async methods; wrap in `BoxArtifactStore` for dynamic dispatch.
pub trait ArtifactStore: Send + Sync {
    /// Write a step output file and return where it was stored.
    fn write_step_output(
        &self,
        run_id: &str,
        file_name: &str,
        content: &str,
    ) -> impl Future<Output = Result<String, ArtifactError>> + Send;

    /// Append an entry to the run's progress log.
    ///
    /// Appends past the size cap are skipped without error.
    fn append_progress(
        &self,
        run_id: &str,
        entry: &str,
    ) -> impl Future<Output = Result<(), ArtifactError>> + Send;

    /// The full progress log, empty if nothing was written yet.
    fn read_progress(
        &self,
        run_id: &str,
    ) -> impl Future<Output = Result<String, ArtifactError>> + Send;

    /// Release per-run bookkeeping once the run has stopped. Stored
    /// artifacts are kept.
    fn finish_run(&self, _run_id: &str) {}
}

/// Object-safe version of [`ArtifactStore`] with boxed futures.
pub trait ArtifactStoreDyn: Send + Sync {
    fn write_step_output_boxed<'a>(
        &'a self,
        run_id: &'a str,
        file_name: &'a str,
        content: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ArtifactError>> + Send + 'a>>;

    fn append_progress_boxed<'a>(
        &'a self,
        run_id: &'a str,
        entry: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), ArtifactError>> + Send + 'a>>;

    fn read_progress_boxed<'a>(
        &'a self,
        run_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ArtifactError>> + Send + 'a>>;

    fn finish_run_dyn(&self, run_id: &str);
}

impl<T: ArtifactStore> ArtifactStoreDyn for T {
    fn write_step_output_boxed<'a>(
        &'a self,
        run_id: &'a str,
        file_name: &'a str,
        content: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ArtifactError>> + Send + 'a>> {
        Box::pin(self.write_step_output(run_id, file_name, content))
    }

    fn append_progress_boxed<'a>(
        &'a self,
        run_id: &'a str,
        entry: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), ArtifactError>> + Send + 'a>> {
        Box::pin(self.append_progress(run_id, entry))
    }

    fn read_progress_boxed<'a>(
        &'a self,
        run_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ArtifactError>> + Send + 'a>> {
        Box::pin(self.read_progress(run_id))
    }

    fn finish_run_dyn(&self, run_id: &str) {
        self.finish_run(run_id);
    }
}

/// Type-erased artifact store.
pub struct BoxArtifactStore {
    inner: Box<dyn ArtifactStoreDyn + Send + Sync>,
}

impl BoxArtifactStore {
    pub fn new<T: ArtifactStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn write_step_output(
        &self,
        run_id: &str,
        file_name: &str,
        content: &str,
    ) -> Result<String, ArtifactError> {
        self.inner
            .write_step_output_boxed(run_id, file_name, content)
            .await
    }

    pub async fn append_progress(&self, run_id: &str, entry: &str) -> Result<(), ArtifactError> {
        self.inner.append_progress_boxed(run_id, entry).await
    }

    pub async fn read_progress(&self, run_id: &str) -> Result<String, ArtifactError> {
        self.inner.read_progress_boxed(run_id).await
    }

    pub fn finish_run(&self, run_id: &str) {
        self.inner.finish_run_dyn(run_id);
    }
}

impl std::fmt::Debug for BoxArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxArtifactStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryRun {
    progress: String,
    appends: u64,
    capped: bool,
    finished: bool,
    outputs: Vec<(String, String)>,
}

/// In-memory artifact store with the same size-cap semantics as the
/// filesystem store. Clones share the same storage.
#[derive(Debug, Clone)]
pub struct MemoryArtifactStore {
    runs: Arc<DashMap<String, MemoryRun>>,
    max_progress_bytes: u64,
    check_interval: u32,
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::with_limits(&EngineLimits::default())
    }
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: &EngineLimits) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            max_progress_bytes: limits.progress_log_max_bytes,
            check_interval: limits.progress_size_check_interval.max(1),
        }
    }

    /// Content of a stored output, looked up by the path returned from
    /// `write_step_output`.
    pub fn output(&self, run_id: &str, path: &str) -> Option<String> {
        self.runs.get(run_id).and_then(|run| {
            run.outputs
                .iter()
                .rev()
                .find(|(p, _)| p == path)
                .map(|(_, c)| c.clone())
        })
    }

    /// Whether `finish_run` was called for the run. Outputs stay readable.
    pub fn is_finished(&self, run_id: &str) -> bool {
        self.runs.get(run_id).is_some_and(|run| run.finished)
    }

    /// Every output path written for a run, in write order.
    pub fn output_paths(&self, run_id: &str) -> Vec<String> {
        self.runs
            .get(run_id)
            .map(|run| run.outputs.iter().map(|(p, _)| p.clone()).collect())
            .unwrap_or_default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    async fn write_step_output(
        &self,
        run_id: &str,
        file_name: &str,
        content: &str,
    ) -> Result<String, ArtifactError> {
        validate_run_id(run_id)?;
        let file_name = output_file_name(file_name)?;
        let path = format!("runs/{run_id}/step-outputs/{file_name}");
        self.runs
            .entry(run_id.to_string())
            .or_default()
            .outputs
            .push((path.clone(), content.to_string()));
        Ok(path)
    }

    async fn append_progress(&self, run_id: &str, entry: &str) -> Result<(), ArtifactError> {
        validate_run_id(run_id)?;
        let mut run = self.runs.entry(run_id.to_string()).or_default();
        if run.capped {
            return Ok(());
        }
        run.appends += 1;
        if run.appends % u64::from(self.check_interval) == 0
            && run.progress.len() as u64 > self.max_progress_bytes
        {
            tracing::warn!(run_id, "progress log exceeds size cap, skipping further appends");
            run.capped = true;
            return Ok(());
        }
        run.progress.push_str(entry);
        if !entry.ends_with('\n') {
            run.progress.push('\n');
        }
        Ok(())
    }

    async fn read_progress(&self, run_id: &str) -> Result<String, ArtifactError> {
        validate_run_id(run_id)?;
        Ok(self
            .runs
            .get(run_id)
            .map(|run| run.progress.clone())
            .unwrap_or_default())
    }

    fn finish_run(&self, run_id: &str) {
        if let Some(mut run) = self.runs.get_mut(run_id) {
            run.finished = true;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_run_id() {
        assert!(validate_run_id("0192f0c4-7b7e-7000-8000-000000000001").is_ok());
        assert!(validate_run_id("run_1.retry").is_ok());
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("..").is_err());
        assert!(validate_run_id("../etc").is_err());
        assert!(validate_run_id("a/b").is_err());
        assert!(validate_run_id("run 1").is_err());
    }

    #[test]
    fn test_output_file_name_sanitizes() {
        assert_eq!(output_file_name("plan.yml").unwrap(), "plan.yml");
        assert_eq!(output_file_name("../x/y.md").unwrap(), ".._x_y.md");
        assert!(output_file_name("..").is_err());
    }

    #[tokio::test]
    async fn test_memory_store_outputs_and_progress() {
        let store = MemoryArtifactStore::new();
        let path = store.write_step_output("run-1", "plan.yml", "a: 1").await.unwrap();
        assert_eq!(path, "runs/run-1/step-outputs/plan.yml");
        assert_eq!(store.output("run-1", &path).as_deref(), Some("a: 1"));

        store.append_progress("run-1", "## first").await.unwrap();
        store.append_progress("run-1", "## second\n").await.unwrap();
        assert_eq!(store.read_progress("run-1").await.unwrap(), "## first\n## second\n");
        assert_eq!(store.read_progress("run-2").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_memory_store_rejects_bad_run_id() {
        let store = MemoryArtifactStore::new();
        let err = store.append_progress("../escape", "x").await.unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidRunId(_)));
    }

    #[tokio::test]
    async fn test_progress_cap_checked_every_n_appends() {
        let limits = EngineLimits {
            progress_log_max_bytes: 10,
            progress_size_check_interval: 3,
            ..EngineLimits::default()
        };
        let store = MemoryArtifactStore::with_limits(&limits);
        for i in 0..6 {
            store.append_progress("r", &format!("entry-{i}")).await.unwrap();
        }
        // appends 1 and 2 land, the 3rd check sees > 10 bytes and caps the log
        let log = store.read_progress("r").await.unwrap();
        assert_eq!(log, "entry-0\nentry-1\n");
    }
}
