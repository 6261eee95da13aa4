//! Run orchestrator: drives a workflow's steps in order for one task.
//!
//! # Execution flow
//!
//! 1. Validate the definition and create a `WorkflowRun` (UUIDv7 id, seeded
//!    context, one pending `StepRun` per step).
//! 2. For each step: mark it running, execute it under the run's
//!    cancellation token, then commit the output and recorded sessions.
//! 3. On failure, consult the step's `on_fail` policy: retry (optionally from
//!    an earlier step), block on a human escalation, or fail the run.
//! 4. Append run start/finish entries to the progress log and deregister.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use kanflow_types::workflow::{RunStatus, StepStatus, WorkflowDefinition, WorkflowRun};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{commit_step_output, new_run, record_sessions};
use super::definition::{validate_definition, WorkflowError};
use super::retry::RetryPolicy;
use super::step_executor::{SharedRun, StepError, StepExecutor};

// ---------------------------------------------------------------------------
// OrchestratorError
// ---------------------------------------------------------------------------

/// Errors from run management. Step failures end up in the run's status,
/// not here.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("run not found: {0}")]
    RunNotFound(String),
}

/// How a run stopped.
struct RunEnd {
    status: RunStatus,
    error: Option<String>,
}

impl RunEnd {
    fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            error: None,
        }
    }

    fn with_error(status: RunStatus, error: String) -> Self {
        Self {
            status,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// RunOrchestrator
// ---------------------------------------------------------------------------

/// Sequences steps within runs and owns the registry of active runs.
pub struct RunOrchestrator {
    executor: StepExecutor,
    runs: DashMap<String, SharedRun>,
    cancellation_tokens: DashMap<String, CancellationToken>,
}

impl RunOrchestrator {
    pub fn new(executor: StepExecutor) -> Self {
        Self {
            executor,
            runs: DashMap::new(),
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Create and register a run without executing it.
    pub fn prepare(
        &self,
        definition: &WorkflowDefinition,
        task: Value,
    ) -> Result<String, OrchestratorError> {
        validate_definition(definition)?;

        let run_id = Uuid::now_v7().to_string();
        let run = new_run(definition, run_id.clone(), task);
        self.runs
            .insert(run_id.clone(), Arc::new(RwLock::new(run)));
        self.cancellation_tokens
            .insert(run_id.clone(), CancellationToken::new());

        tracing::debug!(run_id = %run_id, workflow = %definition.id, "run prepared");
        Ok(run_id)
    }

    /// Create a run and drive it to a terminal or blocked state.
    pub async fn start(
        &self,
        definition: &WorkflowDefinition,
        task: Value,
    ) -> Result<WorkflowRun, OrchestratorError> {
        let run_id = self.prepare(definition, task)?;
        self.execute(&run_id, definition).await
    }

    /// Drive a prepared run. The run is deregistered when it stops.
    pub async fn execute(
        &self,
        run_id: &str,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowRun, OrchestratorError> {
        let run = self
            .runs
            .get(run_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        let token = self
            .cancellation_tokens
            .get(run_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;

        {
            let mut guard = run.write().await;
            guard.status = RunStatus::Running;
            guard.started_at = Utc::now();
        }
        tracing::info!(
            run_id,
            workflow = %definition.id,
            steps = definition.steps.len(),
            "starting workflow run"
        );
        self.append_progress(run_id, "run started", &format!("workflow: {}", definition.id))
            .await;

        let end = self.drive_steps(run_id, definition, &run, &token).await;

        let snapshot = {
            let mut guard = run.write().await;
            guard.status = end.status;
            guard.error = end.error;
            guard.completed_at = Some(Utc::now());
            guard.clone()
        };

        match snapshot.status {
            RunStatus::Completed => tracing::info!(run_id, "workflow run completed"),
            RunStatus::Blocked => tracing::info!(run_id, "workflow run blocked on escalation"),
            RunStatus::Cancelled => tracing::info!(run_id, "workflow run cancelled"),
            status => tracing::error!(
                run_id,
                %status,
                error = snapshot.error.as_deref().unwrap_or_default(),
                "workflow run failed"
            ),
        }
        self.append_progress(
            run_id,
            "run finished",
            &format!("status: {}", snapshot.status),
        )
        .await;

        self.runs.remove(run_id);
        self.cancellation_tokens.remove(run_id);
        self.executor.artifacts().finish_run(run_id);
        Ok(snapshot)
    }

    /// Cancel an active run. The run ends `cancelled` at its next suspension point.
    pub fn cancel(&self, run_id: &str) -> Result<(), OrchestratorError> {
        let token = self
            .cancellation_tokens
            .get(run_id)
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        token.cancel();
        tracing::info!(run_id, "run cancellation requested");
        Ok(())
    }

    /// A consistent copy of an active run.
    pub async fn snapshot(&self, run_id: &str) -> Option<WorkflowRun> {
        let run = self.runs.get(run_id).map(|r| Arc::clone(r.value()))?;
        let guard = run.read().await;
        Some(guard.clone())
    }

    /// Ids of runs that are currently registered.
    pub fn active_runs(&self) -> Vec<String> {
        self.runs.iter().map(|r| r.key().clone()).collect()
    }

    /// Wait for background work (session cleanups) to finish.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }

    // -----------------------------------------------------------------------
    // Step sequencing
    // -----------------------------------------------------------------------

    async fn drive_steps(
        &self,
        run_id: &str,
        definition: &WorkflowDefinition,
        run: &SharedRun,
        token: &CancellationToken,
    ) -> RunEnd {
        let mut index = 0;
        while index < definition.steps.len() {
            let step = &definition.steps[index];
            if token.is_cancelled() {
                return RunEnd::with_error(RunStatus::Cancelled, "cancelled".to_string());
            }

            let attempts = {
                let mut guard = run.write().await;
                match guard.step_mut(&step.id) {
                    Some(step_run) => {
                        step_run.status = StepStatus::Running;
                        step_run.attempts += 1;
                        step_run.error = None;
                        step_run.started_at = Some(Utc::now());
                        step_run.completed_at = None;
                        step_run.attempts
                    }
                    None => 1,
                }
            };
            tracing::info!(run_id, step_id = %step.id, attempt = attempts, "step started");

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(StepError::Cancelled { step_id: step.id.clone() }),
                result = self.executor.execute_step(step, run) => result,
            };

            let error = match outcome {
                Ok(result) => {
                    let mut guard = run.write().await;
                    commit_step_output(&mut guard.context, &step.id, result.output);
                    record_sessions(&mut guard.context, &result.sessions);
                    if let Some(step_run) = guard.step_mut(&step.id) {
                        step_run.status = StepStatus::Completed;
                        step_run.output_path = Some(result.output_path);
                        step_run.completed_at = Some(Utc::now());
                    }
                    drop(guard);
                    tracing::info!(run_id, step_id = %step.id, "step completed");
                    index += 1;
                    continue;
                }
                Err(e) => e,
            };

            let message = error.to_string();
            if error.is_escalation() {
                self.mark_step(run, &step.id, StepStatus::Blocked, &message)
                    .await;
                return RunEnd::with_error(RunStatus::Blocked, message);
            }

            self.mark_step(run, &step.id, StepStatus::Failed, &message)
                .await;
            if matches!(error, StepError::Cancelled { .. }) {
                return RunEnd::with_error(RunStatus::Cancelled, message);
            }

            let policy = RetryPolicy::for_step(step);
            match policy {
                Some(policy) if policy.should_retry(attempts, &error) => {
                    let target = definition
                        .step_index(&policy.retry_step)
                        .filter(|t| *t <= index)
                        .unwrap_or(index);
                    tracing::warn!(
                        run_id,
                        step_id = %step.id,
                        attempt = attempts,
                        max_retries = policy.max_retries,
                        retry_step = %definition.steps[target].id,
                        error = %message,
                        "step failed, retrying"
                    );

                    if !policy.delay.is_zero() {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                return RunEnd::with_error(RunStatus::Cancelled, "cancelled".to_string());
                            }
                            _ = tokio::time::sleep(policy.delay) => {}
                        }
                    }

                    let mut guard = run.write().await;
                    for reset in &definition.steps[target..=index] {
                        if let Some(step_run) = guard.step_mut(&reset.id) {
                            step_run.status = StepStatus::Pending;
                            step_run.loop_state = None;
                            step_run.completed_at = None;
                        }
                    }
                    index = target;
                }
                _ => {
                    tracing::error!(
                        run_id,
                        step_id = %step.id,
                        attempt = attempts,
                        retryable = error.is_retryable(),
                        error = %message,
                        "step failed"
                    );
                    return RunEnd::with_error(RunStatus::Failed, message);
                }
            }
        }

        RunEnd::completed()
    }

    async fn mark_step(&self, run: &SharedRun, step_id: &str, status: StepStatus, error: &str) {
        let mut guard = run.write().await;
        if let Some(step_run) = guard.step_mut(step_id) {
            step_run.status = status;
            step_run.error = Some(error.to_string());
            step_run.completed_at = Some(Utc::now());
        }
    }

    async fn append_progress(&self, run_id: &str, label: &str, body: &str) {
        let entry = format!("## {} - {}\n{}\n", Utc::now().to_rfc3339(), label, body);
        if let Err(e) = self.executor.artifacts().append_progress(run_id, &entry).await {
            tracing::warn!(run_id, error = %e, "failed to append progress entry");
        }
    }
}

impl std::fmt::Debug for RunOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOrchestrator")
            .field("active_runs", &self.runs.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
