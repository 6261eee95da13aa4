//! Step executor for the four workflow step types.
//!
//! `StepExecutor` dispatches on `StepKind`. Agent and loop steps render the
//! step input against the step's session context, invoke the agent executor,
//! parse and validate the output, persist it and append a progress entry.
//! Gate steps evaluate a condition; parallel steps fan out sub-steps and
//! aggregate their outcomes.
//!
//! The executor reads the run but never commits outputs to its context; that
//! is the orchestrator's job once a step has succeeded. The only run writes
//! made here are loop-state updates.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use kanflow_types::config::{EngineConfig, EngineLimits, HARD_MAX_LOOP_ITERATIONS};
use kanflow_types::workflow::{
    LoopCompletion, LoopConfig, LoopState, OnFalse, ParallelConfig, ParallelSubStep, SessionCleanup,
    SessionMode, SessionRecord, StepExecutionResult, StepKind, StepSessionConfig, WorkflowAgent,
    WorkflowRun, WorkflowStep,
};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;

use super::agent::{AgentError, AgentInvocation, AgentResponse, BoxAgentExecutor};
use super::artifacts::{ArtifactError, BoxArtifactStore};
use super::context::{
    build_session_context, full_context, resolve_session_config, session_key_for,
    workflow_agents, workflow_session_default,
};
use super::criteria::first_failing;
use super::expression::{evaluate, evaluate_condition, render_template};
use super::tools::{resolve_tool_filter, ToolFilter, ToolPolicy};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Output extension used when a step has no output hint.
pub const DEFAULT_OUTPUT_EXTENSION: &str = "md";

/// Characters of output copied into a progress entry.
const PROGRESS_PREVIEW_CHARS: usize = 500;

/// A run shared between the orchestrator and the step executor.
pub type SharedRun = Arc<RwLock<WorkflowRun>>;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can occur during step execution.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step references something the workflow does not define.
    #[error("step '{step_id}' is misconfigured: {message}")]
    Definition { step_id: String, message: String },

    /// An expression did not produce what the step needs.
    #[error("step '{step_id}' evaluation failed: {message}")]
    Evaluation { step_id: String, message: String },

    #[error("step '{step_id}' failed acceptance criterion '{criterion}'")]
    CriterionFailed { step_id: String, criterion: String },

    #[error("gate '{step_id}' condition not met: {condition}")]
    ConditionNotMet { step_id: String, condition: String },

    /// Not a failure of the work itself; the run waits for a human.
    #[error("gate '{step_id}' escalated to human: {message}")]
    EscalationRequired { step_id: String, message: String },

    /// Transport failure or timeout in the agent layer.
    #[error("step '{step_id}' agent call failed: {source}")]
    Agent {
        step_id: String,
        #[source]
        source: AgentError,
    },

    #[error("step '{step_id}' exceeds resource limit: {message}")]
    ResourceLimit { step_id: String, message: String },

    #[error("loop '{step_id}' completed {completed} of {expected} iterations")]
    LoopIncomplete {
        step_id: String,
        completed: u32,
        expected: u32,
    },

    #[error("parallel step '{step_id}' did not reach completion '{required}': {}", .reasons.join("; "))]
    ParallelThresholdNotMet {
        step_id: String,
        required: String,
        reasons: Vec<String>,
    },

    #[error("step '{step_id}' could not store output: {source}")]
    Artifact {
        step_id: String,
        #[source]
        source: ArtifactError,
    },

    #[error("step '{step_id}' cancelled")]
    Cancelled { step_id: String },
}

impl StepError {
    /// Whether an `on_fail` policy may retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::CriterionFailed { .. }
                | StepError::ConditionNotMet { .. }
                | StepError::Agent { .. }
                | StepError::LoopIncomplete { .. }
                | StepError::ParallelThresholdNotMet { .. }
        )
    }

    /// Check if this error is a human escalation (not a real failure).
    pub fn is_escalation(&self) -> bool {
        matches!(self, StepError::EscalationRequired { .. })
    }

    /// Get the escalation message, if this is an escalation.
    pub fn escalation_message(&self) -> Option<&str> {
        match self {
            StepError::EscalationRequired { message, .. } => Some(message),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolved per-step agent settings.
struct AgentPlan {
    agent: WorkflowAgent,
    session: StepSessionConfig,
    tool_filter: ToolFilter,
    timeout: Duration,
    /// Recorded session to continue, for `reuse` mode.
    session_key: Option<String>,
}

/// Where and how one agent output is validated and stored.
struct OutputTarget<'a> {
    /// Progress-log heading, e.g. `implement[2]`.
    label: &'a str,
    hint: Option<&'a str>,
    criteria: &'a [String],
    file_name: &'a str,
}

/// Extension of the output hint, or the default.
pub fn output_extension(hint: Option<&str>) -> &str {
    hint.and_then(|h| Path::new(h).extension())
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_OUTPUT_EXTENSION)
}

/// Render a loop output file name. A template without placeholders gets
/// `-{index}` before its extension so iterations never share a file.
pub fn iteration_file_name(template: &str, context: &Value, index: usize) -> String {
    let rendered = render_template(template, context);
    if rendered != template {
        return rendered;
    }
    match rendered.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{index}.{ext}"),
        _ => format!("{rendered}-{index}"),
    }
}

/// Parse raw agent output by the hint's extension.
///
/// A parse failure falls back to the raw string.
pub fn parse_output(step_id: &str, raw: &str, hint: Option<&str>) -> Value {
    let parsed = match output_extension(hint) {
        "yml" | "yaml" => serde_yaml_ng::from_str::<Value>(raw).map_err(|e| e.to_string()),
        "json" => serde_json::from_str::<Value>(raw).map_err(|e| e.to_string()),
        _ => return Value::String(raw.to_string()),
    };
    parsed.unwrap_or_else(|error| {
        tracing::warn!(step_id, %error, "failed to parse step output, keeping raw text");
        Value::String(raw.to_string())
    })
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PROGRESS_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

async fn update_loop_state(run: &SharedRun, step_id: &str, state: LoopState) {
    let mut guard = run.write().await;
    if let Some(step_run) = guard.step_mut(step_id) {
        step_run.loop_state = Some(state);
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Executes individual workflow steps by dispatching to type-specific handlers.
pub struct StepExecutor {
    agents: Arc<BoxAgentExecutor>,
    artifacts: Arc<BoxArtifactStore>,
    tools: Arc<dyn ToolPolicy>,
    limits: EngineLimits,
    session_default: StepSessionConfig,
    /// Background session cleanups, awaited on shutdown.
    cleanups: TaskTracker,
}

impl StepExecutor {
    /// Create a step executor from its collaborators and the engine config.
    pub fn new(
        agents: Arc<BoxAgentExecutor>,
        artifacts: Arc<BoxArtifactStore>,
        tools: Arc<dyn ToolPolicy>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            agents,
            artifacts,
            tools,
            limits: config.limits.clone(),
            session_default: config.session.clone(),
            cleanups: TaskTracker::new(),
        }
    }

    pub fn artifacts(&self) -> &Arc<BoxArtifactStore> {
        &self.artifacts
    }

    /// Wait for outstanding session cleanups.
    pub async fn shutdown(&self) {
        self.cleanups.close();
        self.cleanups.wait().await;
    }

    /// Execute one step against a run.
    pub async fn execute_step(
        &self,
        step: &WorkflowStep,
        run: &SharedRun,
    ) -> Result<StepExecutionResult, StepError> {
        let run_id = run.read().await.id.clone();
        tracing::debug!(
            run_id = %run_id,
            step_id = %step.id,
            step_type = step.kind.type_name(),
            "executing step"
        );

        match &step.kind {
            StepKind::Agent { agent } => self.execute_agent(step, agent, &run_id, run).await,
            StepKind::Loop { agent, config } => {
                self.execute_loop(step, agent, config, &run_id, run).await
            }
            StepKind::Gate { condition, on_false } => {
                self.execute_gate(step, condition, on_false.as_ref(), &run_id, run)
                    .await
            }
            StepKind::Parallel { config } => {
                self.execute_parallel(step, config, &run_id, run).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Agent step
    // -----------------------------------------------------------------------

    async fn execute_agent(
        &self,
        step: &WorkflowStep,
        agent_id: &str,
        run_id: &str,
        run: &SharedRun,
    ) -> Result<StepExecutionResult, StepError> {
        let plan = self.plan_agent(step, agent_id, run).await?;
        let progress = self.read_progress(run_id).await;
        let context = {
            let guard = run.read().await;
            build_session_context(&plan.session, &guard, &progress)
        };

        let prompt = render_template(&step.input, &context);
        let invocation = self.invocation(run_id, step, &plan, prompt, plan.session_key.clone(), context);
        let response = self.invoke(&step.id, invocation).await?;
        let sessions = self
            .settle_session(&plan.agent.id, &plan.session, response.session_key.clone())
            .into_iter()
            .collect();

        let file_name = format!("{}.{}", step.id, output_extension(step.output_file()));
        let (output, output_path) = self
            .finish_output(
                run_id,
                &step.id,
                &response,
                OutputTarget {
                    label: &step.id,
                    hint: step.output_file(),
                    criteria: &step.acceptance_criteria,
                    file_name: &file_name,
                },
            )
            .await?;

        Ok(StepExecutionResult {
            output,
            output_path,
            sessions,
        })
    }

    // -----------------------------------------------------------------------
    // Loop step
    // -----------------------------------------------------------------------

    async fn execute_loop(
        &self,
        step: &WorkflowStep,
        agent_id: &str,
        config: &LoopConfig,
        run_id: &str,
        run: &SharedRun,
    ) -> Result<StepExecutionResult, StepError> {
        let plan = self.plan_agent(step, agent_id, run).await?;

        let progress = self.read_progress(run_id).await;
        let items = {
            let guard = run.read().await;
            match evaluate(&config.over, &full_context(&guard, &progress)) {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(StepError::Evaluation {
                        step_id: step.id.clone(),
                        message: format!(
                            "loop.over '{}' resolved to {} instead of an array",
                            config.over,
                            json_type_name(&other)
                        ),
                    });
                }
                None => {
                    return Err(StepError::Evaluation {
                        step_id: step.id.clone(),
                        message: format!("loop.over '{}' did not resolve", config.over),
                    });
                }
            }
        };

        let ceiling = config
            .max_iterations
            .unwrap_or(HARD_MAX_LOOP_ITERATIONS)
            .min(self.limits.loop_ceiling());
        let count = items.len().min(ceiling as usize);
        if count < items.len() {
            tracing::warn!(
                run_id,
                step_id = %step.id,
                available = items.len(),
                limit = ceiling,
                "loop truncated to iteration limit"
            );
        }

        let total = count as u32;
        let mut state = LoopState {
            total_iterations: total,
            ..LoopState::default()
        };
        update_loop_state(run, &step.id, state).await;

        let ext = output_extension(step.output_file());
        let mut session_key = plan.session_key.clone();
        let mut latest_session: Option<SessionRecord> = None;
        let mut results: Vec<Value> = Vec::new();
        let mut last_error: Option<StepError> = None;

        for (index, item) in items.into_iter().take(count).enumerate() {
            state.current_iteration = index as u32 + 1;
            update_loop_state(run, &step.id, state).await;

            let progress = self.read_progress(run_id).await;
            let mut context = {
                let guard = run.read().await;
                build_session_context(&plan.session, &guard, &progress)
            };
            if let Value::Object(map) = &mut context {
                map.insert(config.item_var().to_string(), item);
                map.insert(config.index_var().to_string(), json!(index));
                map.insert(
                    "loop".to_string(),
                    json!({
                        "index": index,
                        "total": total,
                        "completed": state.completed_iterations,
                        "results": results,
                    }),
                );
            }

            let label = format!("{}[{}]", step.id, index);
            let file_name = match step.output_file() {
                Some(template) => iteration_file_name(template, &context, index),
                None => format!("{}-{}.{}", step.id, index, ext),
            };
            let prompt = render_template(&step.input, &context);
            let invocation =
                self.invocation(run_id, step, &plan, prompt, session_key.clone(), context);

            let outcome = match self.invoke(&step.id, invocation).await {
                Ok(response) => {
                    if plan.session.mode == SessionMode::Reuse && response.session_key.is_some() {
                        session_key = response.session_key.clone();
                    }
                    if let Some(record) = self.settle_session(
                        &plan.agent.id,
                        &plan.session,
                        response.session_key.clone(),
                    ) {
                        latest_session = Some(record);
                    }
                    self.finish_output(
                        run_id,
                        &step.id,
                        &response,
                        OutputTarget {
                            label: &label,
                            hint: step.output_file(),
                            criteria: &step.acceptance_criteria,
                            file_name: &file_name,
                        },
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok((output, _)) => {
                    results.push(output);
                    state.completed_iterations += 1;
                    update_loop_state(run, &step.id, state).await;
                    if config.completion == LoopCompletion::FirstSuccess {
                        break;
                    }
                }
                Err(e) => {
                    state.failed_iterations += 1;
                    update_loop_state(run, &step.id, state).await;
                    tracing::warn!(
                        run_id,
                        step_id = %step.id,
                        iteration = index,
                        error = %e,
                        "loop iteration failed"
                    );

                    if config.continue_on_error {
                        last_error = Some(e);
                        continue;
                    }
                    match config.completion {
                        LoopCompletion::AllDone => return Err(e),
                        LoopCompletion::AnyDone if state.completed_iterations > 0 => break,
                        LoopCompletion::AnyDone | LoopCompletion::FirstSuccess => {
                            last_error = Some(e);
                        }
                    }
                }
            }
        }

        let completed = state.completed_iterations;
        match config.completion {
            LoopCompletion::AllDone if completed != total => {
                return Err(StepError::LoopIncomplete {
                    step_id: step.id.clone(),
                    completed,
                    expected: total,
                });
            }
            LoopCompletion::AnyDone | LoopCompletion::FirstSuccess
                if completed == 0 && total > 0 =>
            {
                return Err(last_error.unwrap_or(StepError::LoopIncomplete {
                    step_id: step.id.clone(),
                    completed,
                    expected: total,
                }));
            }
            _ => {}
        }

        let output = json!({ "iterations": results, "completed": completed });
        let output_path = self
            .persist_json(run_id, &step.id, &format!("{}.json", step.id), &output)
            .await?;
        self.log_progress(
            run_id,
            &step.id,
            &format!("loop finished: {completed}/{total} iterations succeeded"),
        )
        .await;

        Ok(StepExecutionResult {
            output,
            output_path,
            sessions: latest_session.into_iter().collect(),
        })
    }

    // -----------------------------------------------------------------------
    // Gate step
    // -----------------------------------------------------------------------

    async fn execute_gate(
        &self,
        step: &WorkflowStep,
        condition: &str,
        on_false: Option<&OnFalse>,
        run_id: &str,
        run: &SharedRun,
    ) -> Result<StepExecutionResult, StepError> {
        let progress = self.read_progress(run_id).await;
        let passed = {
            let guard = run.read().await;
            evaluate_condition(condition, &full_context(&guard, &progress))
        };

        if !passed {
            if let Some(on_false) = on_false.filter(|o| o.escalates_to_human()) {
                let message = on_false
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("gate '{}' requires human review", step.id));
                tracing::info!(run_id, step_id = %step.id, "gate escalated to human");
                self.log_progress(run_id, &step.id, &format!("escalated to human: {message}"))
                    .await;
                return Err(StepError::EscalationRequired {
                    step_id: step.id.clone(),
                    message,
                });
            }
            return Err(StepError::ConditionNotMet {
                step_id: step.id.clone(),
                condition: condition.to_string(),
            });
        }

        let output = json!({ "passed": true, "condition": condition });
        let output_path = self
            .persist_json(run_id, &step.id, &format!("{}.json", step.id), &output)
            .await?;
        self.log_progress(run_id, &step.id, &format!("gate passed: {condition}"))
            .await;

        Ok(StepExecutionResult {
            output,
            output_path,
            sessions: Vec::new(),
        })
    }

    // -----------------------------------------------------------------------
    // Parallel step
    // -----------------------------------------------------------------------

    async fn execute_parallel(
        &self,
        step: &WorkflowStep,
        config: &ParallelConfig,
        run_id: &str,
        run: &SharedRun,
    ) -> Result<StepExecutionResult, StepError> {
        let limit = self.limits.parallel_ceiling();
        if config.steps.len() > limit {
            tracing::error!(
                run_id,
                step_id = %step.id,
                sub_steps = config.steps.len(),
                limit,
                "parallel step exceeds sub-step limit"
            );
            return Err(StepError::ResourceLimit {
                step_id: step.id.clone(),
                message: format!(
                    "{} parallel sub-steps exceeds the limit of {}",
                    config.steps.len(),
                    limit
                ),
            });
        }

        let progress = self.read_progress(run_id).await;
        let (session, context, agents) = {
            let guard = run.read().await;
            let session = resolve_session_config(
                step,
                workflow_session_default(&guard).as_ref(),
                &self.session_default,
            );
            let context = build_session_context(&session, &guard, &progress);
            (session, context, workflow_agents(&guard))
        };

        let outcomes = join_all(
            config
                .steps
                .iter()
                .map(|sub| self.run_sub_step(step, sub, &agents, &session, &context, run_id)),
        )
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut reasons = Vec::new();
        let (mut succeeded, mut failed) = (0usize, 0usize);
        for (sub, outcome) in config.steps.iter().zip(outcomes) {
            match outcome {
                Ok(output) => {
                    succeeded += 1;
                    results.push(json!({
                        "id": sub.id,
                        "status": "fulfilled",
                        "output": output,
                        "error": Value::Null,
                    }));
                }
                Err(e) => {
                    failed += 1;
                    reasons.push(format!("{}: {}", sub.id, e));
                    results.push(json!({
                        "id": sub.id,
                        "status": "rejected",
                        "output": Value::Null,
                        "error": e.to_string(),
                    }));
                }
            }
        }

        tracing::debug!(run_id, step_id = %step.id, succeeded, failed, "parallel step settled");

        if !config.completion.is_met(succeeded, failed) {
            return Err(StepError::ParallelThresholdNotMet {
                step_id: step.id.clone(),
                required: config.completion.to_string(),
                reasons,
            });
        }

        let output = json!({
            "results": results,
            "succeeded": succeeded,
            "failed": failed,
        });
        let output_path = self
            .persist_json(run_id, &step.id, &format!("{}.json", step.id), &output)
            .await?;
        self.log_progress(
            run_id,
            &step.id,
            &format!("parallel finished: {succeeded} succeeded, {failed} failed"),
        )
        .await;

        Ok(StepExecutionResult {
            output,
            output_path,
            sessions: Vec::new(),
        })
    }

    /// One parallel sub-step. Always a fresh session, never recorded.
    async fn run_sub_step(
        &self,
        parent: &WorkflowStep,
        sub: &ParallelSubStep,
        agents: &[WorkflowAgent],
        session: &StepSessionConfig,
        context: &Value,
        run_id: &str,
    ) -> Result<Value, StepError> {
        let label = format!("{}.{}", parent.id, sub.id);
        let agent = agents
            .iter()
            .find(|a| a.id == sub.agent)
            .ok_or_else(|| StepError::Definition {
                step_id: label.clone(),
                message: format!("unknown agent '{}'", sub.agent),
            })?;

        let invocation = AgentInvocation {
            run_id: run_id.to_string(),
            step_id: label.clone(),
            agent_id: agent.id.clone(),
            role: agent.role.clone(),
            model: agent.model.clone(),
            prompt: render_template(&sub.input, context),
            tool_filter: resolve_tool_filter(self.tools.as_ref(), agent),
            timeout: Duration::from_secs(sub.timeout.or(parent.timeout).unwrap_or(session.timeout)),
            session_mode: SessionMode::Fresh,
            session_key: None,
            context: context.clone(),
        };
        let response = self.invoke(&label, invocation).await?;
        if let Some(key) = response.session_key.clone() {
            self.spawn_cleanup(key);
        }

        let hint = parent.output_file();
        let output = parse_output(&label, &response.output, hint);
        let file_name = format!("{}.{}.{}", parent.id, sub.id, output_extension(hint));
        self.persist(run_id, &label, &file_name, &response.output).await?;
        self.log_progress(run_id, &label, &response.output).await;
        Ok(output)
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    async fn plan_agent(
        &self,
        step: &WorkflowStep,
        agent_id: &str,
        run: &SharedRun,
    ) -> Result<AgentPlan, StepError> {
        let guard = run.read().await;
        let agent = workflow_agents(&guard)
            .into_iter()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| StepError::Definition {
                step_id: step.id.clone(),
                message: format!("unknown agent '{agent_id}'"),
            })?;

        let session = resolve_session_config(
            step,
            workflow_session_default(&guard).as_ref(),
            &self.session_default,
        );
        let session_key = match session.mode {
            SessionMode::Reuse => session_key_for(&guard, agent_id),
            SessionMode::Fresh => None,
        };

        Ok(AgentPlan {
            tool_filter: resolve_tool_filter(self.tools.as_ref(), &agent),
            timeout: Duration::from_secs(step.timeout.unwrap_or(session.timeout)),
            agent,
            session,
            session_key,
        })
    }

    fn invocation(
        &self,
        run_id: &str,
        step: &WorkflowStep,
        plan: &AgentPlan,
        prompt: String,
        session_key: Option<String>,
        context: Value,
    ) -> AgentInvocation {
        AgentInvocation {
            run_id: run_id.to_string(),
            step_id: step.id.clone(),
            agent_id: plan.agent.id.clone(),
            role: plan.agent.role.clone(),
            model: plan.agent.model.clone(),
            prompt,
            tool_filter: plan.tool_filter.clone(),
            timeout: plan.timeout,
            session_mode: plan.session.mode,
            session_key,
            context,
        }
    }

    async fn invoke(
        &self,
        step_id: &str,
        invocation: AgentInvocation,
    ) -> Result<AgentResponse, StepError> {
        let agent_id = invocation.agent_id.clone();
        let timeout = invocation.timeout;
        tracing::debug!(
            step_id,
            agent_id = %agent_id,
            session_mode = ?invocation.session_mode,
            resume = invocation.session_key.is_some(),
            "invoking agent"
        );

        let result =
            match tokio::time::timeout(timeout, self.agents.spawn_or_continue(invocation)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout {
                    agent_id,
                    timeout_secs: timeout.as_secs(),
                }),
            };
        result.map_err(|source| StepError::Agent {
            step_id: step_id.to_string(),
            source,
        })
    }

    /// Decide what happens to a returned session: record it, or clean it up.
    fn settle_session(
        &self,
        agent_id: &str,
        session: &StepSessionConfig,
        session_key: Option<String>,
    ) -> Option<SessionRecord> {
        let session_key = session_key?;
        if session.mode == SessionMode::Reuse || session.cleanup == SessionCleanup::Keep {
            return Some(SessionRecord {
                agent_id: agent_id.to_string(),
                session_key,
            });
        }
        self.spawn_cleanup(session_key);
        None
    }

    fn spawn_cleanup(&self, session_key: String) {
        let agents = Arc::clone(&self.agents);
        self.cleanups.spawn(async move {
            if let Err(e) = agents.cleanup_session(&session_key).await {
                tracing::warn!(session_key = %session_key, error = %e, "session cleanup failed");
            }
        });
    }

    /// Parse, validate, persist and log one agent output.
    async fn finish_output(
        &self,
        run_id: &str,
        step_id: &str,
        response: &AgentResponse,
        target: OutputTarget<'_>,
    ) -> Result<(Value, String), StepError> {
        let raw = response.output.as_str();
        let parsed = parse_output(step_id, raw, target.hint);

        let regex_timeout = Duration::from_millis(self.limits.regex_timeout_ms);
        if let Some(criterion) = first_failing(target.criteria, raw, &parsed, regex_timeout).await {
            tracing::info!(run_id, step_id, criterion, "acceptance criterion failed");
            return Err(StepError::CriterionFailed {
                step_id: step_id.to_string(),
                criterion: criterion.to_string(),
            });
        }

        let path = self.persist(run_id, step_id, target.file_name, raw).await?;
        self.log_progress(run_id, target.label, raw).await;
        Ok((parsed, path))
    }

    async fn persist(
        &self,
        run_id: &str,
        step_id: &str,
        file_name: &str,
        content: &str,
    ) -> Result<String, StepError> {
        self.artifacts
            .write_step_output(run_id, file_name, content)
            .await
            .map_err(|source| StepError::Artifact {
                step_id: step_id.to_string(),
                source,
            })
    }

    async fn persist_json(
        &self,
        run_id: &str,
        step_id: &str,
        file_name: &str,
        output: &Value,
    ) -> Result<String, StepError> {
        let content = serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string());
        self.persist(run_id, step_id, file_name, &content).await
    }

    async fn read_progress(&self, run_id: &str) -> String {
        self.artifacts
            .read_progress(run_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(run_id, error = %e, "failed to read progress log");
                String::new()
            })
    }

    async fn log_progress(&self, run_id: &str, label: &str, body: &str) {
        let entry = format!(
            "## {} - {}\n{}\n",
            Utc::now().to_rfc3339(),
            label,
            preview(body)
        );
        if let Err(e) = self.artifacts.append_progress(run_id, &entry).await {
            tracing::warn!(run_id, label, error = %e, "failed to append progress entry");
        }
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use kanflow_types::config::ToolPolicyConfig;
    use kanflow_types::workflow::{StepStatus, WorkflowDefinition};

    use super::*;
    use crate::workflow::agent::AgentExecutor;
    use crate::workflow::artifacts::{ArtifactStore, MemoryArtifactStore};
    use crate::workflow::context::{new_run, record_sessions};
    use crate::workflow::tools::TablePolicy;

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    type Responder = dyn Fn(&AgentInvocation) -> Result<String, String> + Send + Sync;

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<AgentInvocation>>>,
        cleaned: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<AgentInvocation> {
            self.calls.lock().unwrap().clone()
        }

        fn prompts(&self) -> Vec<String> {
            self.calls().into_iter().map(|c| c.prompt).collect()
        }
    }

    /// Answers with the responder's text; hands out `sess-N` keys for new
    /// sessions and echoes the key back for continued ones.
    struct ScriptedAgent {
        respond: Box<Responder>,
        recorder: Recorder,
        next_session: AtomicU32,
    }

    impl AgentExecutor for ScriptedAgent {
        async fn spawn_or_continue(
            &self,
            invocation: AgentInvocation,
        ) -> Result<AgentResponse, AgentError> {
            self.recorder.calls.lock().unwrap().push(invocation.clone());
            let session_key = invocation.session_key.clone().unwrap_or_else(|| {
                format!("sess-{}", self.next_session.fetch_add(1, Ordering::SeqCst))
            });
            match (self.respond)(&invocation) {
                Ok(output) => Ok(AgentResponse {
                    output,
                    session_key: Some(session_key),
                }),
                Err(message) => Err(AgentError::Failed {
                    agent_id: invocation.agent_id.clone(),
                    message,
                }),
            }
        }

        async fn cleanup_session(&self, session_key: &str) -> Result<(), AgentError> {
            self.recorder
                .cleaned
                .lock()
                .unwrap()
                .push(session_key.to_string());
            Ok(())
        }
    }

    struct Harness {
        executor: StepExecutor,
        recorder: Recorder,
        store: MemoryArtifactStore,
    }

    fn harness<F>(config: EngineConfig, respond: F) -> Harness
    where
        F: Fn(&AgentInvocation) -> Result<String, String> + Send + Sync + 'static,
    {
        let recorder = Recorder::default();
        let store = MemoryArtifactStore::with_limits(&config.limits);
        let agent = ScriptedAgent {
            respond: Box::new(respond),
            recorder: recorder.clone(),
            next_session: AtomicU32::new(0),
        };
        let executor = StepExecutor::new(
            Arc::new(BoxAgentExecutor::new(agent)),
            Arc::new(BoxArtifactStore::new(store.clone())),
            Arc::new(TablePolicy::new(config.tool_policies.clone())),
            &config,
        );
        Harness {
            executor,
            recorder,
            store,
        }
    }

    fn echo(invocation: &AgentInvocation) -> Result<String, String> {
        Ok(format!("done: {}", invocation.prompt))
    }

    fn workflow(yaml: &str) -> WorkflowDefinition {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn shared_run(def: &WorkflowDefinition, extra: Value) -> SharedRun {
        let mut run = new_run(def, "run-test".into(), json!({ "title": "Login" }));
        if let Value::Object(map) = extra {
            for (k, v) in map {
                run.context.insert(k, v);
            }
        }
        Arc::new(RwLock::new(run))
    }

    async fn loop_state(run: &SharedRun, step_id: &str) -> LoopState {
        run.read().await.step(step_id).unwrap().loop_state.unwrap()
    }

    const AGENTS: &str = r#"
agents:
  - id: planner
    role: planner
  - id: dev
    role: developer
"#;

    fn with_agents(steps: &str) -> WorkflowDefinition {
        workflow(&format!("id: wf\n{AGENTS}steps:\n{steps}"))
    }

    // -----------------------------------------------------------------------
    // Agent step
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_agent_step_parses_yaml_and_persists() {
        let def = with_agents(
            r#"
  - id: plan
    type: agent
    agent: planner
    input: "Plan {{task.title}}"
    output:
      file: plan.yml
    acceptance_criteria:
      - "status == ready"
      - "/stories:/"
"#,
        );
        let h = harness(EngineConfig::default(), |_| {
            Ok("status: ready\nstories:\n  - title: Form\n".to_string())
        });
        let run = shared_run(&def, json!({}));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();

        assert_eq!(result.output["status"], "ready");
        assert_eq!(result.output["stories"][0]["title"], "Form");
        assert_eq!(result.output_path, "runs/run-test/step-outputs/plan.yml");
        assert_eq!(h.recorder.prompts(), vec!["Plan Login"]);
        assert!(h
            .store
            .output("run-test", &result.output_path)
            .unwrap()
            .contains("status: ready"));

        let progress = h.store.read_progress("run-test").await.unwrap();
        assert!(progress.starts_with("## "));
        assert!(progress.contains(" - plan\n"));
    }

    #[tokio::test]
    async fn test_agent_step_invalid_json_falls_back_to_raw() {
        let def = with_agents(
            r#"
  - id: report
    type: agent
    agent: dev
    input: "Report"
    output:
      file: report.json
"#,
        );
        let h = harness(EngineConfig::default(), |_| Ok("not json".to_string()));
        let run = shared_run(&def, json!({}));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        assert_eq!(result.output, json!("not json"));
        assert_eq!(result.output_path, "runs/run-test/step-outputs/report.json");
    }

    #[tokio::test]
    async fn test_failing_criterion_aborts_before_persisting() {
        let def = with_agents(
            r#"
  - id: plan
    type: agent
    agent: planner
    input: "Plan"
    output:
      file: plan.yml
    acceptance_criteria:
      - "status == ready"
      - "never evaluated"
"#,
        );
        let h = harness(EngineConfig::default(), |_| Ok("status: draft".to_string()));
        let run = shared_run(&def, json!({}));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        match &err {
            StepError::CriterionFailed { criterion, .. } => assert_eq!(criterion, "status == ready"),
            other => panic!("expected CriterionFailed, got {other:?}"),
        }
        assert!(err.is_retryable());
        assert!(h.store.output_paths("run-test").is_empty());
        assert!(run.read().await.context.get("plan").is_none());
    }

    #[tokio::test]
    async fn test_unknown_agent_is_definition_error() {
        let def = workflow(
            r#"
id: wf
steps:
  - id: s
    type: agent
    agent: ghost
    input: "x"
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({}));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        assert!(matches!(err, StepError::Definition { .. }));
        assert!(!err.is_retryable());
        assert!(h.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tool_filter_and_timeout_passed_to_agent() {
        let def = with_agents(
            r#"
  - id: build
    type: agent
    agent: dev
    input: "Build"
    timeout: 42
"#,
        );
        let mut config = EngineConfig::default();
        config.tool_policies.insert(
            "developer".to_string(),
            ToolPolicyConfig {
                allowed: Some(vec!["*".to_string()]),
                denied: vec!["shell".to_string()],
            },
        );
        let h = harness(config, echo);
        let run = shared_run(&def, json!({}));

        h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        let call = &h.recorder.calls()[0];
        assert_eq!(call.timeout, Duration::from_secs(42));
        assert_eq!(call.role.as_deref(), Some("developer"));
        assert!(!call.tool_filter.permits("shell"));
        assert!(call.tool_filter.permits("read_file"));
    }

    #[tokio::test]
    async fn test_custom_context_reaches_agent() {
        let def = with_agents(
            r#"
  - id: review
    type: agent
    agent: dev
    input: "Review {{steps.plan.output.summary}}"
    session:
      context: custom
      include_outputs_from: [plan, missing]
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({ "plan": { "summary": "two stories" } }));
        {
            let mut guard = run.write().await;
            guard.steps.insert(0, kanflow_types::workflow::StepRun::pending("plan"));
            guard.step_mut("plan").unwrap().status = StepStatus::Completed;
        }

        h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        let call = &h.recorder.calls()[0];
        assert_eq!(call.prompt, "Review two stories");
        let steps = call.context["steps"].as_object().unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps.get("missing").is_none());
        assert!(call.context.get("plan").is_none());
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_fresh_delete_session_is_cleaned_up() {
        let def = with_agents(
            r#"
  - id: s
    type: agent
    agent: dev
    input: "x"
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({}));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        h.executor.shutdown().await;

        assert!(result.sessions.is_empty());
        assert_eq!(*h.recorder.cleaned.lock().unwrap(), vec!["sess-0".to_string()]);
    }

    #[tokio::test]
    async fn test_reuse_continues_recorded_session() {
        let def = with_agents(
            r#"
  - id: s
    type: agent
    agent: dev
    input: "x"
    fresh_session: false
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({}));
        record_sessions(
            &mut run.write().await.context,
            &[SessionRecord {
                agent_id: "dev".into(),
                session_key: "sess-prev".into(),
            }],
        );

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        assert_eq!(h.recorder.calls()[0].session_key.as_deref(), Some("sess-prev"));
        assert_eq!(h.recorder.calls()[0].session_mode, SessionMode::Reuse);
        assert_eq!(
            result.sessions,
            vec![SessionRecord {
                agent_id: "dev".into(),
                session_key: "sess-prev".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_loop_reuse_carries_session_between_iterations() {
        let def = with_agents(
            r#"
  - id: implement
    type: loop
    agent: dev
    input: "Do {{item}}"
    session:
      mode: reuse
    loop:
      over: "{{plan.stories}}"
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({ "plan": { "stories": ["a", "b", "c"] } }));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        let keys: Vec<_> = h.recorder.calls().into_iter().map(|c| c.session_key).collect();
        assert_eq!(
            keys,
            vec![None, Some("sess-0".to_string()), Some("sess-0".to_string())]
        );
        assert_eq!(result.sessions.len(), 1);
        assert_eq!(result.sessions[0].session_key, "sess-0");
    }

    // -----------------------------------------------------------------------
    // Loop step
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_loop_runs_each_item_with_iteration_context() {
        let def = with_agents(
            r#"
  - id: implement
    type: loop
    agent: dev
    input: "{{index}}/{{loop.total}} {{story.title}}"
    loop:
      over: "{{plan.stories}}"
      item_var: story
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(
            &def,
            json!({ "plan": { "stories": [{ "title": "Form" }, { "title": "Session" }] } }),
        );

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        assert_eq!(h.recorder.prompts(), vec!["0/2 Form", "1/2 Session"]);
        assert_eq!(result.output["completed"], 2);
        assert_eq!(result.output["iterations"][1], "done: 1/2 Session");
        assert_eq!(result.output_path, "runs/run-test/step-outputs/implement.json");
        assert_eq!(
            h.store.output_paths("run-test")[..2],
            [
                "runs/run-test/step-outputs/implement-0.md".to_string(),
                "runs/run-test/step-outputs/implement-1.md".to_string(),
            ]
        );

        let state = loop_state(&run, "implement").await;
        assert_eq!(state.total_iterations, 2);
        assert_eq!(state.completed_iterations, 2);
        assert_eq!(state.failed_iterations, 0);
    }

    #[tokio::test]
    async fn test_loop_output_file_template() {
        let def = with_agents(
            r#"
  - id: implement
    type: loop
    agent: dev
    input: "x"
    output:
      file: "story-{{index}}.md"
    loop:
      over: "{{plan.stories}}"
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({ "plan": { "stories": ["a", "b"] } }));

        h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        let paths = h.store.output_paths("run-test");
        assert!(paths.contains(&"runs/run-test/step-outputs/story-0.md".to_string()));
        assert!(paths.contains(&"runs/run-test/step-outputs/story-1.md".to_string()));
    }

    #[tokio::test]
    async fn test_loop_static_output_file_is_made_per_iteration() {
        let def = with_agents(
            r#"
  - id: implement
    type: loop
    agent: dev
    input: "{{item}}"
    output:
      file: "impl.md"
    loop:
      over: "{{plan.stories}}"
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({ "plan": { "stories": ["a", "b", "c"] } }));

        h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        let paths = h.store.output_paths("run-test");
        for index in 0..3 {
            let path = format!("runs/run-test/step-outputs/impl-{index}.md");
            assert!(paths.contains(&path), "missing {path} in {paths:?}");
        }
        assert!(!paths.contains(&"runs/run-test/step-outputs/impl.md".to_string()));
        assert_eq!(
            h.store.output("run-test", "runs/run-test/step-outputs/impl-1.md").as_deref(),
            Some("done: b")
        );
    }

    #[test]
    fn test_iteration_file_name() {
        let ctx = json!({ "index": 2 });
        assert_eq!(iteration_file_name("story-{{index}}.md", &ctx, 2), "story-2.md");
        assert_eq!(iteration_file_name("impl.md", &ctx, 2), "impl-2.md");
        assert_eq!(iteration_file_name("notes", &ctx, 0), "notes-0");
        assert_eq!(iteration_file_name(".env", &ctx, 1), ".env-1");
    }

    #[tokio::test]
    async fn test_loop_count_respects_max_iterations() {
        let def = with_agents(
            r#"
  - id: implement
    type: loop
    agent: dev
    input: "x"
    loop:
      over: "{{items}}"
      max_iterations: 3
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({ "items": [1, 2, 3, 4, 5] }));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        assert_eq!(h.recorder.calls().len(), 3);
        assert_eq!(result.output["completed"], 3);
        assert_eq!(loop_state(&run, "implement").await.total_iterations, 3);
    }

    #[tokio::test]
    async fn test_loop_count_clamped_to_hard_ceiling() {
        let def = with_agents(
            r#"
  - id: implement
    type: loop
    agent: dev
    input: "x"
    loop:
      over: "{{items}}"
      max_iterations: 5000
"#,
        );
        let h = harness(EngineConfig::default(), |_| Ok("ok".to_string()));
        let items: Vec<u32> = (0..1200).collect();
        let run = shared_run(&def, json!({ "items": items }));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        assert_eq!(h.recorder.calls().len(), 1000);
        assert_eq!(result.output["completed"], 1000);
    }

    #[tokio::test]
    async fn test_loop_count_respects_configured_limit() {
        let def = with_agents(
            r#"
  - id: implement
    type: loop
    agent: dev
    input: "x"
    loop:
      over: "{{items}}"
"#,
        );
        let mut config = EngineConfig::default();
        config.limits.max_loop_iterations = 2;
        let h = harness(config, echo);
        let run = shared_run(&def, json!({ "items": [1, 2, 3] }));

        h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        assert_eq!(h.recorder.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_loop_over_non_array_is_evaluation_error() {
        let def = with_agents(
            r#"
  - id: implement
    type: loop
    agent: dev
    input: "x"
    loop:
      over: "{{task.title}}"
"#,
        );
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({}));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        assert!(matches!(err, StepError::Evaluation { .. }));
        assert!(h.recorder.calls().is_empty());
    }

    fn fail_on(prompts: &'static [&'static str]) -> impl Fn(&AgentInvocation) -> Result<String, String> {
        move |inv| {
            if prompts.contains(&inv.prompt.as_str()) {
                Err(format!("cannot do {}", inv.prompt))
            } else {
                Ok(format!("did {}", inv.prompt))
            }
        }
    }

    fn loop_def(completion: &str, continue_on_error: bool) -> WorkflowDefinition {
        with_agents(&format!(
            r#"
  - id: implement
    type: loop
    agent: dev
    input: "{{{{item}}}}"
    loop:
      over: "{{{{items}}}}"
      completion: {completion}
      continue_on_error: {continue_on_error}
"#
        ))
    }

    #[tokio::test]
    async fn test_first_success_stops_after_first_success() {
        let def = loop_def("first_success", false);
        let h = harness(EngineConfig::default(), fail_on(&["a"]));
        let run = shared_run(&def, json!({ "items": ["a", "b", "c"] }));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        assert_eq!(h.recorder.prompts(), vec!["a", "b"]);
        assert_eq!(result.output["iterations"], json!(["did b"]));
        assert_eq!(result.output["completed"], 1);

        let state = loop_state(&run, "implement").await;
        assert_eq!(state.completed_iterations, 1);
        assert_eq!(state.failed_iterations, 1);
        assert!(state.completed_iterations + state.failed_iterations <= state.total_iterations);
    }

    #[tokio::test]
    async fn test_first_success_with_no_success_returns_last_error() {
        let def = loop_def("first_success", false);
        let h = harness(EngineConfig::default(), fail_on(&["a", "b"]));
        let run = shared_run(&def, json!({ "items": ["a", "b"] }));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        match err {
            StepError::Agent { source, .. } => assert!(source.to_string().contains("cannot do b")),
            other => panic!("expected agent error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_collection_succeeds_for_every_completion_mode() {
        for completion in ["all_done", "any_done", "first_success"] {
            let def = loop_def(completion, false);
            let h = harness(EngineConfig::default(), echo);
            let run = shared_run(&def, json!({ "items": [] }));

            let result = h
                .executor
                .execute_step(&def.steps[0], &run)
                .await
                .unwrap_or_else(|e| panic!("{completion}: {e}"));
            assert_eq!(result.output, json!({ "iterations": [], "completed": 0 }));
            assert!(h.recorder.prompts().is_empty());
        }
    }

    #[tokio::test]
    async fn test_any_done_stops_on_failure_after_success() {
        let def = loop_def("any_done", false);
        let h = harness(EngineConfig::default(), fail_on(&["a", "c"]));
        let run = shared_run(&def, json!({ "items": ["a", "b", "c", "d"] }));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        assert_eq!(h.recorder.prompts(), vec!["a", "b", "c"]);
        assert_eq!(result.output["iterations"], json!(["did b"]));
    }

    #[tokio::test]
    async fn test_all_done_rethrows_iteration_failure() {
        let def = loop_def("all_done", false);
        let h = harness(EngineConfig::default(), fail_on(&["b"]));
        let run = shared_run(&def, json!({ "items": ["a", "b", "c"] }));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        assert!(matches!(err, StepError::Agent { .. }));
        assert_eq!(h.recorder.prompts(), vec!["a", "b"]);
        let state = loop_state(&run, "implement").await;
        assert_eq!((state.completed_iterations, state.failed_iterations), (1, 1));
    }

    #[tokio::test]
    async fn test_all_done_continue_on_error_reports_incomplete() {
        let def = loop_def("all_done", true);
        let h = harness(EngineConfig::default(), fail_on(&["b"]));
        let run = shared_run(&def, json!({ "items": ["a", "b", "c"] }));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        assert_eq!(h.recorder.prompts(), vec!["a", "b", "c"]);
        match err {
            StepError::LoopIncomplete {
                completed,
                expected,
                ..
            } => assert_eq!((completed, expected), (2, 3)),
            other => panic!("expected LoopIncomplete, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Gate step
    // -----------------------------------------------------------------------

    fn gate_def(on_false: &str) -> WorkflowDefinition {
        with_agents(&format!(
            r#"
  - id: approve
    type: gate
    condition: "review.verdict == \"approved\" and task.title == 'Login'"
{on_false}
"#
        ))
    }

    #[tokio::test]
    async fn test_gate_passes() {
        let def = gate_def("");
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({ "review": { "verdict": "approved" } }));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        assert_eq!(result.output["passed"], true);
        assert!(result.output["condition"].as_str().unwrap().contains("verdict"));
        assert_eq!(result.output_path, "runs/run-test/step-outputs/approve.json");
    }

    #[tokio::test]
    async fn test_gate_condition_not_met() {
        let def = gate_def("");
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({ "review": { "verdict": "changes" } }));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        assert!(matches!(err, StepError::ConditionNotMet { .. }));
        assert!(err.is_retryable());
        assert!(!err.is_escalation());
    }

    #[tokio::test]
    async fn test_gate_escalates_to_human() {
        let def = gate_def("    on_false:\n      escalate_to: human\n      message: Needs sign-off");
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({}));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        assert!(err.is_escalation());
        assert_eq!(err.escalation_message(), Some("Needs sign-off"));
        assert!(!err.is_retryable());
    }

    // -----------------------------------------------------------------------
    // Parallel step
    // -----------------------------------------------------------------------

    fn parallel_def(completion: &str, count: usize) -> WorkflowDefinition {
        let subs: String = (1..=count)
            .map(|i| format!("        - id: s{i}\n          agent: dev\n          input: \"run s{i}\"\n"))
            .collect();
        with_agents(&format!(
            r#"
  - id: review
    type: parallel
    parallel:
      completion: {completion}
      steps:
{subs}"#
        ))
    }

    #[tokio::test]
    async fn test_parallel_threshold_met_with_one_failure() {
        let def = parallel_def("2", 3);
        let h = harness(EngineConfig::default(), fail_on(&["run s1"]));
        let run = shared_run(&def, json!({}));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        let results = result.output["results"].as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0]["id"], "s1");
        assert_eq!(results[0]["status"], "rejected");
        assert!(results[0]["error"].as_str().unwrap().contains("cannot do run s1"));
        assert_eq!(results[1]["status"], "fulfilled");
        assert_eq!(results[2]["output"], "did run s3");
        assert_eq!(result.output["succeeded"], 2);
        assert_eq!(result.output["failed"], 1);
        assert!(h
            .store
            .output_paths("run-test")
            .contains(&"runs/run-test/step-outputs/review.s2.md".to_string()));
    }

    #[tokio::test]
    async fn test_parallel_all_fails_with_every_reason() {
        let def = parallel_def("all", 3);
        let h = harness(EngineConfig::default(), fail_on(&["run s1", "run s3"]));
        let run = shared_run(&def, json!({}));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        match &err {
            StepError::ParallelThresholdNotMet { reasons, required, .. } => {
                assert_eq!(required, "all");
                assert_eq!(reasons.len(), 2);
                assert!(reasons[0].starts_with("s1: "));
                assert!(reasons[1].starts_with("s3: "));
            }
            other => panic!("expected ParallelThresholdNotMet, got {other:?}"),
        }
        // siblings still ran
        assert_eq!(h.recorder.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_parallel_over_hard_limit_runs_nothing() {
        let def = parallel_def("any", 51);
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({}));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        assert!(matches!(err, StepError::ResourceLimit { .. }));
        assert!(!err.is_retryable());
        assert!(h.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_over_configured_limit() {
        let def = parallel_def("any", 3);
        let mut config = EngineConfig::default();
        config.limits.max_parallel_steps = 2;
        let h = harness(config, echo);
        let run = shared_run(&def, json!({}));

        let err = h.executor.execute_step(&def.steps[0], &run).await.unwrap_err();
        assert!(matches!(err, StepError::ResourceLimit { .. }));
        assert!(h.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_parallel_sub_steps_use_fresh_sessions() {
        let def = parallel_def("all", 2);
        let h = harness(EngineConfig::default(), echo);
        let run = shared_run(&def, json!({}));

        let result = h.executor.execute_step(&def.steps[0], &run).await.unwrap();
        h.executor.shutdown().await;

        assert!(result.sessions.is_empty());
        assert!(h
            .recorder
            .calls()
            .iter()
            .all(|c| c.session_mode == SessionMode::Fresh && c.session_key.is_none()));
        assert_eq!(h.recorder.cleaned.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_output_extension_and_parse() {
        assert_eq!(output_extension(None), "md");
        assert_eq!(output_extension(Some("plan.yml")), "yml");
        assert_eq!(output_extension(Some("noext")), "md");
        assert_eq!(parse_output("s", "a: 1", Some("x.yaml")), json!({ "a": 1 }));
        assert_eq!(parse_output("s", "{\"a\":1}", Some("x.json")), json!({ "a": 1 }));
        assert_eq!(parse_output("s", "a: 1", Some("x.md")), json!("a: 1"));
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(PROGRESS_PREVIEW_CHARS + 10);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.len(), PROGRESS_PREVIEW_CHARS + 3);
        assert_eq!(preview("short"), "short");
    }
}
