//! Run context bookkeeping and per-step session context construction.
//!
//! The run context is a JSON map owned by the run: step outputs keyed by step
//! id, plus `task`, `workflow` metadata and the transient `_sessions` map.
//! Agent steps never see it directly; they receive a view built from their
//! resolved `StepSessionConfig`.

use chrono::Utc;
use kanflow_types::workflow::{
    ContextScope, RunStatus, SessionMode, SessionRecord, StepRun, StepSessionConfig, StepStatus,
    WorkflowAgent, WorkflowDefinition, WorkflowRun, WorkflowStep, CONTEXT_SESSIONS, CONTEXT_TASK,
    CONTEXT_WORKFLOW,
};
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single committed step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Key under which the workflow-level default session config is stored in
/// the `workflow` metadata.
const WORKFLOW_SESSION_KEY: &str = "session";

// ---------------------------------------------------------------------------
// Run context seeding
// ---------------------------------------------------------------------------

/// Build the initial run context for a new run.
pub fn seed_run_context(
    definition: &WorkflowDefinition,
    run_id: &str,
    task: Value,
) -> Map<String, Value> {
    let mut workflow = json!({
        "id": definition.id,
        "name": definition.name.clone().unwrap_or_else(|| definition.id.clone()),
        "runId": run_id,
        "agents": definition.agents,
    });
    if let Some(session) = &definition.session {
        workflow[WORKFLOW_SESSION_KEY] = json!(session);
    }

    let mut context = Map::new();
    context.insert(CONTEXT_TASK.to_string(), task);
    context.insert(CONTEXT_WORKFLOW.to_string(), workflow);
    context.insert(CONTEXT_SESSIONS.to_string(), Value::Object(Map::new()));
    context
}

/// A fresh run with one pending `StepRun` per step.
pub fn new_run(definition: &WorkflowDefinition, run_id: String, task: Value) -> WorkflowRun {
    let context = seed_run_context(definition, &run_id, task);
    WorkflowRun {
        id: run_id,
        workflow_id: definition.id.clone(),
        status: RunStatus::Pending,
        context,
        steps: definition
            .steps
            .iter()
            .map(|s| StepRun::pending(s.id.clone()))
            .collect(),
        started_at: Utc::now(),
        completed_at: None,
        error: None,
    }
}

/// Agents recorded in the run's `workflow` metadata.
pub fn workflow_agents(run: &WorkflowRun) -> Vec<WorkflowAgent> {
    run.context
        .get(CONTEXT_WORKFLOW)
        .and_then(|w| w.get("agents"))
        .and_then(|a| serde_json::from_value(a.clone()).ok())
        .unwrap_or_default()
}

/// The workflow-level default session config recorded at run start.
pub fn workflow_session_default(run: &WorkflowRun) -> Option<StepSessionConfig> {
    run.context
        .get(CONTEXT_WORKFLOW)
        .and_then(|w| w.get(WORKFLOW_SESSION_KEY))
        .and_then(|s| serde_json::from_value(s.clone()).ok())
}

// ---------------------------------------------------------------------------
// Session configuration
// ---------------------------------------------------------------------------

/// Resolve the session config for a step.
///
/// Priority: `step.session`, then legacy `step.fresh_session`, then the
/// workflow default, then the engine default.
pub fn resolve_session_config(
    step: &WorkflowStep,
    workflow_default: Option<&StepSessionConfig>,
    engine_default: &StepSessionConfig,
) -> StepSessionConfig {
    if let Some(session) = &step.session {
        return session.clone();
    }

    let base = workflow_default.unwrap_or(engine_default).clone();
    match step.fresh_session {
        Some(true) => StepSessionConfig {
            mode: SessionMode::Fresh,
            ..base
        },
        Some(false) => StepSessionConfig {
            mode: SessionMode::Reuse,
            ..base
        },
        None => base,
    }
}

// ---------------------------------------------------------------------------
// Context views
// ---------------------------------------------------------------------------

/// Build the object an agent step is allowed to see.
pub fn build_session_context(
    config: &StepSessionConfig,
    run: &WorkflowRun,
    progress: &str,
) -> Value {
    match config.context {
        ContextScope::Minimal => minimal_context(run, progress),
        ContextScope::Full => full_context(run, progress),
        ContextScope::Custom => {
            let mut ctx = minimal_context(run, progress);
            let steps = completed_outputs(run, Some(config.include_outputs_from.as_slice()));
            ctx["steps"] = Value::Object(steps);
            ctx
        }
    }
}

/// `{task, workflow: {id, runId}, progress}`.
pub fn minimal_context(run: &WorkflowRun, progress: &str) -> Value {
    let workflow = run.context.get(CONTEXT_WORKFLOW);
    json!({
        "task": run.context.get(CONTEXT_TASK).cloned().unwrap_or(Value::Null),
        "workflow": {
            "id": workflow.and_then(|w| w.get("id")).cloned().unwrap_or(Value::Null),
            "runId": workflow.and_then(|w| w.get("runId")).cloned().unwrap_or(Value::Null),
        },
        "progress": progress,
    })
}

/// The run context without transient `_` keys, plus `progress` and `steps`.
pub fn full_context(run: &WorkflowRun, progress: &str) -> Value {
    let mut ctx: Map<String, Value> = run
        .context
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    ctx.insert("progress".to_string(), Value::String(progress.to_string()));
    ctx.insert("steps".to_string(), Value::Object(completed_outputs(run, None)));
    Value::Object(ctx)
}

/// `{<step_id>: {output}}` for completed steps with a recorded output.
///
/// With `only`, ids outside the list are dropped; listed ids that have no
/// recorded output are simply absent.
pub fn completed_outputs(run: &WorkflowRun, only: Option<&[String]>) -> Map<String, Value> {
    let mut steps = Map::new();
    for step_run in &run.steps {
        if step_run.status != StepStatus::Completed {
            continue;
        }
        if only.is_some_and(|ids| !ids.contains(&step_run.step_id)) {
            continue;
        }
        if let Some(output) = run.context.get(&step_run.step_id) {
            steps.insert(step_run.step_id.clone(), json!({ "output": output }));
        }
    }
    steps
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// The session key recorded for an agent, if any.
pub fn session_key_for(run: &WorkflowRun, agent_id: &str) -> Option<String> {
    run.context
        .get(CONTEXT_SESSIONS)
        .and_then(|s| s.get(agent_id))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Record session keys under `_sessions`.
pub fn record_sessions(context: &mut Map<String, Value>, records: &[SessionRecord]) {
    if records.is_empty() {
        return;
    }
    let sessions = context
        .entry(CONTEXT_SESSIONS.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !sessions.is_object() {
        *sessions = Value::Object(Map::new());
    }
    if let Value::Object(map) = sessions {
        for record in records {
            map.insert(
                record.agent_id.clone(),
                Value::String(record.session_key.clone()),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Output commit
// ---------------------------------------------------------------------------

/// Store a step output under its step id.
///
/// Outputs above `MAX_STEP_OUTPUT_SIZE` are replaced with a truncation marker.
pub fn commit_step_output(context: &mut Map<String, Value>, step_id: &str, output: Value) {
    let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);

    if size > MAX_STEP_OUTPUT_SIZE {
        tracing::warn!(
            step_id,
            size,
            max = MAX_STEP_OUTPUT_SIZE,
            "step output exceeds size limit, truncating"
        );
        let truncated = json!({
            "_truncated": true,
            "_original_size": size,
            "_message": format!(
                "output exceeded {} byte limit and was truncated",
                MAX_STEP_OUTPUT_SIZE
            )
        });
        context.insert(step_id.to_string(), truncated);
    } else {
        context.insert(step_id.to_string(), output);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
