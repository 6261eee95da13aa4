//! Workflow domain types for Kanflow.
//!
//! Definition types (`WorkflowDefinition`, `WorkflowAgent`, `WorkflowStep`) are
//! read-only inputs to a run. Execution tracking types (`WorkflowRun`,
//! `StepRun`, `LoopState`) are mutated by the engine while a run progresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Context keys
// ---------------------------------------------------------------------------

/// Context key holding the task the run operates on.
pub const CONTEXT_TASK: &str = "task";

/// Context key holding workflow metadata (`id`, `name`, `runId`, `agents`).
pub const CONTEXT_WORKFLOW: &str = "workflow";

/// Context key holding the agent id -> session key map used by `reuse` sessions.
pub const CONTEXT_SESSIONS: &str = "_sessions";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A workflow definition as consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier (e.g. "feature-dev").
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Agents that steps may reference by id.
    #[serde(default)]
    pub agents: Vec<WorkflowAgent>,
    /// Ordered steps, executed sequentially by the orchestrator.
    pub steps: Vec<WorkflowStep>,
    /// Workflow-level default session configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<StepSessionConfig>,
}

impl WorkflowDefinition {
    /// Look up an agent definition by id.
    pub fn agent(&self, id: &str) -> Option<&WorkflowAgent> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Position of a step in the definition.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }
}

/// An agent participating in a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowAgent {
    pub id: String,
    /// Role used to look up the tool policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Explicit tool allowlist, narrowing the role policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step of a workflow.
///
/// Fields shared by every step type live on the struct; the type-specific
/// payload is the internally tagged `kind`:
/// ```yaml
/// - id: implement
///   type: loop
///   agent: developer
///   loop:
///     over: "{{plan.stories}}"
///   input: "Implement {{item.title}}"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step ID, unique within a workflow.
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Prompt template rendered against the step's session context.
    #[serde(default)]
    pub input: String,
    /// Output naming hint; the extension selects how output is parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutputSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<OnFailPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<StepSessionConfig>,
    /// Legacy session switch: `true` means fresh, `false` means reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fresh_session: Option<bool>,
    /// Step timeout in seconds, passed through to the agent executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl WorkflowStep {
    /// The agent this step invokes directly (agent and loop steps).
    pub fn agent_id(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Agent { agent } | StepKind::Loop { agent, .. } => Some(agent),
            StepKind::Gate { .. } | StepKind::Parallel { .. } => None,
        }
    }

    /// The output file hint, if any.
    pub fn output_file(&self) -> Option<&str> {
        self.output.as_ref().map(|o| o.file.as_str())
    }
}

/// Type-specific step payload, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// A single agent invocation.
    Agent { agent: String },
    /// One agent invocation per element of a collection.
    Loop {
        agent: String,
        #[serde(rename = "loop")]
        config: LoopConfig,
    },
    /// Blocks until `condition` holds.
    Gate {
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_false: Option<OnFalse>,
    },
    /// Concurrent fan-out of sub-steps.
    Parallel {
        #[serde(rename = "parallel")]
        config: ParallelConfig,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Agent { .. } => "agent",
            StepKind::Loop { .. } => "loop",
            StepKind::Gate { .. } => "gate",
            StepKind::Parallel { .. } => "parallel",
        }
    }
}

/// Output naming hint for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutputSpec {
    /// File name template, e.g. `plan.yml` or `story-{{index}}.md`.
    pub file: String,
}

/// What the orchestrator does when a step fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnFailPolicy {
    /// Step to resume from: the failing step itself or an earlier one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_step: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before retrying; clamped to five minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}

fn default_max_retries() -> u32 {
    1
}

/// Gate behaviour when its condition is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnFalse {
    /// `"human"` turns the failure into a blocked-on-human escalation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OnFalse {
    pub fn escalates_to_human(&self) -> bool {
        self.escalate_to.as_deref() == Some("human")
    }
}

// ---------------------------------------------------------------------------
// Loop / Parallel configuration
// ---------------------------------------------------------------------------

/// Configuration of a loop step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Collection expression, e.g. `{{plan.stories}}`.
    pub over: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub completion: LoopCompletion,
}

impl LoopConfig {
    pub fn item_var(&self) -> &str {
        self.item_var.as_deref().unwrap_or("item")
    }

    pub fn index_var(&self) -> &str {
        self.index_var.as_deref().unwrap_or("index")
    }
}

/// When a loop counts as successful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopCompletion {
    /// Every iteration must succeed.
    #[default]
    AllDone,
    /// Failures are tolerated once at least one iteration has succeeded.
    AnyDone,
    /// Stop after the first successful iteration.
    FirstSuccess,
}

/// Configuration of a parallel step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub steps: Vec<ParallelSubStep>,
    #[serde(default)]
    pub completion: ParallelCompletion,
}

/// A sub-step of a parallel step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelSubStep {
    pub id: String,
    pub agent: String,
    #[serde(default)]
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// How many sub-steps of a parallel step must succeed.
///
/// Written as `"all"`, `"any"`, or a number in YAML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CompletionRepr", into = "CompletionRepr")]
pub enum ParallelCompletion {
    #[default]
    All,
    Any,
    AtLeast(u32),
}

impl ParallelCompletion {
    /// Whether the policy is satisfied by the given outcome counts.
    pub fn is_met(&self, succeeded: usize, failed: usize) -> bool {
        match self {
            ParallelCompletion::All => failed == 0,
            ParallelCompletion::Any => succeeded >= 1,
            ParallelCompletion::AtLeast(n) => succeeded >= *n as usize,
        }
    }
}

impl std::fmt::Display for ParallelCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParallelCompletion::All => write!(f, "all"),
            ParallelCompletion::Any => write!(f, "any"),
            ParallelCompletion::AtLeast(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum CompletionRepr {
    Count(u32),
    Keyword(String),
}

impl TryFrom<CompletionRepr> for ParallelCompletion {
    type Error = String;

    fn try_from(repr: CompletionRepr) -> Result<Self, Self::Error> {
        match repr {
            CompletionRepr::Count(n) => Ok(ParallelCompletion::AtLeast(n)),
            CompletionRepr::Keyword(k) => match k.as_str() {
                "all" => Ok(ParallelCompletion::All),
                "any" => Ok(ParallelCompletion::Any),
                other => other
                    .parse::<u32>()
                    .map(ParallelCompletion::AtLeast)
                    .map_err(|_| format!("invalid parallel completion '{other}'")),
            },
        }
    }
}

impl From<ParallelCompletion> for CompletionRepr {
    fn from(c: ParallelCompletion) -> Self {
        match c {
            ParallelCompletion::All => CompletionRepr::Keyword("all".to_string()),
            ParallelCompletion::Any => CompletionRepr::Keyword("any".to_string()),
            ParallelCompletion::AtLeast(n) => CompletionRepr::Count(n),
        }
    }
}

// ---------------------------------------------------------------------------
// Session configuration
// ---------------------------------------------------------------------------

/// Session configuration resolved once per step.
///
/// Every field has a default, so `session: { mode: reuse }` is a complete
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSessionConfig {
    pub mode: SessionMode,
    pub context: ContextScope,
    pub cleanup: SessionCleanup,
    /// Invocation timeout in seconds when the step sets none.
    pub timeout: u64,
    /// Step ids visible to a `custom` context.
    #[serde(alias = "includeOutputsFrom", skip_serializing_if = "Vec::is_empty")]
    pub include_outputs_from: Vec<String>,
}

impl Default for StepSessionConfig {
    fn default() -> Self {
        Self {
            mode: SessionMode::Fresh,
            context: ContextScope::Full,
            cleanup: SessionCleanup::Delete,
            timeout: 300,
            include_outputs_from: Vec::new(),
        }
    }
}

/// Whether an agent step starts a new session or continues a recorded one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Fresh,
    Reuse,
}

/// How much of the run context an agent step can see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Minimal,
    #[default]
    Full,
    Custom,
}

/// What happens to a session after the step finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCleanup {
    #[default]
    Delete,
    Keep,
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Waiting for human input (gate escalation).
    Blocked,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Workflow Run
// ---------------------------------------------------------------------------

/// Progress of a loop step.
///
/// `completed_iterations + failed_iterations <= total_iterations` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    pub total_iterations: u32,
    pub current_iteration: u32,
    pub completed_iterations: u32,
    pub failed_iterations: u32,
}

/// Execution record of one step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub step_id: String,
    pub status: StepStatus,
    /// Number of times the step has been started.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            output_path: None,
            loop_state: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One execution of a workflow against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    /// Step outputs keyed by step id, plus `task`, `workflow` and `_sessions`.
    pub context: Map<String, Value>,
    pub steps: Vec<StepRun>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn step(&self, step_id: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepRun> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// The committed output of a step, if one was recorded.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.context.get(step_id)
    }
}

// ---------------------------------------------------------------------------
// Step execution result
// ---------------------------------------------------------------------------

/// What the step executor hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct StepExecutionResult {
    /// Raw text or parsed YAML/JSON.
    pub output: Value,
    /// Where the output artifact was written.
    pub output_path: String,
    /// Session keys to record under `_sessions`.
    pub sessions: Vec<SessionRecord>,
}

/// A session key produced by an agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub agent_id: String,
    pub session_key: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
