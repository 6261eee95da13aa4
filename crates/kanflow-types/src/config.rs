//! Engine configuration types for Kanflow.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! execution limits, the default session configuration, per-role tool
//! policies, and which agent executor the CLI wires in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::workflow::StepSessionConfig;

// ---------------------------------------------------------------------------
// Hard ceilings
// ---------------------------------------------------------------------------

/// Loop iterations can never exceed this, whatever the configuration says.
pub const HARD_MAX_LOOP_ITERATIONS: u32 = 1000;

/// Parallel sub-steps can never exceed this, whatever the configuration says.
pub const HARD_MAX_PARALLEL_STEPS: usize = 50;

/// Retry delays are clamped to five minutes.
pub const MAX_RETRY_DELAY_MS: u64 = 300_000;

/// Regex criteria with longer patterns are treated as plain substrings.
pub const MAX_REGEX_PATTERN_LEN: usize = 500;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.kanflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: EngineLimits,

    /// Session configuration used when neither the step nor the workflow sets one.
    #[serde(default)]
    pub session: StepSessionConfig,

    /// Tool policies keyed by agent role.
    #[serde(default)]
    pub tool_policies: HashMap<String, ToolPolicyConfig>,

    #[serde(default)]
    pub agent_executor: AgentExecutorConfig,
}

/// Execution limits. Loop and parallel limits are clamped to the hard ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineLimits {
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Deadline for a single regex criterion match.
    #[serde(default = "default_regex_timeout_ms")]
    pub regex_timeout_ms: u64,

    /// Progress log size past which appends are skipped.
    #[serde(default = "default_progress_log_max_bytes")]
    pub progress_log_max_bytes: u64,

    /// The progress log size is only checked every N appends.
    #[serde(default = "default_progress_size_check_interval")]
    pub progress_size_check_interval: u32,
}

fn default_max_loop_iterations() -> u32 {
    HARD_MAX_LOOP_ITERATIONS
}

fn default_max_parallel_steps() -> usize {
    HARD_MAX_PARALLEL_STEPS
}

fn default_regex_timeout_ms() -> u64 {
    100
}

fn default_progress_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_progress_size_check_interval() -> u32 {
    10
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_loop_iterations: default_max_loop_iterations(),
            max_parallel_steps: default_max_parallel_steps(),
            regex_timeout_ms: default_regex_timeout_ms(),
            progress_log_max_bytes: default_progress_log_max_bytes(),
            progress_size_check_interval: default_progress_size_check_interval(),
        }
    }
}

impl EngineLimits {
    /// Effective loop ceiling after clamping.
    pub fn loop_ceiling(&self) -> u32 {
        self.max_loop_iterations.min(HARD_MAX_LOOP_ITERATIONS)
    }

    /// Effective parallel ceiling after clamping.
    pub fn parallel_ceiling(&self) -> usize {
        self.max_parallel_steps.min(HARD_MAX_PARALLEL_STEPS)
    }
}

/// Allowed/denied tool names for one role.
///
/// `allowed = None` or an allowlist containing `"*"` means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(default)]
    pub denied: Vec<String>,
}

/// Which agent executor the binary should construct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentExecutorConfig {
    #[serde(default)]
    pub kind: AgentExecutorKind,
    /// Program to spawn for the `command` executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentExecutorKind {
    /// Simulated agent output.
    #[default]
    Placeholder,
    /// Pipe the prompt into an external program and read its stdout.
    Command,
}
