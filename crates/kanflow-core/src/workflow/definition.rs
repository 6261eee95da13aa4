//! Workflow definition loading and structural validation.
//!
//! Converts YAML files into `WorkflowDefinition` and checks the constraints
//! the engine relies on at run time: unique step ids, known agents, and
//! retry targets that point backwards.

use std::collections::HashSet;
use std::path::Path;

use kanflow_types::workflow::{StepKind, WorkflowDefinition};
use thiserror::Error;

/// Step ids that would shadow reserved context keys.
const RESERVED_STEP_IDS: &[&str] = &["task", "workflow", "steps", "progress", "loop"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A step references an agent the workflow does not declare.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Workflow id is non-empty and at least one step exists
/// - Step ids are unique and do not shadow reserved context keys
/// - Every agent reference (including parallel sub-steps) is declared
/// - Parallel sub-step ids are unique within their step
/// - `on_fail.retry_step` names the failing step or an earlier one
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut agent_ids = HashSet::new();
    for agent in &def.agents {
        if !agent_ids.insert(agent.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate agent ID: '{}'",
                agent.id
            )));
        }
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(WorkflowError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if step.id.starts_with('_') || RESERVED_STEP_IDS.contains(&step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "step ID '{}' is reserved",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    for (index, step) in def.steps.iter().enumerate() {
        if let Some(agent) = step.agent_id() {
            if !agent_ids.contains(agent) {
                return Err(WorkflowError::UnknownAgent(format!(
                    "step '{}' references unknown agent '{}'",
                    step.id, agent
                )));
            }
        }

        if let StepKind::Parallel { config } = &step.kind {
            let mut sub_ids = HashSet::new();
            for sub in &config.steps {
                if !sub_ids.insert(sub.id.as_str()) {
                    return Err(WorkflowError::ValidationError(format!(
                        "parallel step '{}' has duplicate sub-step '{}'",
                        step.id, sub.id
                    )));
                }
                if !agent_ids.contains(sub.agent.as_str()) {
                    return Err(WorkflowError::UnknownAgent(format!(
                        "parallel sub-step '{}.{}' references unknown agent '{}'",
                        step.id, sub.id, sub.agent
                    )));
                }
            }
        }

        let retry_target = step
            .on_fail
            .as_ref()
            .and_then(|policy| policy.retry_step.as_deref());
        if let Some(target) = retry_target {
            match def.step_index(target) {
                Some(target_index) if target_index <= index => {}
                Some(_) => {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}' retries from later step '{}'",
                        step.id, target
                    )));
                }
                None => {
                    return Err(WorkflowError::ValidationError(format!(
                        "step '{}' retries from unknown step '{}'",
                        step.id, target
                    )));
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
