//! Tool filters passed to agent invocations.
//!
//! A role's policy comes from a `ToolPolicy` lookup; an agent's own `tools`
//! list then narrows the role's allowlist. Denied tools always win.

use std::collections::HashMap;

use kanflow_types::config::ToolPolicyConfig;
use kanflow_types::workflow::WorkflowAgent;
use serde::{Deserialize, Serialize};

/// Wildcard entry meaning "every tool".
pub const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// ToolFilter
// ---------------------------------------------------------------------------

/// Allowed/denied tool names for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFilter {
    /// `None`, or a list containing `"*"`, means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denied: Vec<String>,
}

impl ToolFilter {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_unrestricted_allowlist(&self) -> bool {
        match &self.allowed {
            None => true,
            Some(list) => list.iter().any(|t| t == WILDCARD),
        }
    }

    /// Whether a tool may be used.
    pub fn permits(&self, tool: &str) -> bool {
        if self.denied.iter().any(|t| t == tool || t == WILDCARD) {
            return false;
        }
        self.is_unrestricted_allowlist()
            || self
                .allowed
                .as_ref()
                .is_some_and(|list| list.iter().any(|t| t == tool))
    }

    /// Narrow the allowlist to an agent's own tool list.
    pub fn narrowed_to(self, agent_tools: &[String]) -> Self {
        if agent_tools.iter().any(|t| t == WILDCARD) {
            return self;
        }
        let allowed = if self.is_unrestricted_allowlist() {
            agent_tools.to_vec()
        } else {
            let role_allowed = self.allowed.unwrap_or_default();
            agent_tools
                .iter()
                .filter(|t| role_allowed.contains(t))
                .cloned()
                .collect()
        };
        Self {
            allowed: Some(allowed),
            denied: self.denied,
        }
    }
}

impl From<&ToolPolicyConfig> for ToolFilter {
    fn from(config: &ToolPolicyConfig) -> Self {
        Self {
            allowed: config.allowed.clone(),
            denied: config.denied.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolPolicy
// ---------------------------------------------------------------------------

/// Role -> tool filter lookup.
pub trait ToolPolicy: Send + Sync {
    fn tool_filter_for_role(&self, role: &str) -> ToolFilter;
}

/// Table-backed policy built from `[tool_policies.<role>]` config sections.
///
/// Roles without an entry are unrestricted.
#[derive(Debug, Clone, Default)]
pub struct TablePolicy {
    policies: HashMap<String, ToolPolicyConfig>,
}

impl TablePolicy {
    pub fn new(policies: HashMap<String, ToolPolicyConfig>) -> Self {
        Self { policies }
    }
}

impl ToolPolicy for TablePolicy {
    fn tool_filter_for_role(&self, role: &str) -> ToolFilter {
        self.policies
            .get(role)
            .map(ToolFilter::from)
            .unwrap_or_default()
    }
}

/// Resolve the filter for an agent: role policy (role falls back to the agent
/// id), narrowed by the agent's own tool list.
pub fn resolve_tool_filter(policy: &dyn ToolPolicy, agent: &WorkflowAgent) -> ToolFilter {
    let role = agent.role.as_deref().unwrap_or(&agent.id);
    let filter = policy.tool_filter_for_role(role);
    match &agent.tools {
        Some(tools) => filter.narrowed_to(tools),
        None => filter,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
