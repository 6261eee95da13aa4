//! Agent executor boundary.
//!
//! The engine never talks to an agent runtime directly. It hands an
//! `AgentInvocation` to an `AgentExecutor`, which either starts a new session
//! or continues an existing one and returns the raw output.
//!
//! Follows the same pattern as the LLM provider abstraction:
//! 1. `AgentExecutor` uses RPITIT for async methods
//! 2. `AgentExecutorDyn` is the object-safe mirror with boxed futures
//! 3. `BoxAgentExecutor` wraps `Box<dyn AgentExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use kanflow_types::workflow::SessionMode;
use serde_json::Value;

use super::tools::ToolFilter;

// ---------------------------------------------------------------------------
// Invocation / response
// ---------------------------------------------------------------------------

/// Everything an agent executor needs to run one prompt.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub run_id: String,
    pub step_id: String,
    pub agent_id: String,
    pub role: Option<String>,
    pub model: Option<String>,
    pub prompt: String,
    pub tool_filter: ToolFilter,
    pub timeout: Duration,
    pub session_mode: SessionMode,
    /// Session to continue when `session_mode` is `reuse` and one was recorded.
    pub session_key: Option<String>,
    /// The context view the step was allowed to see.
    pub context: Value,
}

/// Raw agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub output: String,
    /// Key of the session that produced the output, if the executor keeps sessions.
    pub session_key: Option<String>,
}

/// Errors from the agent transport.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent '{agent_id}' timed out after {timeout_secs}s")]
    Timeout { agent_id: String, timeout_secs: u64 },

    #[error("agent '{agent_id}' failed: {message}")]
    Failed { agent_id: String, message: String },

    #[error("agent transport error: {0}")]
    Transport(String),

    #[error("session '{0}' not found")]
    SessionNotFound(String),
}

// ---------------------------------------------------------------------------
// AgentExecutor trait
// ---------------------------------------------------------------------------

/// Spawns or continues agent sessions.
///
/// Uses RPITIT for async methods; wrap in `BoxAgentExecutor` for dynamic dispatch.
pub trait AgentExecutor: Send + Sync {
    /// Start a new session, or continue `invocation.session_key` if set.
    fn spawn_or_continue(
        &self,
        invocation: AgentInvocation,
    ) -> impl Future<Output = Result<AgentResponse, AgentError>> + Send;

    /// Release a session that will not be reused.
    fn cleanup_session(
        &self,
        session_key: &str,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;
}

/// Object-safe version of [`AgentExecutor`] with boxed futures.
pub trait AgentExecutorDyn: Send + Sync {
    fn spawn_or_continue_boxed(
        &self,
        invocation: AgentInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, AgentError>> + Send + '_>>;

    fn cleanup_session_boxed<'a>(
        &'a self,
        session_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'a>>;
}

impl<T: AgentExecutor> AgentExecutorDyn for T {
    fn spawn_or_continue_boxed(
        &self,
        invocation: AgentInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<AgentResponse, AgentError>> + Send + '_>> {
        Box::pin(self.spawn_or_continue(invocation))
    }

    fn cleanup_session_boxed<'a>(
        &'a self,
        session_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'a>> {
        Box::pin(self.cleanup_session(session_key))
    }
}

/// Type-erased agent executor for runtime transport selection.
pub struct BoxAgentExecutor {
    inner: Box<dyn AgentExecutorDyn + Send + Sync>,
}

impl BoxAgentExecutor {
    pub fn new<T: AgentExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn spawn_or_continue(
        &self,
        invocation: AgentInvocation,
    ) -> Result<AgentResponse, AgentError> {
        self.inner.spawn_or_continue_boxed(invocation).await
    }

    pub async fn cleanup_session(&self, session_key: &str) -> Result<(), AgentError> {
        self.inner.cleanup_session_boxed(session_key).await
    }
}

impl std::fmt::Debug for BoxAgentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgentExecutor").finish_non_exhaustive()
    }
}
