//! Agent executor transports.
//!
//! [`PlaceholderAgentExecutor`] simulates agent output with a formatted
//! string so workflows can be dry-run end to end. [`CommandAgentExecutor`]
//! pipes the rendered prompt into an external program and returns its stdout.
//! [`build_agent_executor`] picks one from the engine configuration.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use kanflow_core::workflow::agent::{
    AgentError, AgentExecutor, AgentInvocation, AgentResponse, BoxAgentExecutor,
};
use kanflow_types::config::{AgentExecutorConfig, AgentExecutorKind};
use kanflow_types::workflow::SessionMode;
use tokio::io::AsyncWriteExt;

/// Environment variables handed to command agents.
pub const ENV_RUN_ID: &str = "KANFLOW_RUN_ID";
pub const ENV_STEP_ID: &str = "KANFLOW_STEP_ID";
pub const ENV_AGENT_ID: &str = "KANFLOW_AGENT_ID";
pub const ENV_AGENT_ROLE: &str = "KANFLOW_AGENT_ROLE";
pub const ENV_MODEL: &str = "KANFLOW_MODEL";
pub const ENV_SESSION_KEY: &str = "KANFLOW_SESSION_KEY";
pub const ENV_SESSION_RESUME: &str = "KANFLOW_SESSION_RESUME";
pub const ENV_ALLOWED_TOOLS: &str = "KANFLOW_ALLOWED_TOOLS";
pub const ENV_DENIED_TOOLS: &str = "KANFLOW_DENIED_TOOLS";

/// Session key for a new session: `{run_id}-{agent_id}-{n}`.
fn new_session_key(invocation: &AgentInvocation, counter: &AtomicU64) -> String {
    let n = counter.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", invocation.run_id, invocation.agent_id, n)
}

// ---------------------------------------------------------------------------
// PlaceholderAgentExecutor
// ---------------------------------------------------------------------------

/// Returns a formatted echo of the invocation instead of running an agent.
#[derive(Debug, Default)]
pub struct PlaceholderAgentExecutor {
    sessions: AtomicU64,
}

impl PlaceholderAgentExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentExecutor for PlaceholderAgentExecutor {
    async fn spawn_or_continue(
        &self,
        invocation: AgentInvocation,
    ) -> Result<AgentResponse, AgentError> {
        let session_key = invocation
            .session_key
            .clone()
            .unwrap_or_else(|| new_session_key(&invocation, &self.sessions));
        let role = invocation.role.as_deref().unwrap_or(&invocation.agent_id);

        tracing::debug!(
            run_id = %invocation.run_id,
            step_id = %invocation.step_id,
            agent_id = %invocation.agent_id,
            session_key = %session_key,
            "placeholder agent invoked"
        );

        let output = format!(
            "[{}] Agent {} executed step {}\n\n{}",
            role, invocation.agent_id, invocation.step_id, invocation.prompt
        );
        Ok(AgentResponse {
            output,
            session_key: Some(session_key),
        })
    }

    async fn cleanup_session(&self, session_key: &str) -> Result<(), AgentError> {
        tracing::debug!(session_key, "placeholder session released");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommandAgentExecutor
// ---------------------------------------------------------------------------

/// Spawns `program args...` per invocation.
///
/// The prompt is written to stdin and stdout is the agent output. Invocation
/// metadata is passed through `KANFLOW_*` environment variables; a continued
/// session sets `KANFLOW_SESSION_RESUME=1`. The process is killed when the
/// invocation timeout elapses.
#[derive(Debug)]
pub struct CommandAgentExecutor {
    program: String,
    args: Vec<String>,
    sessions: AtomicU64,
}

impl CommandAgentExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            sessions: AtomicU64::new(0),
        }
    }
}

impl AgentExecutor for CommandAgentExecutor {
    async fn spawn_or_continue(
        &self,
        invocation: AgentInvocation,
    ) -> Result<AgentResponse, AgentError> {
        let resume = invocation.session_mode == SessionMode::Reuse
            && invocation.session_key.is_some();
        let session_key = invocation
            .session_key
            .clone()
            .unwrap_or_else(|| new_session_key(&invocation, &self.sessions));

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env(ENV_RUN_ID, &invocation.run_id)
            .env(ENV_STEP_ID, &invocation.step_id)
            .env(ENV_AGENT_ID, &invocation.agent_id)
            .env(ENV_SESSION_KEY, &session_key)
            .env(ENV_SESSION_RESUME, if resume { "1" } else { "0" })
            .env(ENV_DENIED_TOOLS, invocation.tool_filter.denied.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(role) = &invocation.role {
            command.env(ENV_AGENT_ROLE, role);
        }
        if let Some(model) = &invocation.model {
            command.env(ENV_MODEL, model);
        }
        if !invocation.tool_filter.is_unrestricted_allowlist() {
            let allowed = invocation.tool_filter.allowed.clone().unwrap_or_default();
            command.env(ENV_ALLOWED_TOOLS, allowed.join(","));
        }

        let mut child = command.spawn().map_err(|e| {
            AgentError::Transport(format!("failed to spawn '{}': {e}", self.program))
        })?;

        // Feed stdin while stdout is drained; a streaming agent would
        // otherwise block on a full pipe before reading the whole prompt.
        let stdin = child.stdin.take();
        let prompt = invocation.prompt.as_bytes();
        let agent_id = invocation.agent_id.as_str();
        let feed = async move {
            if let Some(mut stdin) = stdin
                && let Err(e) = stdin.write_all(prompt).await
            {
                tracing::debug!(agent_id, error = %e, "agent closed stdin early");
            }
        };
        let exchange = async { tokio::join!(feed, child.wait_with_output()).1 };

        let output = tokio::time::timeout(invocation.timeout, exchange)
            .await
            .map_err(|_| AgentError::Timeout {
                agent_id: invocation.agent_id.clone(),
                timeout_secs: invocation.timeout.as_secs(),
            })?
            .map_err(|e| AgentError::Transport(format!("failed to wait for agent: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Failed {
                agent_id: invocation.agent_id.clone(),
                message: format!("exited with status {}: {}", output.status, stderr.trim()),
            });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| AgentError::Failed {
            agent_id: invocation.agent_id.clone(),
            message: "output is not valid UTF-8".to_string(),
        })?;

        tracing::debug!(
            run_id = %invocation.run_id,
            step_id = %invocation.step_id,
            agent_id = %invocation.agent_id,
            bytes = stdout.len(),
            "command agent finished"
        );
        Ok(AgentResponse {
            output: stdout,
            session_key: Some(session_key),
        })
    }

    async fn cleanup_session(&self, session_key: &str) -> Result<(), AgentError> {
        // Session state, if any, belongs to the external program.
        tracing::debug!(session_key, program = %self.program, "command session released");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the configured agent executor.
pub fn build_agent_executor(config: &AgentExecutorConfig) -> Result<BoxAgentExecutor, AgentError> {
    match config.kind {
        AgentExecutorKind::Placeholder => Ok(BoxAgentExecutor::new(PlaceholderAgentExecutor::new())),
        AgentExecutorKind::Command => {
            let program = config.program.as_deref().filter(|p| !p.trim().is_empty()).ok_or_else(|| {
                AgentError::Transport(
                    "agent_executor.program is required for the command executor".to_string(),
                )
            })?;
            Ok(BoxAgentExecutor::new(CommandAgentExecutor::new(
                program,
                config.args.clone(),
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
