//! Engine configuration loader for Kanflow.
//!
//! Reads `config.toml` from the data directory (`~/.kanflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use kanflow_types::config::{
    EngineConfig, EngineLimits, HARD_MAX_LOOP_ITERATIONS, HARD_MAX_PARALLEL_STEPS,
};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "KANFLOW_DATA_DIR";

const CONFIG_FILE: &str = "config.toml";

/// Regex deadlines above this would stall a step on every criterion check.
const MAX_REGEX_TIMEOUT_MS: u64 = 10_000;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// A missing, unreadable or malformed file yields [`EngineConfig::default()`].
/// Out-of-range limits are pulled back into range with a warning.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let path = data_dir.join(CONFIG_FILE);
    let mut config = match tokio::fs::read_to_string(&path).await {
        Ok(content) => parse_engine_config(&content, &path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no engine config, using defaults");
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "cannot read engine config, using defaults");
            EngineConfig::default()
        }
    };
    normalize_limits(&mut config.limits);
    config
}

fn parse_engine_config(content: &str, path: &Path) -> EngineConfig {
    toml::from_str(content).unwrap_or_else(|err| {
        tracing::warn!(path = %path.display(), error = %err, "malformed engine config, using defaults");
        EngineConfig::default()
    })
}

/// Clamp limits the engine cannot honour as written.
pub fn normalize_limits(limits: &mut EngineLimits) {
    let defaults = EngineLimits::default();

    if limits.max_loop_iterations > HARD_MAX_LOOP_ITERATIONS {
        tracing::warn!(
            configured = limits.max_loop_iterations,
            ceiling = HARD_MAX_LOOP_ITERATIONS,
            "limits.max_loop_iterations above hard ceiling"
        );
        limits.max_loop_iterations = HARD_MAX_LOOP_ITERATIONS;
    }
    if limits.max_parallel_steps > HARD_MAX_PARALLEL_STEPS {
        tracing::warn!(
            configured = limits.max_parallel_steps,
            ceiling = HARD_MAX_PARALLEL_STEPS,
            "limits.max_parallel_steps above hard ceiling"
        );
        limits.max_parallel_steps = HARD_MAX_PARALLEL_STEPS;
    }
    if limits.regex_timeout_ms == 0 {
        tracing::warn!(
            fallback = defaults.regex_timeout_ms,
            "limits.regex_timeout_ms is zero, every regex criterion would fail"
        );
        limits.regex_timeout_ms = defaults.regex_timeout_ms;
    } else if limits.regex_timeout_ms > MAX_REGEX_TIMEOUT_MS {
        tracing::warn!(
            configured = limits.regex_timeout_ms,
            ceiling = MAX_REGEX_TIMEOUT_MS,
            "limits.regex_timeout_ms too large"
        );
        limits.regex_timeout_ms = MAX_REGEX_TIMEOUT_MS;
    }
    if limits.progress_size_check_interval == 0 {
        limits.progress_size_check_interval = 1;
    }
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `KANFLOW_DATA_DIR` environment variable
/// 2. `~/.kanflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".kanflow");
    }

    // Last resort: current directory
    PathBuf::from(".kanflow")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kanflow_types::config::AgentExecutorKind;
    use kanflow_types::workflow::ContextScope;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.limits.max_loop_iterations, 1000);
        assert!(config.tool_policies.is_empty());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[limits]
max_parallel_steps = 8
regex_timeout_ms = 50

[session]
context = "minimal"

[tool_policies.developer]
allowed = ["read_file", "write_file"]
denied = ["shell"]

[agent_executor]
kind = "command"
program = "my-agent"
args = ["--stdin"]
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.limits.max_parallel_steps, 8);
        assert_eq!(config.limits.regex_timeout_ms, 50);
        assert_eq!(config.limits.max_loop_iterations, 1000);
        assert_eq!(config.session.context, ContextScope::Minimal);
        assert_eq!(config.tool_policies["developer"].denied, vec!["shell"]);
        assert_eq!(config.agent_executor.kind, AgentExecutorKind::Command);
        assert_eq!(config.agent_executor.program.as_deref(), Some("my-agent"));
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.limits.max_parallel_steps, 50);
        assert_eq!(config.agent_executor.kind, AgentExecutorKind::Placeholder);
    }

    #[tokio::test]
    async fn load_engine_config_clamps_out_of_range_limits() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[limits]
max_loop_iterations = 5000
max_parallel_steps = 200
regex_timeout_ms = 0
progress_size_check_interval = 0
progress_log_max_bytes = 2048
"#,
        )
        .await
        .unwrap();

        let limits = load_engine_config(tmp.path()).await.limits;
        assert_eq!(limits.max_loop_iterations, HARD_MAX_LOOP_ITERATIONS);
        assert_eq!(limits.max_parallel_steps, HARD_MAX_PARALLEL_STEPS);
        assert_eq!(limits.regex_timeout_ms, 100);
        assert_eq!(limits.progress_size_check_interval, 1);
        assert_eq!(limits.progress_log_max_bytes, 2048);
    }

    #[test]
    fn test_normalize_limits_caps_regex_timeout_and_keeps_valid_values() {
        let mut limits = EngineLimits {
            regex_timeout_ms: 60_000,
            max_loop_iterations: 20,
            ..EngineLimits::default()
        };
        normalize_limits(&mut limits);
        assert_eq!(limits.regex_timeout_ms, MAX_REGEX_TIMEOUT_MS);
        assert_eq!(limits.max_loop_iterations, 20);
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var(DATA_DIR_ENV, "/tmp/test-kanflow");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-kanflow"));
        unsafe {
            std::env::remove_var(DATA_DIR_ENV);
        }
    }
}
