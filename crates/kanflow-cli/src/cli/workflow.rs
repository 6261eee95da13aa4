//! Workflow subcommands: validate, run, and check.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::Value;

use kanflow_core::workflow::artifacts::BoxArtifactStore;
use kanflow_core::workflow::criteria::{check_criterion, Criterion};
use kanflow_core::workflow::definition::{load_workflow_file, WorkflowError};
use kanflow_core::workflow::orchestrator::RunOrchestrator;
use kanflow_core::workflow::step_executor::{parse_output, StepExecutor};
use kanflow_core::workflow::tools::TablePolicy;
use kanflow_infra::config::{load_engine_config, resolve_data_dir};
use kanflow_infra::workflow::agent_executor::build_agent_executor;
use kanflow_infra::workflow::artifacts::FsArtifactStore;
use kanflow_types::config::EngineConfig;
use kanflow_types::workflow::{
    RunStatus, StepKind, StepStatus, WorkflowDefinition, WorkflowRun, WorkflowStep,
};

fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse workflow YAML: {msg}"),
        WorkflowError::ValidationError(msg) => anyhow::anyhow!("Workflow validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load workflow {}: {other}", file.display()),
    })
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Parse and validate a workflow file, then list its steps.
pub async fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load_definition(file)?;

    if json {
        let steps: Vec<Value> = def
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "type": s.kind.type_name(),
                    "agent": s.agent_id(),
                    "output": s.output_file(),
                    "acceptance_criteria": s.acceptance_criteria.len(),
                    "on_fail": s.on_fail.is_some(),
                })
            })
            .collect();
        let out = serde_json::json!({
            "id": def.id,
            "name": def.name,
            "agents": def.agents.len(),
            "steps": steps,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("✓").green().bold(),
        style(def.name.as_deref().unwrap_or(&def.id)).cyan()
    );
    println!("  ID: {}", def.id);
    println!("  Agents: {}", def.agents.len());
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Agent"),
            Cell::new("Output"),
            Cell::new("Criteria"),
            Cell::new("On fail"),
        ]);

    for (i, step) in def.steps.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&step.id),
            Cell::new(step.kind.type_name()),
            Cell::new(agent_label(step)),
            Cell::new(step.output_file().unwrap_or("-")),
            Cell::new(step.acceptance_criteria.len()),
            Cell::new(on_fail_label(step)),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}

fn agent_label(step: &WorkflowStep) -> String {
    match &step.kind {
        StepKind::Agent { agent } | StepKind::Loop { agent, .. } => agent.clone(),
        StepKind::Parallel { config } => config
            .steps
            .iter()
            .map(|s| s.agent.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        StepKind::Gate { .. } => "-".to_string(),
    }
}

fn on_fail_label(step: &WorkflowStep) -> String {
    match &step.on_fail {
        Some(policy) => format!(
            "retry x{} from {}",
            policy.max_retries,
            policy.retry_step.as_deref().unwrap_or(&step.id)
        ),
        None => "-".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Run a workflow against a task document with the configured executor.
pub async fn handle_run(
    file: &Path,
    task_file: Option<&Path>,
    data_dir: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let def = load_definition(file)?;
    let task = match task_file {
        Some(path) => load_task(path).await?,
        None => Value::Object(Default::default()),
    };

    let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
    let config = load_engine_config(&data_dir).await;
    let orchestrator = Arc::new(build_orchestrator(&data_dir, &config)?);

    let run_id = orchestrator
        .prepare(&def, task)
        .context("Failed to create workflow run")?;
    tracing::info!(run_id = %run_id, workflow = %def.id, data_dir = %data_dir.display(), "starting workflow run");
    if !json {
        println!();
        println!(
            "  {} Running workflow '{}' ({})",
            style("▶").cyan().bold(),
            style(&def.id).cyan(),
            style(&run_id).dim()
        );
    }

    // Ctrl-C cancels the run instead of killing the process
    let watcher = {
        let orchestrator = Arc::clone(&orchestrator);
        let run_id = run_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!(run_id = %run_id, "interrupt received, cancelling run");
                if let Err(e) = orchestrator.cancel(&run_id) {
                    tracing::debug!(error = %e, "run already finished");
                }
            }
        })
    };

    let run = orchestrator.execute(&run_id, &def).await?;
    watcher.abort();
    orchestrator.shutdown().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&def, &run, &data_dir);
    }

    match run.status {
        RunStatus::Completed | RunStatus::Blocked => Ok(()),
        status => bail!(
            "Workflow run {} {}: {}",
            run.id,
            status,
            run.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

fn build_orchestrator(data_dir: &Path, config: &EngineConfig) -> Result<RunOrchestrator> {
    let agents = build_agent_executor(&config.agent_executor)
        .context("Failed to configure agent executor")?;
    let artifacts = FsArtifactStore::with_limits(data_dir, &config.limits);
    let executor = StepExecutor::new(
        Arc::new(agents),
        Arc::new(BoxArtifactStore::new(artifacts)),
        Arc::new(TablePolicy::new(config.tool_policies.clone())),
        config,
    );
    Ok(RunOrchestrator::new(executor))
}

/// Read a task document; `.json` files are parsed as JSON, anything else as YAML.
async fn load_task(path: &Path) -> Result<Value> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read task file {}", path.display()))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let task = if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?
    } else {
        serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?
    };
    Ok(task)
}

fn print_run(def: &WorkflowDefinition, run: &WorkflowRun, data_dir: &Path) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Detail"),
        ]);

    for step_run in &run.steps {
        let step_type = def
            .steps
            .iter()
            .find(|s| s.id == step_run.step_id)
            .map(|s| s.kind.type_name())
            .unwrap_or("-");
        let detail = match (&step_run.error, &step_run.loop_state) {
            (Some(error), _) => error.clone(),
            (None, Some(state)) => format!(
                "{}/{} iterations ({} failed)",
                state.completed_iterations, state.total_iterations, state.failed_iterations
            ),
            (None, None) => step_run.output_path.clone().unwrap_or_else(|| "-".to_string()),
        };

        table.add_row(vec![
            Cell::new(&step_run.step_id),
            Cell::new(step_type),
            format_step_status(step_run.status),
            Cell::new(step_run.attempts),
            Cell::new(detail),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    let marker = match run.status {
        RunStatus::Completed => style("✓").green().bold(),
        RunStatus::Blocked => style("⏸").magenta().bold(),
        _ => style("✗").red().bold(),
    };
    println!("  {} Run {}: {}", marker, style(&run.id).dim(), run.status);
    if let (RunStatus::Blocked, Some(error)) = (run.status, &run.error) {
        println!("  {} {}", style("Waiting for human:").bold(), error);
    }
    println!(
        "  Artifacts: {}",
        style(data_dir.join("runs").join(&run.id).display()).dim()
    );
    println!();
}

fn format_step_status(status: StepStatus) -> Cell {
    match status {
        StepStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        StepStatus::Running => Cell::new("running").fg(Color::Blue),
        StepStatus::Completed => Cell::new("completed").fg(Color::Green),
        StepStatus::Failed => Cell::new("failed").fg(Color::Red),
        StepStatus::Blocked => Cell::new("blocked").fg(Color::Magenta),
    }
}

// ---------------------------------------------------------------------------
// Check
// ---------------------------------------------------------------------------

/// Evaluate one acceptance criterion against an output file.
pub async fn handle_check(
    criterion: &str,
    output: &Path,
    format: Option<&str>,
    json: bool,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(output)
        .await
        .with_context(|| format!("Failed to read output file {}", output.display()))?;

    let hint = match format {
        Some(f) => f.to_string(),
        None => output.to_string_lossy().into_owned(),
    };
    let parsed = parse_output("check", &raw, Some(&hint));

    let config = load_engine_config(&resolve_data_dir()).await;
    let timeout = Duration::from_millis(config.limits.regex_timeout_ms);
    let passed = check_criterion(criterion, &raw, &parsed, timeout).await;
    let kind = match Criterion::parse(criterion) {
        Criterion::Regex { .. } => "regex",
        Criterion::FieldEquals { .. } => "field_equals",
        Criterion::Contains(_) => "contains",
    };

    if json {
        let out = serde_json::json!({
            "criterion": criterion,
            "kind": kind,
            "passed": passed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if passed {
        println!(
            "  {} {} ({})",
            style("✓").green().bold(),
            criterion,
            style(kind).dim()
        );
    } else {
        println!(
            "  {} {} ({})",
            style("✗").red().bold(),
            criterion,
            style(kind).dim()
        );
    }

    if !passed {
        bail!("Criterion not met: {criterion}");
    }
    Ok(())
}
