//! Workflow run engine: expressions, criteria, context views, step execution
//! and run orchestration.
//!
//! - `expression` -- `{{path}}` templates and `and`/`or`/`==` conditions
//! - `criteria` -- acceptance-criterion checks against step output
//! - `context` -- run seeding, session context views, `_sessions` bookkeeping
//! - `tools` -- role tool policies and per-agent tool filters
//! - `agent` -- agent executor port
//! - `artifacts` -- step output and progress log storage port
//! - `step_executor` -- dispatch for agent, loop, gate and parallel steps
//! - `retry` -- `on_fail` retry policy
//! - `orchestrator` -- sequential run driver with cancellation
//! - `definition` -- YAML loading and structural validation

pub mod agent;
pub mod artifacts;
pub mod context;
pub mod criteria;
pub mod definition;
pub mod expression;
pub mod orchestrator;
pub mod retry;
pub mod step_executor;
pub mod tools;
