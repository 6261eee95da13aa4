//! Workflow infrastructure: artifact storage and agent transports.
//!
//! - `artifacts` -- filesystem `ArtifactStore` under `{data_dir}/runs/`
//! - `agent_executor` -- placeholder and command `AgentExecutor`s

pub mod agent_executor;
pub mod artifacts;
