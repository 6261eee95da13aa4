//! Workflow run execution engine for Kanflow.
//!
//! This crate defines the engine and the "ports" (agent executor, artifact
//! store, tool policy) that the infrastructure layer implements. It depends
//! only on `kanflow-types` -- never on `kanflow-infra` or any filesystem or
//! process-spawning code.

pub mod workflow;
