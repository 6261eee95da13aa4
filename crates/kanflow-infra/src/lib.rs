//! Infrastructure layer for Kanflow.
//!
//! Contains implementations of the ports defined in `kanflow-core`: the
//! filesystem artifact store, agent executor transports, and the engine
//! configuration loader.

pub mod config;
pub mod workflow;
