//! Shared domain types for Kanflow.
//!
//! This crate contains the workflow definition and run-tracking types used
//! across the engine, plus the engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, chrono.

pub mod config;
pub mod workflow;
