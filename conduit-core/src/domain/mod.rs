//! Core domain types
//!
//! This module contains the core domain structures used across Conduit crates.
//! The orchestrator owns runs and persists them, the runner consumes build specs
//! and stage definitions, and both check every side effect against a role.

pub mod access;
pub mod agent;
pub mod artifact;
pub mod build;
pub mod log;
pub mod pipeline;
pub mod provisioning;
pub mod run;
