//! Data Transfer Objects for the orchestrator API
//!
//! Lightweight request and response bodies shared by the orchestrator's HTTP
//! layer and the client crate.

pub mod artifact;
pub mod log;
pub mod run;
