//! Conduit Core
//!
//! Core types and abstractions for the Conduit delivery pipeline.
//!
//! This crate contains:
//! - Domain types: roles and grants, artifacts, pipeline definitions, runs, build specs
//! - Collaborator traits: artifact store, log sink, source provider
//! - In-memory collaborator implementations for tests and ephemeral deployments
//! - DTOs: Data transfer objects for the orchestrator API

pub mod cancel;
pub mod domain;
pub mod dto;
pub mod error;
pub mod logsink;
pub mod memory;
pub mod source;
pub mod store;

pub use cancel::CancelSignal;
pub use error::{PipelineError, StoreError};
