//! Conduit Lua provisioning
//!
//! Evaluates `pipeline.lua` in a restricted sandbox and turns the returned
//! table into a validated [`ProvisioningDefinition`]. Nothing in the sandbox
//! can touch the filesystem, the network or spawn processes, so a definition
//! can be checked safely by the CLI and the orchestrator alike.

pub mod parser;
pub mod sandbox;

pub use parser::{parse_provisioning_definition, parse_provisioning_file};
pub use sandbox::create_sandbox;

pub use conduit_core::domain::provisioning::{ProvisioningDefinition, ProvisioningParams};
