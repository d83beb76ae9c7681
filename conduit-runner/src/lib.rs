//! Conduit build executor
//!
//! Runs one build stage inside a single-use environment:
//! - unpacks the input bundle into a fresh workspace
//! - runs install, pre_build, build and post_build in order
//! - streams every output line to the log sink
//! - packs the artifact manifest into the output bundle
//!
//! The environment is torn down after every invocation, including failed and
//! cancelled ones.

pub mod bundle;
pub mod environment;
pub mod executor;
pub mod logs;

pub use environment::{Environment, EnvironmentProvider, LocalProvider, PodmanProvider};
pub use executor::{BuildExecutor, BuildOutput, BuildRequest};
