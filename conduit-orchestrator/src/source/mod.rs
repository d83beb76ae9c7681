//! Source providers and branch watching

pub mod git;

pub use git::GitSourceProvider;
