//! Execution environments
//!
//! An environment is created for exactly one stage invocation and destroyed
//! afterwards. Providers count their live environments so callers can check
//! that nothing outlives an invocation.

mod local;
mod podman;

pub use local::LocalProvider;
pub use podman::{PodmanProvider, check_podman_available};

use async_trait::async_trait;
use conduit_core::PipelineError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;
use uuid::Uuid;

/// What a provider needs to create an environment
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub run_id: Uuid,
    pub stage: String,
    /// Pinned runtime image
    pub image: String,
    /// Host directory holding the unpacked input bundle
    pub workspace: PathBuf,
}

/// A single-use execution environment
#[async_trait]
pub trait Environment: Send + Sync {
    /// Identifier used in logs (container name, directory, ...)
    fn id(&self) -> &str;

    /// Host path of the workspace shared with the environment
    fn workspace(&self) -> &Path;

    /// Prepares a shell command that runs inside the environment
    ///
    /// The returned command is not spawned yet; the caller sets up stdio.
    fn command(&self, script: &str, env: &BTreeMap<String, String>) -> Command;

    /// Destroys the environment
    async fn teardown(self: Box<Self>) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<Box<dyn Environment>, PipelineError>;

    /// Number of environments that have been provisioned and not yet torn down
    fn active(&self) -> usize;
}

/// Live-environment counter shared by a provider and its environments
#[derive(Debug, Clone, Default)]
pub(crate) struct ActiveCounter(Arc<AtomicUsize>);

impl ActiveCounter {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Counts one environment until the returned guard is dropped
    pub(crate) fn acquire(&self) -> ActiveGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self.0.clone())
    }
}

#[derive(Debug)]
pub(crate) struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_counter_tracks_guards() {
        let counter = ActiveCounter::default();
        let first = counter.acquire();
        let second = counter.acquire();
        assert_eq!(counter.get(), 2);

        drop(first);
        assert_eq!(counter.get(), 1);
        drop(second);
        assert_eq!(counter.get(), 0);
    }
}
