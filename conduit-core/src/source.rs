//! Source provider abstraction
//!
//! The orchestrator only ever pulls from the source repository; it never
//! pushes, branches or merges.

use async_trait::async_trait;

use crate::error::PipelineError;

#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Commit id at the head of `branch`
    async fn branch_head(&self, branch: &str) -> Result<String, PipelineError>;

    /// Tar archive of the tree at `commit`
    async fn fetch_archive(&self, commit: &str) -> Result<Vec<u8>, PipelineError>;
}
