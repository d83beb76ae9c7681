//! Artifact store abstraction
//!
//! Stores are append-only: `put` always creates a new version and never
//! touches bytes already written. [`AuthorizedStore`] puts a role in front of
//! a store so every read and write is checked first.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::access::{Action, Role, require, resource};
use crate::domain::artifact::{ArtifactKey, ArtifactVersion};
use crate::error::{PipelineError, StoreError};

/// Versioned, write-once object store
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Appends `bytes` as the next version of `key`
    ///
    /// Versions are strictly increasing per key and readable as soon as this
    /// returns.
    async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<ArtifactVersion, StoreError>;

    /// Reads a version of `key`, or the latest when `version` is None
    async fn get(
        &self,
        key: &ArtifactKey,
        version: Option<ArtifactVersion>,
    ) -> Result<Vec<u8>, StoreError>;

    /// All versions of `key` in ascending order (empty for unknown keys)
    async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<ArtifactVersion>, StoreError>;

    /// Newest version of `key`, if any
    async fn latest(&self, key: &ArtifactKey) -> Result<Option<ArtifactVersion>, StoreError> {
        Ok(self.list_versions(key).await?.last().copied())
    }
}

/// An artifact store seen through one role
#[derive(Clone)]
pub struct AuthorizedStore {
    store: Arc<dyn ArtifactStore>,
    store_name: String,
    role: Role,
}

impl AuthorizedStore {
    pub fn new(store: Arc<dyn ArtifactStore>, store_name: impl Into<String>, role: Role) -> Self {
        Self {
            store,
            store_name: store_name.into(),
            role,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    fn resource(&self, key: &ArtifactKey) -> String {
        resource::artifact(&self.store_name, &key.pipeline, &key.stage, key.run_id)
    }

    pub async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<ArtifactVersion, PipelineError> {
        require(&self.role, Action::ObjectWrite, &self.resource(key))?;
        Ok(self.store.put(key, bytes).await?)
    }

    pub async fn get(
        &self,
        key: &ArtifactKey,
        version: Option<ArtifactVersion>,
    ) -> Result<Vec<u8>, PipelineError> {
        require(&self.role, Action::ObjectRead, &self.resource(key))?;
        Ok(self.store.get(key, version).await?)
    }

    pub async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<ArtifactVersion>, PipelineError> {
        require(&self.role, Action::ObjectRead, &self.resource(key))?;
        Ok(self.store.list_versions(key).await?)
    }
}
