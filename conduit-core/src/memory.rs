//! In-memory collaborators
//!
//! Thread-safe implementations of the store, log sink and source provider
//! traits. Used by tests and by the orchestrator when it runs without
//! persistent storage.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::domain::artifact::{ArtifactKey, ArtifactVersion};
use crate::domain::log::{LogEntry, LogKey};
use crate::error::{PipelineError, StoreError};
use crate::logsink::LogSink;
use crate::source::SourceProvider;
use crate::store::ArtifactStore;

/// Artifact store backed by a map of version lists
#[derive(Default)]
pub struct InMemoryArtifactStore {
    objects: RwLock<HashMap<ArtifactKey, Vec<Vec<u8>>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of versions across all keys
    pub fn total_versions(&self) -> usize {
        self.objects
            .read()
            .map(|objects| objects.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Every key that has at least one version
    pub fn keys(&self) -> Vec<ArtifactKey> {
        self.objects
            .read()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Backend(format!("store lock poisoned: {}", e))
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<ArtifactVersion, StoreError> {
        let mut objects = self.objects.write().map_err(poisoned)?;
        let versions = objects.entry(key.clone()).or_default();
        versions.push(bytes.to_vec());
        Ok(ArtifactVersion(versions.len() as u64))
    }

    async fn get(
        &self,
        key: &ArtifactKey,
        version: Option<ArtifactVersion>,
    ) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.read().map_err(poisoned)?;
        let versions = objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let bytes = match version {
            Some(ArtifactVersion(0)) => None,
            Some(ArtifactVersion(n)) => versions.get(n as usize - 1),
            None => versions.last(),
        };

        bytes.cloned().ok_or_else(|| {
            StoreError::NotFound(format!(
                "{}@{}",
                key,
                version.map(|v| v.to_string()).unwrap_or_else(|| "latest".to_string())
            ))
        })
    }

    async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<ArtifactVersion>, StoreError> {
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects
            .get(key)
            .map(|versions| (1..=versions.len() as u64).map(ArtifactVersion).collect())
            .unwrap_or_default())
    }
}

/// Log sink keeping every stream in memory
#[derive(Default)]
pub struct InMemoryLogSink {
    streams: Mutex<HashMap<LogKey, Vec<LogEntry>>>,
}

impl InMemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LogSink for InMemoryLogSink {
    async fn append(&self, key: &LogKey, entries: Vec<LogEntry>) -> Result<(), PipelineError> {
        let mut streams = self
            .streams
            .lock()
            .map_err(|e| PipelineError::LogSink(format!("log lock poisoned: {}", e)))?;
        streams.entry(key.clone()).or_default().extend(entries);
        Ok(())
    }

    async fn read(&self, key: &LogKey) -> Result<Vec<LogEntry>, PipelineError> {
        let streams = self
            .streams
            .lock()
            .map_err(|e| PipelineError::LogSink(format!("log lock poisoned: {}", e)))?;
        Ok(streams.get(key).cloned().unwrap_or_default())
    }
}

/// Source provider serving fixed branch heads and archives
#[derive(Default)]
pub struct StaticSourceProvider {
    heads: RwLock<HashMap<String, String>>,
    archives: RwLock<HashMap<String, Vec<u8>>>,
}

impl StaticSourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `branch` to `commit` and registers the commit's archive
    pub fn push(&self, branch: &str, commit: &str, archive: Vec<u8>) {
        if let Ok(mut heads) = self.heads.write() {
            heads.insert(branch.to_string(), commit.to_string());
        }
        if let Ok(mut archives) = self.archives.write() {
            archives.insert(commit.to_string(), archive);
        }
    }
}

#[async_trait]
impl SourceProvider for StaticSourceProvider {
    async fn branch_head(&self, branch: &str) -> Result<String, PipelineError> {
        let heads = self
            .heads
            .read()
            .map_err(|e| PipelineError::SourceFetch(e.to_string()))?;
        heads
            .get(branch)
            .cloned()
            .ok_or_else(|| PipelineError::SourceFetch(format!("branch '{}' not found", branch)))
    }

    async fn fetch_archive(&self, commit: &str) -> Result<Vec<u8>, PipelineError> {
        let archives = self
            .archives
            .read()
            .map_err(|e| PipelineError::SourceFetch(e.to_string()))?;
        archives
            .get(commit)
            .cloned()
            .ok_or_else(|| PipelineError::SourceFetch(format!("commit '{}' not found", commit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn key() -> ArtifactKey {
        ArtifactKey::new("agent", "Build", Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_put_then_get_returns_bytes() {
        let store = InMemoryArtifactStore::new();
        let key = key();

        let v1 = store.put(&key, b"first").await.unwrap();
        assert_eq!(v1, ArtifactVersion::FIRST);
        assert_eq!(store.get(&key, None).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_prior_versions_survive_later_puts() {
        let store = InMemoryArtifactStore::new();
        let key = key();

        let v1 = store.put(&key, b"first").await.unwrap();
        let v2 = store.put(&key, b"second").await.unwrap();
        assert!(v2 > v1);

        assert_eq!(store.get(&key, Some(v1)).await.unwrap(), b"first");
        assert_eq!(store.get(&key, Some(v2)).await.unwrap(), b"second");
        assert_eq!(store.get(&key, None).await.unwrap(), b"second");
        assert_eq!(store.list_versions(&key).await.unwrap(), vec![v1, v2]);
    }

    #[tokio::test]
    async fn test_missing_key_and_version() {
        let store = InMemoryArtifactStore::new();
        let key = key();

        assert!(store.get(&key, None).await.unwrap_err().is_not_found());
        assert!(store.list_versions(&key).await.unwrap().is_empty());

        store.put(&key, b"x").await.unwrap();
        assert!(
            store
                .get(&key, Some(ArtifactVersion(7)))
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            store
                .get(&key, Some(ArtifactVersion(0)))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_concurrent_puts_get_distinct_versions() {
        let store = Arc::new(InMemoryArtifactStore::new());
        let key = key();

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { store.put(&key, &[i]).await.unwrap() }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort();
        versions.dedup();
        assert_eq!(versions.len(), 16);
    }

    #[tokio::test]
    async fn test_log_sink_keeps_streams_apart() {
        let sink = InMemoryLogSink::new();
        let run = Uuid::new_v4();
        let build = LogKey::new(run, "Build");
        let source = LogKey::new(run, "Source");

        sink.append(&build, vec![LogEntry::info("one"), LogEntry::info("two")])
            .await
            .unwrap();
        sink.append(&source, vec![LogEntry::info("pulled")]).await.unwrap();

        let entries = sink.read(&build).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message, "two");
        assert!(sink.read(&LogKey::new(run, "Other")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_source_provider() {
        let source = StaticSourceProvider::new();
        source.push("main", "abc123", b"tar".to_vec());

        assert_eq!(source.branch_head("main").await.unwrap(), "abc123");
        assert_eq!(source.fetch_archive("abc123").await.unwrap(), b"tar");
        assert!(matches!(
            source.branch_head("dev").await,
            Err(PipelineError::SourceFetch(_))
        ));
    }
}
