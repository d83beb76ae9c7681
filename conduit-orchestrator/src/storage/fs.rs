//! Filesystem artifact store
//!
//! Layout under the root:
//!
//! ```text
//! <pipeline>/<stage>/<run_id>/v1.enc    sealed bundle
//! <pipeline>/<stage>/<run_id>/v1.json   sidecar metadata
//! ```
//!
//! A version is claimed by hard-linking a fully written temp file to its
//! final name. `link` fails when the name exists, so two writers can never
//! claim the same version and readers never see a partial file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::StoreError;
use conduit_core::domain::artifact::{ArtifactKey, ArtifactVersion};
use conduit_core::store::ArtifactStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::cipher::ArtifactCipher;
use super::sha256_hex;

const DATA_EXT: &str = "enc";
const META_EXT: &str = "json";

/// Sidecar metadata written next to every version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub version: ArtifactVersion,
    /// Plaintext size in bytes
    pub size: u64,
    /// Hex sha256 of the plaintext
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
    cipher: ArtifactCipher,
}

impl FsArtifactStore {
    pub fn open(root: impl Into<PathBuf>, cipher: ArtifactCipher) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, cipher })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads the sidecar metadata of one version
    pub async fn describe(
        &self,
        key: &ArtifactKey,
        version: ArtifactVersion,
    ) -> Result<ArtifactMetadata, StoreError> {
        let store = self.clone();
        let key = key.clone();
        blocking(move || store.read_metadata(&key, version)).await
    }

    fn key_dir(&self, key: &ArtifactKey) -> Result<PathBuf, StoreError> {
        let run_id = key.run_id.to_string();
        let mut dir = self.root.clone();
        for component in [key.pipeline.as_str(), key.stage.as_str(), run_id.as_str()] {
            let invalid = component.is_empty()
                || component.starts_with('.')
                || component.contains(['/', '\\']);
            if invalid {
                return Err(StoreError::Backend(format!("invalid artifact key '{}'", key)));
            }
            dir.push(component);
        }
        Ok(dir)
    }

    fn versions_in(dir: &Path) -> Result<Vec<ArtifactVersion>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            if let Some(version) = parse_data_name(&name.to_string_lossy()) {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    fn put_blocking(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<ArtifactVersion, StoreError> {
        let dir = self.key_dir(key)?;
        fs::create_dir_all(&dir)?;

        let version = loop {
            let candidate = Self::versions_in(&dir)?
                .last()
                .map(|v| v.next())
                .unwrap_or(ArtifactVersion::FIRST);

            let sealed = self.cipher.seal(bytes, &associated_data(key, candidate))?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&sealed)?;
            tmp.as_file().sync_all()?;

            match fs::hard_link(tmp.path(), dir.join(data_name(candidate))) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!("Version {} of {} claimed concurrently, retrying", candidate, key);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let metadata = ArtifactMetadata {
            version,
            size: bytes.len() as u64,
            sha256: sha256_hex(bytes),
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| StoreError::Backend(format!("failed to encode metadata: {}", e)))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.persist(dir.join(meta_name(version)))
            .map_err(|e| StoreError::Io(e.error))?;

        debug!("Stored {} {} ({} bytes)", key, version, bytes.len());
        Ok(version)
    }

    fn get_blocking(
        &self,
        key: &ArtifactKey,
        version: Option<ArtifactVersion>,
    ) -> Result<Vec<u8>, StoreError> {
        let dir = self.key_dir(key)?;
        let version = match version {
            Some(version) => version,
            None => Self::versions_in(&dir)?
                .last()
                .copied()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?,
        };

        let sealed = match fs::read(dir.join(data_name(version))) {
            Ok(sealed) => sealed,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("{}@{}", key, version)));
            }
            Err(e) => return Err(e.into()),
        };
        let plaintext = self.cipher.open(&sealed, &associated_data(key, version))?;

        // The sidecar is written right after the data; a crash in between leaves none
        match self.read_metadata(key, version) {
            Ok(metadata) => {
                if metadata.size != plaintext.len() as u64 || metadata.sha256 != sha256_hex(&plaintext)
                {
                    return Err(StoreError::Corrupt(format!("{}@{}", key, version)));
                }
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        Ok(plaintext)
    }

    fn read_metadata(
        &self,
        key: &ArtifactKey,
        version: ArtifactVersion,
    ) -> Result<ArtifactMetadata, StoreError> {
        let path = self.key_dir(key)?.join(meta_name(version));
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("{}@{} metadata", key, version)));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|_| StoreError::Corrupt(format!("{}@{} metadata", key, version)))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<ArtifactVersion, StoreError> {
        let store = self.clone();
        let key = key.clone();
        let bytes = bytes.to_vec();
        blocking(move || store.put_blocking(&key, &bytes)).await
    }

    async fn get(
        &self,
        key: &ArtifactKey,
        version: Option<ArtifactVersion>,
    ) -> Result<Vec<u8>, StoreError> {
        let store = self.clone();
        let key = key.clone();
        blocking(move || store.get_blocking(&key, version)).await
    }

    async fn list_versions(&self, key: &ArtifactKey) -> Result<Vec<ArtifactVersion>, StoreError> {
        let dir = self.key_dir(key)?;
        blocking(move || Self::versions_in(&dir)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {}", e)))?
}

fn associated_data(key: &ArtifactKey, version: ArtifactVersion) -> Vec<u8> {
    format!("{}@{}", key.path(), version).into_bytes()
}

fn data_name(version: ArtifactVersion) -> String {
    format!("v{}.{}", version.0, DATA_EXT)
}

fn meta_name(version: ArtifactVersion) -> String {
    format!("v{}.{}", version.0, META_EXT)
}

fn parse_data_name(name: &str) -> Option<ArtifactVersion> {
    let number = name.strip_prefix('v')?.strip_suffix(&format!(".{}", DATA_EXT))?;
    number.parse::<u64>().ok().filter(|n| *n > 0).map(ArtifactVersion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn store(root: &Path) -> FsArtifactStore {
        FsArtifactStore::open(root, ArtifactCipher::new(&[7u8; 32]).unwrap()).unwrap()
    }

    fn key() -> ArtifactKey {
        ArtifactKey::new("agent-pipeline", "Build", Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_versions_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = key();

        assert_eq!(store.put(&key, b"first").await.unwrap(), ArtifactVersion(1));
        assert_eq!(store.put(&key, b"second").await.unwrap(), ArtifactVersion(2));

        assert_eq!(store.get(&key, None).await.unwrap(), b"second");
        assert_eq!(store.get(&key, Some(ArtifactVersion(1))).await.unwrap(), b"first");
        assert_eq!(
            store.list_versions(&key).await.unwrap(),
            vec![ArtifactVersion(1), ArtifactVersion(2)]
        );
        assert_eq!(store.latest(&key).await.unwrap(), Some(ArtifactVersion(2)));
    }

    #[tokio::test]
    async fn test_bytes_are_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = key();
        let plaintext = b"super secret build output, readable only through the store";

        let version = store.put(&key, plaintext).await.unwrap();
        let on_disk = fs::read(store.key_dir(&key).unwrap().join(data_name(version))).unwrap();
        assert!(
            !on_disk
                .windows(plaintext.len())
                .any(|window| window == plaintext.as_slice())
        );
    }

    #[tokio::test]
    async fn test_versions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = key();
        store(dir.path()).put(&key, b"durable").await.unwrap();

        let reopened = store(dir.path());
        assert_eq!(reopened.get(&key, None).await.unwrap(), b"durable");
    }

    #[tokio::test]
    async fn test_wrong_key_cannot_read() {
        let dir = tempfile::tempdir().unwrap();
        let key = key();
        store(dir.path()).put(&key, b"bundle").await.unwrap();

        let other = FsArtifactStore::open(dir.path(), ArtifactCipher::new(&[9u8; 32]).unwrap())
            .unwrap();
        assert!(matches!(
            other.get(&key, None).await,
            Err(StoreError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_moved_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = key();
        store.put(&key, b"one").await.unwrap();
        store.put(&key, b"two").await.unwrap();

        // Overwrite v1 with v2's sealed bytes
        let key_dir = store.key_dir(&key).unwrap();
        fs::copy(key_dir.join(data_name(ArtifactVersion(2))), key_dir.join(data_name(ArtifactVersion(1))))
            .unwrap();
        assert!(store.get(&key, Some(ArtifactVersion(1))).await.is_err());
    }

    #[tokio::test]
    async fn test_describe_reports_plaintext_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = key();

        let version = store.put(&key, b"bundle").await.unwrap();
        let metadata = store.describe(&key, version).await.unwrap();
        assert_eq!(metadata.version, version);
        assert_eq!(metadata.size, 6);
        assert_eq!(metadata.sha256, sha256_hex(b"bundle"));
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = key();

        assert!(store.list_versions(&key).await.unwrap().is_empty());
        assert!(matches!(
            store.get(&key, None).await,
            Err(StoreError::NotFound(_))
        ));
        store.put(&key, b"x").await.unwrap();
        assert!(matches!(
            store.get(&key, Some(ArtifactVersion(5))).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_puts_get_distinct_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(dir.path()));
        let key = key();

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { store.put(&key, &[i; 16]).await }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().unwrap());
        }
        versions.sort();

        let expected: Vec<_> = (1..=8).map(ArtifactVersion).collect();
        assert_eq!(versions, expected);
        assert_eq!(store.list_versions(&key).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = ArtifactKey::new("agent-pipeline", "..", Uuid::new_v4());
        assert!(store.put(&key, b"x").await.is_err());
    }

    #[test]
    fn test_parse_data_name() {
        assert_eq!(parse_data_name("v12.enc"), Some(ArtifactVersion(12)));
        assert_eq!(parse_data_name("v12.json"), None);
        assert_eq!(parse_data_name("v0.enc"), None);
        assert_eq!(parse_data_name(".tmpA1b2"), None);
    }
}
