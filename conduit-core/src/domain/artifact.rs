//! Artifact domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one stage's bundle within one run
///
/// Every version written under a key belongs to that run and stage only, so
/// concurrent runs never share a version sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub pipeline: String,
    pub stage: String,
    pub run_id: Uuid,
}

impl ArtifactKey {
    pub fn new(pipeline: impl Into<String>, stage: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            pipeline: pipeline.into(),
            stage: stage.into(),
            run_id,
        }
    }

    /// Relative storage path: `<pipeline>/<stage>/<run_id>`
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.pipeline, self.stage, self.run_id)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Monotonic version number, starting at 1 for each key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactVersion(pub u64);

impl ArtifactVersion {
    pub const FIRST: ArtifactVersion = ArtifactVersion(1);

    pub fn next(self) -> Self {
        ArtifactVersion(self.0 + 1)
    }
}

impl fmt::Display for ArtifactVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Reference to a stored bundle, recorded on the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: ArtifactKey,
    /// Artifact name from the stage definition (e.g. `SourceCode`)
    pub name: String,
    pub version: ArtifactVersion,
    pub size: u64,
    /// Hex sha256 of the plaintext bundle
    pub digest: String,
}
