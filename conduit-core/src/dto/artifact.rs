//! Artifact DTOs

use serde::{Deserialize, Serialize};

use crate::domain::artifact::{ArtifactKey, ArtifactVersion};

/// Versions stored under one key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactVersions {
    pub key: ArtifactKey,
    pub versions: Vec<ArtifactVersion>,
}
