//! Artifact API endpoints

use conduit_core::domain::artifact::ArtifactVersion;
use conduit_core::dto::artifact::ArtifactVersions;
use uuid::Uuid;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// List the stored versions of a stage's bundle
    pub async fn artifact_versions(&self, run_id: Uuid, stage: &str) -> Result<ArtifactVersions> {
        let url = self.url(&format!("/runs/{}/artifacts/{}", run_id, stage));
        let response = self.client.get(&url).send().await?;
        self.handle_response(response).await
    }

    /// Download a bundle as tar bytes; `None` selects the latest version
    pub async fn download_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        version: Option<ArtifactVersion>,
    ) -> Result<Vec<u8>> {
        let url = self.url(&artifact_path(run_id, stage, version));
        let response = self.client.get(&url).send().await?;
        self.handle_bytes(response).await
    }
}

fn artifact_path(run_id: Uuid, stage: &str, version: Option<ArtifactVersion>) -> String {
    let version = version
        .map(|v| v.0.to_string())
        .unwrap_or_else(|| "latest".to_string());
    format!("/runs/{}/artifacts/{}/{}", run_id, stage, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_path() {
        let id = Uuid::nil();
        assert_eq!(
            artifact_path(id, "Build", None),
            format!("/runs/{}/artifacts/Build/latest", id)
        );
        assert_eq!(
            artifact_path(id, "Source", Some(ArtifactVersion(3))),
            format!("/runs/{}/artifacts/Source/3", id)
        );
    }
}
