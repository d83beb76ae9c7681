//! In-memory run repository

use async_trait::async_trait;
use conduit_core::domain::run::PipelineRun;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{RepositoryError, RunRepository};

#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save(&self, run: &PipelineRun) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().map_err(|_| RepositoryError::Poisoned)?;
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<PipelineRun>, RepositoryError> {
        let runs = self.runs.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(runs.get(&id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<PipelineRun>, RepositoryError> {
        let runs = self.runs.read().map_err(|_| RepositoryError::Poisoned)?;
        let mut all: Vec<PipelineRun> = runs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn list_unfinished(&self) -> Result<Vec<PipelineRun>, RepositoryError> {
        let runs = self.runs.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(runs
            .values()
            .filter(|run| !run.state.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::pipeline::{
        BuildConfig, BuildSpecSource, PipelineDefinition, SourceConfig, StageDefinition,
        StageExecutor,
    };
    use conduit_core::domain::run::{RunState, Trigger};

    fn definition() -> PipelineDefinition {
        PipelineDefinition {
            name: "agent-pipeline".to_string(),
            description: None,
            artifact_store: "agent-artifacts".to_string(),
            stages: vec![
                StageDefinition {
                    name: "Source".to_string(),
                    input: None,
                    output: "SourceCode".to_string(),
                    executor: StageExecutor::Source(SourceConfig {
                        repository: "agent-repo".to_string(),
                        branch: "main".to_string(),
                    }),
                },
                StageDefinition {
                    name: "Build".to_string(),
                    input: Some("SourceCode".to_string()),
                    output: "BuildOutput".to_string(),
                    executor: StageExecutor::Build(BuildConfig {
                        project: "agent-build".to_string(),
                        image: "amazonlinux:2023".to_string(),
                        buildspec: BuildSpecSource::default(),
                    }),
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_save_replaces_run() {
        let repo = InMemoryRunRepository::new();
        let mut run = PipelineRun::new(&definition(), Trigger::manual("main"));
        repo.save(&run).await.unwrap();

        run.transition(RunState::Failed).unwrap();
        repo.save(&run).await.unwrap();

        let stored = repo.find(run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Failed);
        assert!(repo.list_unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let repo = InMemoryRunRepository::new();
        let def = definition();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = PipelineRun::new(&def, Trigger::manual("main"));
            ids.push(run.id);
            repo.save(&run).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let listed: Vec<Uuid> = repo.list(2).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![ids[2], ids[1]]);
        assert_eq!(repo.list_unfinished().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_find_unknown() {
        let repo = InMemoryRunRepository::new();
        assert!(repo.find(Uuid::new_v4()).await.unwrap().is_none());
    }
}
