//! Access control domain types
//!
//! Every side effect in the pipeline is checked against a [`Role`]. A role is a
//! name plus a closed list of grants fixed when the role is built; there is no
//! API to add or remove grants afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// The closed set of actions a role may be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "object:read")]
    ObjectRead,
    #[serde(rename = "object:write")]
    ObjectWrite,
    #[serde(rename = "log:write")]
    LogWrite,
    #[serde(rename = "source:pull")]
    SourcePull,
    #[serde(rename = "build:invoke")]
    BuildInvoke,
    #[serde(rename = "pipeline:manage")]
    PipelineManage,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::ObjectRead,
        Action::ObjectWrite,
        Action::LogWrite,
        Action::SourcePull,
        Action::BuildInvoke,
        Action::PipelineManage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ObjectRead => "object:read",
            Action::ObjectWrite => "object:write",
            Action::LogWrite => "log:write",
            Action::SourcePull => "source:pull",
            Action::BuildInvoke => "build:invoke",
            Action::PipelineManage => "pipeline:manage",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| PipelineError::InvalidDefinition(format!("unknown action '{}'", s)))
    }
}

/// Resource selector used by a grant
///
/// A trailing `*` turns the pattern into a prefix match; anything else must
/// match the resource string exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourcePattern {
    Exact(String),
    Prefix(String),
}

impl ResourcePattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => ResourcePattern::Prefix(prefix.to_string()),
            None => ResourcePattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, resource: &str) -> bool {
        match self {
            ResourcePattern::Exact(exact) => exact == resource,
            ResourcePattern::Prefix(prefix) => resource.starts_with(prefix.as_str()),
        }
    }

    /// The literal part of the pattern (without the wildcard)
    pub fn literal(&self) -> &str {
        match self {
            ResourcePattern::Exact(s) | ResourcePattern::Prefix(s) => s,
        }
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourcePattern::Exact(exact) => write!(f, "{}", exact),
            ResourcePattern::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

impl From<String> for ResourcePattern {
    fn from(s: String) -> Self {
        ResourcePattern::parse(&s)
    }
}

impl From<ResourcePattern> for String {
    fn from(pattern: ResourcePattern) -> Self {
        pattern.to_string()
    }
}

/// A single allowed action over a resource selector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub action: Action,
    pub resource: ResourcePattern,
}

impl Grant {
    pub fn new(action: Action, resource: &str) -> Self {
        Self {
            action,
            resource: ResourcePattern::parse(resource),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    Orchestrator,
    Executor,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleKind::Orchestrator => write!(f, "Orchestrator"),
            RoleKind::Executor => write!(f, "Executor"),
        }
    }
}

/// A named identity with an immutable capability set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    name: String,
    kind: RoleKind,
    grants: Vec<Grant>,
}

impl Role {
    pub fn new(name: impl Into<String>, kind: RoleKind, grants: Vec<Grant>) -> Self {
        Self {
            name: name.into(),
            kind,
            grants,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RoleKind {
        self.kind
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    fn holds(&self, action: Action) -> bool {
        self.grants.iter().any(|grant| grant.action == action)
    }
}

/// Checks whether `role` may perform `action` on `resource`
///
/// Pure function of its arguments: no I/O, no caching, no clock.
pub fn authorize(role: &Role, action: Action, resource: &str) -> bool {
    role.grants
        .iter()
        .any(|grant| grant.action == action && grant.resource.matches(resource))
}

/// Same as [`authorize`] but turns a denial into a fatal error
pub fn require(role: &Role, action: Action, resource: &str) -> Result<(), PipelineError> {
    if authorize(role, action, resource) {
        Ok(())
    } else {
        Err(PipelineError::Authorization {
            role: role.name.clone(),
            action,
            resource: resource.to_string(),
        })
    }
}

/// Resource naming scheme shared by every component
pub mod resource {
    use uuid::Uuid;

    pub fn artifact(store: &str, pipeline: &str, stage: &str, run_id: Uuid) -> String {
        format!("artifact:{}/{}/{}/{}", store, pipeline, stage, run_id)
    }

    /// Every run's artifact for one stage
    pub fn artifact_scope(store: &str, pipeline: &str, stage: &str) -> String {
        format!("artifact:{}/{}/{}/*", store, pipeline, stage)
    }

    /// Every artifact in the store
    pub fn store_scope(store: &str) -> String {
        format!("artifact:{}/*", store)
    }

    pub fn logs(pipeline: &str, stage: &str) -> String {
        format!("logs:{}/{}", pipeline, stage)
    }

    pub fn logs_scope(pipeline: &str) -> String {
        format!("logs:{}/*", pipeline)
    }

    pub fn source(repository: &str) -> String {
        format!("source:{}", repository)
    }

    pub fn build(pipeline: &str, stage: &str) -> String {
        format!("build:{}/{}", pipeline, stage)
    }

    pub fn pipeline(pipeline: &str) -> String {
        format!("pipeline:{}", pipeline)
    }
}

/// The process-wide set of roles for one pipeline
///
/// Built once from the provisioning definition and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
    orchestrator: Role,
    /// Executor role per build stage name
    executors: BTreeMap<String, Role>,
}

impl AccessPolicy {
    pub fn new(orchestrator: Role, executors: BTreeMap<String, Role>) -> Self {
        Self {
            orchestrator,
            executors,
        }
    }

    /// Derives the least-privilege roles for a pipeline
    ///
    /// # Arguments
    /// * `store` - Artifact store name
    /// * `pipeline` - Pipeline name
    /// * `repository` - Source repository name
    /// * `build_stages` - `(stage, input_stage)` pairs for every build stage
    pub fn standard(
        store: &str,
        pipeline: &str,
        repository: &str,
        build_stages: &[(String, String)],
    ) -> Self {
        let mut orchestrator_grants = vec![
            Grant::new(Action::ObjectRead, &resource::store_scope(store)),
            Grant::new(Action::ObjectWrite, &resource::store_scope(store)),
            Grant::new(Action::LogWrite, &resource::logs_scope(pipeline)),
            Grant::new(Action::SourcePull, &resource::source(repository)),
            Grant::new(Action::PipelineManage, &resource::pipeline(pipeline)),
        ];

        let mut executors = BTreeMap::new();
        for (stage, input_stage) in build_stages {
            orchestrator_grants.push(Grant::new(
                Action::BuildInvoke,
                &resource::build(pipeline, stage),
            ));

            let grants = vec![
                Grant::new(Action::SourcePull, &resource::source(repository)),
                Grant::new(Action::LogWrite, &resource::logs(pipeline, stage)),
                Grant::new(
                    Action::ObjectRead,
                    &resource::artifact_scope(store, pipeline, input_stage),
                ),
                Grant::new(
                    Action::ObjectRead,
                    &resource::artifact_scope(store, pipeline, stage),
                ),
                Grant::new(
                    Action::ObjectWrite,
                    &resource::artifact_scope(store, pipeline, stage),
                ),
            ];
            executors.insert(
                stage.clone(),
                Role::new(
                    format!("{}-{}-executor", pipeline, stage.to_lowercase()),
                    RoleKind::Executor,
                    grants,
                ),
            );
        }

        let orchestrator = Role::new(
            format!("{}-orchestrator", pipeline),
            RoleKind::Orchestrator,
            orchestrator_grants,
        );

        Self {
            orchestrator,
            executors,
        }
    }

    pub fn orchestrator(&self) -> &Role {
        &self.orchestrator
    }

    pub fn executor(&self, stage: &str) -> Option<&Role> {
        self.executors.get(stage)
    }

    pub fn executors(&self) -> impl Iterator<Item = (&String, &Role)> {
        self.executors.iter()
    }

    /// Enforces least privilege
    ///
    /// - the orchestrator role must be of kind `Orchestrator`
    /// - executor roles must be of kind `Executor` and may not invoke builds or
    ///   manage the pipeline
    /// - an executor may write only its own stage's artifacts and read only
    ///   its own or its input stage's artifacts
    ///
    /// # Arguments
    /// * `store` - Artifact store name
    /// * `pipeline` - Pipeline name
    /// * `build_stages` - `(stage, input_stage)` pairs for every build stage
    pub fn validate(
        &self,
        store: &str,
        pipeline: &str,
        build_stages: &[(String, String)],
    ) -> Result<(), PipelineError> {
        if self.orchestrator.kind != RoleKind::Orchestrator {
            return Err(PipelineError::InvalidDefinition(format!(
                "role '{}' is used as orchestrator but has kind {}",
                self.orchestrator.name, self.orchestrator.kind
            )));
        }

        for (stage, role) in &self.executors {
            if role.kind != RoleKind::Executor {
                return Err(PipelineError::InvalidDefinition(format!(
                    "role '{}' for stage '{}' must have kind Executor",
                    role.name, stage
                )));
            }

            for forbidden in [Action::BuildInvoke, Action::PipelineManage] {
                if role.holds(forbidden) {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "executor role '{}' may not hold '{}'",
                        role.name, forbidden
                    )));
                }
            }

            let own_scope = stage_prefix(store, pipeline, stage);
            let input_scope = build_stages
                .iter()
                .find(|(build, _)| build == stage)
                .map(|(_, input)| stage_prefix(store, pipeline, input));

            for grant in &role.grants {
                let literal = grant.resource.literal();
                let allowed = match grant.action {
                    Action::ObjectWrite => literal.starts_with(&own_scope),
                    Action::ObjectRead => {
                        literal.starts_with(&own_scope)
                            || input_scope
                                .as_deref()
                                .is_some_and(|scope| literal.starts_with(scope))
                    }
                    _ => true,
                };
                if !allowed {
                    return Err(PipelineError::InvalidDefinition(format!(
                        "executor role '{}' grants {} outside the artifacts of stage '{}': {}",
                        role.name, grant.action, stage, grant.resource
                    )));
                }
            }
        }

        Ok(())
    }
}

/// `artifact:<store>/<pipeline>/<stage>/`, the literal every artifact of one
/// stage starts with
fn stage_prefix(store: &str, pipeline: &str, stage: &str) -> String {
    format!("artifact:{}/{}/{}/", store, pipeline, stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn build_inputs() -> Vec<(String, String)> {
        vec![("Build".to_string(), "Source".to_string())]
    }

    fn policy() -> AccessPolicy {
        AccessPolicy::standard("artifacts", "agent", "agent-repo", &build_inputs())
    }

    fn with_build_executor(grants: Vec<Grant>) -> AccessPolicy {
        let orchestrator = policy().orchestrator().clone();
        let mut executors = BTreeMap::new();
        executors.insert(
            "Build".to_string(),
            Role::new("custom", RoleKind::Executor, grants),
        );
        AccessPolicy::new(orchestrator, executors)
    }

    #[test]
    fn test_prefix_and_exact_patterns() {
        let prefix = ResourcePattern::parse("artifact:bucket/*");
        assert!(prefix.matches("artifact:bucket/a/b"));
        assert!(!prefix.matches("artifact:other/a"));

        let exact = ResourcePattern::parse("source:repo");
        assert!(exact.matches("source:repo"));
        assert!(!exact.matches("source:repo2"));
    }

    #[test]
    fn test_pattern_serializes_as_string() {
        let grant = Grant::new(Action::ObjectRead, "artifact:bucket/*");
        let json = serde_json::to_value(&grant).unwrap();
        assert_eq!(json["action"], "object:read");
        assert_eq!(json["resource"], "artifact:bucket/*");

        let back: Grant = serde_json::from_value(json).unwrap();
        assert_eq!(back, grant);
    }

    #[test]
    fn test_action_from_str() {
        assert_eq!("log:write".parse::<Action>().unwrap(), Action::LogWrite);
        assert!("s3:*".parse::<Action>().is_err());
    }

    #[test]
    fn test_orchestrator_capabilities() {
        let policy = policy();
        let role = policy.orchestrator();
        let run = Uuid::new_v4();

        assert!(authorize(
            role,
            Action::ObjectWrite,
            &resource::artifact("artifacts", "agent", "Source", run)
        ));
        assert!(authorize(
            role,
            Action::BuildInvoke,
            &resource::build("agent", "Build")
        ));
        assert!(authorize(
            role,
            Action::PipelineManage,
            &resource::pipeline("agent")
        ));
        assert!(!authorize(
            role,
            Action::PipelineManage,
            &resource::pipeline("other")
        ));
    }

    #[test]
    fn test_executor_scoped_to_its_stage() {
        let policy = policy();
        let role = policy.executor("Build").unwrap();
        let run = Uuid::new_v4();

        assert!(authorize(
            role,
            Action::ObjectRead,
            &resource::artifact("artifacts", "agent", "Source", run)
        ));
        assert!(!authorize(
            role,
            Action::ObjectWrite,
            &resource::artifact("artifacts", "agent", "Source", run)
        ));
        assert!(authorize(
            role,
            Action::ObjectWrite,
            &resource::artifact("artifacts", "agent", "Build", run)
        ));
        assert!(authorize(role, Action::LogWrite, &resource::logs("agent", "Build")));
        assert!(!authorize(role, Action::LogWrite, &resource::logs("agent", "Source")));
    }

    #[test]
    fn test_denials_are_deterministic() {
        let policy = policy();
        let role = policy.executor("Build").unwrap();
        let target = resource::build("agent", "Build");

        for _ in 0..100 {
            assert!(!authorize(role, Action::BuildInvoke, &target));
            assert!(!authorize(role, Action::PipelineManage, &resource::pipeline("agent")));
        }
    }

    #[test]
    fn test_require_reports_denial() {
        let policy = policy();
        let role = policy.executor("Build").unwrap();

        let err = require(role, Action::BuildInvoke, "build:agent/Build").unwrap_err();
        match err {
            PipelineError::Authorization {
                action, resource, ..
            } => {
                assert_eq!(action, Action::BuildInvoke);
                assert_eq!(resource, "build:agent/Build");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_standard_policy_is_valid() {
        assert!(policy().validate("artifacts", "agent", &build_inputs()).is_ok());
    }

    #[test]
    fn test_executor_cannot_invoke_builds() {
        let orchestrator = policy().orchestrator().clone();
        let mut executors = BTreeMap::new();
        executors.insert(
            "Build".to_string(),
            Role::new(
                "escalated",
                RoleKind::Executor,
                vec![Grant::new(Action::BuildInvoke, "build:agent/*")],
            ),
        );

        let policy = AccessPolicy::new(orchestrator, executors);
        let err = policy
            .validate("artifacts", "agent", &build_inputs())
            .unwrap_err();
        assert!(err.to_string().contains("build:invoke"));
    }

    #[test]
    fn test_executor_grants_stay_in_store() {
        let orchestrator = policy().orchestrator().clone();
        let mut executors = BTreeMap::new();
        executors.insert(
            "Build".to_string(),
            Role::new(
                "wide",
                RoleKind::Executor,
                vec![Grant::new(Action::ObjectRead, "artifact:*")],
            ),
        );

        let policy = AccessPolicy::new(orchestrator, executors);
        assert!(policy.validate("artifacts", "agent", &build_inputs()).is_err());
    }

    #[test]
    fn test_executor_object_grants_stay_in_stage_scopes() {
        let validate = |grants| {
            with_build_executor(grants).validate("artifacts", "agent", &build_inputs())
        };

        // Own stage and input stage
        assert!(
            validate(vec![
                Grant::new(Action::ObjectRead, "artifact:artifacts/agent/Source/*"),
                Grant::new(Action::ObjectRead, "artifact:artifacts/agent/Build/*"),
                Grant::new(Action::ObjectWrite, "artifact:artifacts/agent/Build/*"),
            ])
            .is_ok()
        );

        // Whole store
        assert!(validate(vec![Grant::new(Action::ObjectWrite, "artifact:artifacts/*")]).is_err());
        // Another pipeline in the same store
        assert!(
            validate(vec![Grant::new(Action::ObjectRead, "artifact:artifacts/other/*")]).is_err()
        );
        // Overwriting the input stage
        let err = validate(vec![Grant::new(
            Action::ObjectWrite,
            "artifact:artifacts/agent/Source/*",
        )])
        .unwrap_err();
        assert!(err.to_string().contains("object:write"));
        // A stage whose name extends the own stage's name
        assert!(
            validate(vec![Grant::new(Action::ObjectWrite, "artifact:artifacts/agent/Build2/*")])
                .is_err()
        );
    }
}
