//! Provisioning definition parser
//!
//! Evaluates a `pipeline.lua` file in the sandbox and extracts a typed
//! [`ProvisioningDefinition`]. Validation runs before anything is returned,
//! so callers never see a half-checked definition.
//!
//! ```lua
//! return pipeline.define {
//!     name = "agent-pipeline",
//!     artifact_store = "agent-artifacts",
//!     stages = {
//!         pipeline.source { name = "Source", output = "SourceCode" },
//!         pipeline.build {
//!             name = "Build",
//!             input = "SourceCode",
//!             output = "BuildOutput",
//!             project = "agent-build",
//!             buildspec = "buildspec.yml",
//!         },
//!     },
//! }
//! ```

use anyhow::{Context, Result};
use conduit_core::domain::access::{AccessPolicy, Action, Grant, Role, RoleKind};
use conduit_core::domain::build::{ArtifactManifest, BuildEnv, BuildSpec, PhaseCommands, Phases};
use conduit_core::domain::pipeline::{
    BuildConfig, BuildSpecSource, PipelineDefinition, SourceConfig, StageDefinition,
    StageExecutor,
};
use conduit_core::domain::provisioning::{ProvisioningDefinition, ProvisioningParams};
use mlua::{Table, Value};
use std::collections::BTreeMap;
use std::path::Path;

use crate::sandbox::create_sandbox;

/// Parse a provisioning definition from Lua source code
///
/// # Errors
/// Returns an error if:
/// - The Lua source is invalid or does not return a table
/// - Required fields are missing (name, artifact_store, stages)
/// - Field types are incorrect
/// - The resulting pipeline or role set fails validation
pub fn parse_provisioning_definition(
    source: &str,
    params: &ProvisioningParams,
) -> Result<ProvisioningDefinition> {
    let lua = create_sandbox(params).context("Failed to create Lua sandbox")?;

    let table: Table = lua
        .load(source)
        .set_name("pipeline.lua")
        .eval()
        .context("Failed to evaluate pipeline definition")?;

    let pipeline = parse_pipeline_from_table(&table, params)?;

    let definition = match table.get::<Value>("roles")? {
        Value::Nil => ProvisioningDefinition::with_standard_policy(pipeline)?,
        Value::Table(roles) => {
            let policy = parse_roles_from_table(&roles)?;
            let definition = ProvisioningDefinition { pipeline, policy };
            definition.validate()?;
            definition
        }
        _ => return Err(anyhow::anyhow!("Field 'roles' must be a table")),
    };

    Ok(definition)
}

/// Read and parse a provisioning definition file
pub fn parse_provisioning_file(
    path: impl AsRef<Path>,
    params: &ProvisioningParams,
) -> Result<ProvisioningDefinition> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline definition {}", path.display()))?;
    parse_provisioning_definition(&source, params)
        .with_context(|| format!("Invalid pipeline definition {}", path.display()))
}

fn parse_pipeline_from_table(
    table: &Table,
    params: &ProvisioningParams,
) -> Result<PipelineDefinition> {
    let name: String = table
        .get::<Option<String>>("name")?
        .ok_or_else(|| anyhow::anyhow!("Pipeline must have a 'name' field"))?;
    let description: Option<String> = table.get("description")?;
    let artifact_store: String = table
        .get::<Option<String>>("artifact_store")?
        .ok_or_else(|| anyhow::anyhow!("Pipeline must have an 'artifact_store' field"))?;

    let stages = parse_stages_from_table(table, params)?;

    Ok(PipelineDefinition {
        name,
        description,
        artifact_store,
        stages,
    })
}

fn parse_stages_from_table(
    pipeline: &Table,
    params: &ProvisioningParams,
) -> Result<Vec<StageDefinition>> {
    let stages_table: Table = pipeline
        .get::<Option<Table>>("stages")?
        .ok_or_else(|| anyhow::anyhow!("Pipeline must have a 'stages' field"))?;

    let mut stages = Vec::new();
    for pair in stages_table.sequence_values::<Table>() {
        let stage_table = pair.context("Failed to read stage entry")?;
        stages.push(parse_stage(&stage_table, params)?);
    }

    if stages.is_empty() {
        return Err(anyhow::anyhow!("Pipeline must have at least one stage"));
    }

    Ok(stages)
}

fn parse_stage(stage: &Table, params: &ProvisioningParams) -> Result<StageDefinition> {
    let name: String = stage
        .get::<Option<String>>("name")?
        .ok_or_else(|| anyhow::anyhow!("Stage must have a 'name' field"))?;
    let kind: String = stage.get::<Option<String>>("type")?.ok_or_else(|| {
        anyhow::anyhow!(
            "Stage '{}' must be declared with pipeline.source or pipeline.build",
            name
        )
    })?;
    let input: Option<String> = stage.get("input")?;
    let output: String = stage
        .get::<Option<String>>("output")?
        .ok_or_else(|| anyhow::anyhow!("Stage '{}' must have an 'output' field", name))?;

    let executor = match kind.as_str() {
        "source" => StageExecutor::Source(SourceConfig {
            repository: stage
                .get::<Option<String>>("repository")?
                .unwrap_or_else(|| params.repository_name.clone()),
            branch: stage
                .get::<Option<String>>("branch")?
                .unwrap_or_else(|| params.branch_name.clone()),
        }),
        "build" => {
            let project = stage
                .get::<Option<String>>("project")?
                .unwrap_or_else(|| name.to_lowercase());
            let image = stage
                .get::<Option<String>>("image")?
                .unwrap_or_else(|| params.executor_image.clone());
            let buildspec = match stage.get::<Value>("buildspec")? {
                Value::Nil => BuildSpecSource::default(),
                Value::String(path) => BuildSpecSource::File(path.to_str()?.to_string()),
                Value::Table(spec) => BuildSpecSource::Inline(
                    parse_buildspec_table(&spec)
                        .with_context(|| format!("Stage '{}' has an invalid buildspec", name))?,
                ),
                _ => {
                    return Err(anyhow::anyhow!(
                        "Stage '{}': 'buildspec' must be a path or a table",
                        name
                    ));
                }
            };
            StageExecutor::Build(BuildConfig {
                project,
                image,
                buildspec,
            })
        }
        other => {
            return Err(anyhow::anyhow!(
                "Stage '{}' has unknown type '{}'",
                name,
                other
            ));
        }
    };

    Ok(StageDefinition {
        name,
        input,
        output,
        executor,
    })
}

/// Parse an inline build spec
///
/// Mirrors the YAML layout. A phase may also be given as a bare list of
/// commands: `build = { "make", "make test" }`.
fn parse_buildspec_table(spec: &Table) -> Result<BuildSpec> {
    let mut buildspec = BuildSpec::default();

    match spec.get::<Value>("version")? {
        Value::Nil => {}
        Value::String(s) => buildspec.version = s.to_str()?.to_string(),
        Value::Number(n) => buildspec.version = n.to_string(),
        Value::Integer(i) => buildspec.version = i.to_string(),
        _ => return Err(anyhow::anyhow!("'version' must be a string or number")),
    }

    buildspec.always_run_post_build = spec
        .get::<Option<bool>>("always_run_post_build")?
        .unwrap_or(false);

    if let Some(env) = spec.get::<Option<Table>>("env")? {
        let variables = match env.get::<Option<Table>>("variables")? {
            Some(variables) => string_map(&variables, "env.variables")?,
            None => BTreeMap::new(),
        };
        buildspec.env = BuildEnv { variables };
    }

    if let Some(phases) = spec.get::<Option<Table>>("phases")? {
        buildspec.phases = Phases {
            install: parse_phase(&phases, "install")?,
            pre_build: parse_phase(&phases, "pre_build")?,
            build: parse_phase(&phases, "build")?,
            post_build: parse_phase(&phases, "post_build")?,
        };
    }

    if let Some(artifacts) = spec.get::<Option<Table>>("artifacts")? {
        buildspec.artifacts = ArtifactManifest {
            files: string_list(&artifacts, "files")?,
            discard_paths: artifacts
                .get::<Option<bool>>("discard_paths")?
                .unwrap_or(false),
            base_directory: artifacts.get("base_directory")?,
        };
    }

    buildspec.validate()?;
    Ok(buildspec)
}

fn parse_phase(phases: &Table, phase: &str) -> Result<Option<PhaseCommands>> {
    let table = match phases.get::<Value>(phase)? {
        Value::Nil => return Ok(None),
        Value::Table(table) => table,
        _ => return Err(anyhow::anyhow!("Phase '{}' must be a table", phase)),
    };

    let structured = !table.get::<Value>("commands")?.is_nil()
        || !table.get::<Value>("runtime_versions")?.is_nil();

    if !structured {
        let mut commands = Vec::new();
        for command in table.sequence_values::<String>() {
            commands.push(command.with_context(|| format!("Phase '{}' commands", phase))?);
        }
        return Ok(Some(PhaseCommands {
            runtime_versions: BTreeMap::new(),
            commands,
        }));
    }

    let runtime_versions = match table.get::<Option<Table>>("runtime_versions")? {
        Some(pins) => string_map(&pins, "runtime_versions")?,
        None => BTreeMap::new(),
    };

    Ok(Some(PhaseCommands {
        runtime_versions,
        commands: string_list(&table, "commands")?,
    }))
}

fn string_list(table: &Table, field: &str) -> Result<Vec<String>> {
    match table.get::<Value>(field)? {
        Value::Nil => Ok(Vec::new()),
        Value::Table(list) => {
            let mut values = Vec::new();
            for item in list.sequence_values::<String>() {
                values.push(item.with_context(|| format!("Failed to read '{}' entry", field))?);
            }
            Ok(values)
        }
        _ => Err(anyhow::anyhow!("Field '{}' must be an array of strings", field)),
    }
}

fn string_map(table: &Table, field: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in table.pairs::<String, Value>() {
        let (key, value) = pair.with_context(|| format!("Failed to read '{}'", field))?;
        let value = match value {
            Value::String(s) => s.to_str()?.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            _ => {
                return Err(anyhow::anyhow!(
                    "'{}.{}' must be a string, number or boolean",
                    field,
                    key
                ));
            }
        };
        map.insert(key, value);
    }
    Ok(map)
}

/// Parse explicit role overrides
///
/// ```lua
/// roles = {
///     orchestrator = { name = "ci", grants = { { action = "object:read", resource = "artifact:store/*" } } },
///     executors = { Build = { name = "ci-build", grants = { ... } } },
/// }
/// ```
fn parse_roles_from_table(roles: &Table) -> Result<AccessPolicy> {
    let orchestrator_table: Table = roles
        .get::<Option<Table>>("orchestrator")?
        .ok_or_else(|| anyhow::anyhow!("Field 'roles' must have an 'orchestrator' role"))?;
    let orchestrator = parse_role(&orchestrator_table, RoleKind::Orchestrator)
        .context("Invalid orchestrator role")?;

    let mut executors = BTreeMap::new();
    if let Some(executor_tables) = roles.get::<Option<Table>>("executors")? {
        for pair in executor_tables.pairs::<String, Table>() {
            let (stage, role_table) = pair.context("Failed to read executor role")?;
            let role = parse_role(&role_table, RoleKind::Executor)
                .with_context(|| format!("Invalid executor role for stage '{}'", stage))?;
            executors.insert(stage, role);
        }
    }

    Ok(AccessPolicy::new(orchestrator, executors))
}

fn parse_role(table: &Table, kind: RoleKind) -> Result<Role> {
    let name: String = table
        .get::<Option<String>>("name")?
        .ok_or_else(|| anyhow::anyhow!("Role must have a 'name' field"))?;

    let grants_table: Table = table
        .get::<Option<Table>>("grants")?
        .ok_or_else(|| anyhow::anyhow!("Role '{}' must have a 'grants' field", name))?;

    let mut grants = Vec::new();
    for pair in grants_table.sequence_values::<Table>() {
        let grant = pair.context("Failed to read grant entry")?;
        let action: String = grant
            .get::<Option<String>>("action")?
            .ok_or_else(|| anyhow::anyhow!("Grant must have an 'action' field"))?;
        let resource: String = grant
            .get::<Option<String>>("resource")?
            .ok_or_else(|| anyhow::anyhow!("Grant must have a 'resource' field"))?;
        let action: Action = action.parse()?;
        grants.push(Grant::new(action, &resource));
    }

    Ok(Role::new(name, kind, grants))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::domain::build::Phase;

    const DEFINITION: &str = r#"
        return pipeline.define {
            name = "agent-pipeline",
            description = "Builds and runs the documentation agent",
            artifact_store = "agent-artifacts",
            stages = {
                pipeline.source {
                    name = "Source",
                    output = "SourceCode",
                    repository = params.repository_name,
                    branch = params.branch_name,
                },
                pipeline.build {
                    name = "Build",
                    input = "SourceCode",
                    output = "BuildOutput",
                    project = "agent-build",
                    image = params.executor_image,
                    buildspec = {
                        version = 0.2,
                        env = { variables = { OUTPUT_DIR = "output" } },
                        phases = {
                            install = {
                                runtime_versions = { python = "3.11" },
                                commands = { "pip install -r requirements.txt" },
                            },
                            build = {
                                pipeline.agent {
                                    program = "python3 strand_agent.py",
                                    config = "config.yaml",
                                    task = "search",
                                },
                            },
                        },
                        artifacts = { files = { "output/**/*" }, discard_paths = true },
                    },
                },
            },
        }
    "#;

    #[test]
    fn test_parse_full_definition() {
        let definition =
            parse_provisioning_definition(DEFINITION, &ProvisioningParams::default()).unwrap();
        let pipeline = &definition.pipeline;

        assert_eq!(pipeline.name, "agent-pipeline");
        assert_eq!(pipeline.artifact_store, "agent-artifacts");
        assert_eq!(pipeline.stages.len(), 2);

        let (_, source) = pipeline.source_stage().unwrap();
        assert_eq!(source.repository, "agent-repository");
        assert_eq!(source.branch, "main");

        let (stage, build) = pipeline.build_stages().next().unwrap();
        assert_eq!(stage.input.as_deref(), Some("SourceCode"));
        assert_eq!(build.image, "amazonlinux:2023");

        let BuildSpecSource::Inline(spec) = &build.buildspec else {
            panic!("expected inline buildspec");
        };
        assert_eq!(spec.version, "0.2");
        assert_eq!(spec.runtime_versions()["python"], "3.11");
        assert_eq!(
            spec.phases.commands(Phase::Build),
            ["python3 strand_agent.py --config config.yaml --task search"]
        );
        assert!(spec.artifacts.discard_paths);

        assert!(definition.policy.executor("Build").is_some());
    }

    #[test]
    fn test_params_override_defaults() {
        let mut params = ProvisioningParams::default();
        params.set("branch_name", "release".to_string()).unwrap();
        params.set("executor_image", "ubuntu:24.04".to_string()).unwrap();

        let definition = parse_provisioning_definition(DEFINITION, &params).unwrap();
        let (_, source) = definition.pipeline.source_stage().unwrap();
        assert_eq!(source.branch, "release");
        let (_, build) = definition.pipeline.build_stages().next().unwrap();
        assert_eq!(build.image, "ubuntu:24.04");
    }

    #[test]
    fn test_buildspec_path_and_defaults() {
        let source = r#"
            return {
                name = "p",
                artifact_store = "s",
                stages = {
                    pipeline.source { name = "Source", output = "SourceCode" },
                    pipeline.build { name = "Build", input = "SourceCode", output = "BuildOutput" },
                },
            }
        "#;
        let definition =
            parse_provisioning_definition(source, &ProvisioningParams::default()).unwrap();
        let (_, build) = definition.pipeline.build_stages().next().unwrap();
        assert_eq!(build.project, "build");
        assert_eq!(
            build.buildspec,
            BuildSpecSource::File("buildspec.yml".to_string())
        );
    }

    #[test]
    fn test_missing_name() {
        let source = r#"return { artifact_store = "s", stages = {} }"#;
        let result = parse_provisioning_definition(source, &ProvisioningParams::default());
        assert!(result.unwrap_err().to_string().contains("name"));
    }

    #[test]
    fn test_untyped_stage_rejected() {
        let source = r#"
            return {
                name = "p",
                artifact_store = "s",
                stages = { { name = "Source", output = "SourceCode" } },
            }
        "#;
        let err = parse_provisioning_definition(source, &ProvisioningParams::default())
            .unwrap_err()
            .to_string();
        assert!(err.contains("pipeline.source"));
    }

    #[test]
    fn test_structural_validation_runs() {
        // A build stage first is rejected by definition validation
        let source = r#"
            return {
                name = "p",
                artifact_store = "s",
                stages = {
                    pipeline.build { name = "Build", input = "SourceCode", output = "BuildOutput" },
                    pipeline.source { name = "Source", output = "SourceCode" },
                },
            }
        "#;
        assert!(parse_provisioning_definition(source, &ProvisioningParams::default()).is_err());
    }

    #[test]
    fn test_sandbox_blocks_io() {
        let source = r#"
            local f = io.open("/etc/passwd")
            return { name = "p", artifact_store = "s", stages = {} }
        "#;
        assert!(parse_provisioning_definition(source, &ProvisioningParams::default()).is_err());
    }

    #[test]
    fn test_explicit_roles_are_validated() {
        let source = r#"
            return {
                name = "p",
                artifact_store = "s",
                stages = {
                    pipeline.source { name = "Source", output = "SourceCode" },
                    pipeline.build { name = "Build", input = "SourceCode", output = "BuildOutput" },
                },
                roles = {
                    orchestrator = {
                        name = "p-orchestrator",
                        grants = { { action = "pipeline:manage", resource = "pipeline:p" } },
                    },
                    executors = {
                        Build = {
                            name = "p-build",
                            grants = { { action = "build:invoke", resource = "build:p/*" } },
                        },
                    },
                },
            }
        "#;
        // Executors may never invoke builds
        assert!(parse_provisioning_definition(source, &ProvisioningParams::default()).is_err());
    }

    #[test]
    fn test_explicit_roles_accepted() {
        let source = r#"
            return {
                name = "p",
                artifact_store = "s",
                stages = {
                    pipeline.source { name = "Source", output = "SourceCode" },
                    pipeline.build { name = "Build", input = "SourceCode", output = "BuildOutput" },
                },
                roles = {
                    orchestrator = {
                        name = "ci",
                        grants = { { action = "object:write", resource = "artifact:s/*" } },
                    },
                    executors = {
                        Build = {
                            name = "ci-build",
                            grants = { { action = "object:read", resource = "artifact:s/p/Source/*" } },
                        },
                    },
                },
            }
        "#;
        let definition =
            parse_provisioning_definition(source, &ProvisioningParams::default()).unwrap();
        assert_eq!(definition.policy.orchestrator().name(), "ci");
        assert_eq!(definition.policy.executor("Build").unwrap().name(), "ci-build");
    }
}
