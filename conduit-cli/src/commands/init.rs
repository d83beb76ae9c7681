//! Init command handler
//!
//! Scaffolds a pipeline project: a definition file, a build spec, editor
//! configuration for the Lua definition, and a fresh artifact encryption key.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{KeyInit, OsRng};
use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use colored::*;
use std::fs;
use std::path::Path;

const PIPELINE_LUA: &str = r#"-- Pipeline definition evaluated by the orchestrator at startup.
-- `params` carries REPOSITORY_NAME, BRANCH_NAME and EXECUTOR_IMAGE.
return pipeline.define {
    name = "agent-pipeline",
    description = "Builds and runs the agent on every push",
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
            buildspec = "buildspec.yml",
        },
    },
}
"#;

const BUILDSPEC_YML: &str = r#"version: 0.2
env:
  variables:
    OUTPUT_DIR: output
phases:
  install:
    runtime-versions:
      python: "3.11"
    commands:
      - pip install -r requirements.txt
  pre_build:
    commands:
      - mkdir -p output
  build:
    commands:
      - python3 agent.py --config config.yaml --task summarize --params '{}'
artifacts:
  files:
    - output/**/*
"#;

const LUARC_JSON: &str = r#"{
  "$schema": "https://raw.githubusercontent.com/sumneko/vscode-lua/master/setting/schema.json",
  "runtime": {
    "version": "Lua 5.4"
  },
  "diagnostics": {
    "globals": ["pipeline", "params"]
  }
}
"#;

/// Write the project files into `dir`
pub fn init_project(dir: &Path, force: bool) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let files = [
        ("pipeline.lua", PIPELINE_LUA),
        ("buildspec.yml", BUILDSPEC_YML),
        (".luarc.json", LUARC_JSON),
    ];

    if !force {
        let existing: Vec<&str> = files
            .iter()
            .filter(|(name, _)| dir.join(name).exists())
            .map(|(name, _)| *name)
            .collect();
        if !existing.is_empty() {
            bail!(
                "Refusing to overwrite {} in {} (use --force)",
                existing.join(", "),
                dir.display()
            );
        }
    }

    for (name, content) in files {
        let path = dir.join(name);
        fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("  {} {}", "Created".green(), name);
    }

    println!();
    println!("{}", "✓ Project initialized!".green().bold());
    println!();
    println!("{}", "Artifact encryption key:".bold());
    println!("  ARTIFACT_KEY={}", generate_artifact_key());
    println!();
    println!("{}", "Next steps:".bold());
    println!(
        "  1. Run {} to validate the definition",
        "conduit definition check pipeline.lua".cyan()
    );
    println!("  2. Start the orchestrator with PIPELINE_DEFINITION, REPOSITORY_URL and ARTIFACT_KEY");
    println!("  3. Use {} to start a run", "conduit run trigger".cyan());

    Ok(())
}

/// A random 256-bit key, base64 encoded
fn generate_artifact_key() -> String {
    STANDARD.encode(Aes256Gcm::generate_key(&mut OsRng))
}
