//! Invocation of the external agent program
//!
//! The agent is an opaque executable. Conduit only knows how to call it:
//! `<program> --config <file> --task <name> --params <json>`. The agent writes
//! its results under an output directory that the build spec's artifact
//! manifest then collects.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Directory the agent writes results into unless told otherwise
pub const DEFAULT_OUTPUT_DIR: &str = "output";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    /// Program (and any leading arguments), e.g. `python3 strand_agent.py`
    pub program: String,
    pub config: Option<String>,
    pub task: Option<String>,
    #[serde(default)]
    pub params: Option<JsonValue>,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_output_dir() -> String {
    DEFAULT_OUTPUT_DIR.to_string()
}

impl AgentInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            config: None,
            task: None,
            params: None,
            output_dir: default_output_dir(),
        }
    }

    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = Some(params);
        self
    }

    /// Renders the shell command line for a build phase
    ///
    /// The program string is used verbatim; every argument value is quoted.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.trim().to_string()];

        if let Some(config) = &self.config {
            parts.push("--config".to_string());
            parts.push(shell_quote(config));
        }
        if let Some(task) = &self.task {
            parts.push("--task".to_string());
            parts.push(shell_quote(task));
        }
        if let Some(params) = &self.params {
            parts.push("--params".to_string());
            parts.push(shell_quote(&params.to_string()));
        }

        parts.join(" ")
    }

    /// Path of the result file the agent writes for its task
    pub fn result_path(&self) -> Option<String> {
        self.task
            .as_ref()
            .map(|task| format!("{}/{}_result.json", self.output_dir, task))
    }
}

/// Quotes a value for POSIX `sh`
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ','));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
