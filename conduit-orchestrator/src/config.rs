//! Orchestrator configuration
//!
//! Everything is read from environment variables once at startup.

use anyhow::{Context, Result};
use conduit_core::domain::provisioning::ProvisioningParams;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where build environments come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorBackend {
    Podman,
    Local,
}

impl FromStr for ExecutorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "podman" => Ok(ExecutorBackend::Podman),
            "local" => Ok(ExecutorBackend::Local),
            other => anyhow::bail!("unknown executor backend '{}' (expected podman or local)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address
    pub bind_addr: String,

    /// Postgres URL; runs and logs stay in memory when unset
    pub database_url: Option<String>,

    /// Path of the Lua pipeline definition
    pub pipeline_definition: PathBuf,

    /// Values exposed to the definition through `params`
    pub params: ProvisioningParams,

    /// URL (or path) of the git repository to mirror
    pub repository_url: Option<String>,

    /// Root directory of the encrypted artifact store; memory store when unset
    pub artifact_root: Option<PathBuf>,

    /// Base64 AES-256 key for the artifact store
    pub artifact_key: Option<String>,

    /// Parent directory of per-build workspaces
    pub workspace_base: PathBuf,

    /// Directory holding the bare source mirror
    pub source_cache: PathBuf,

    /// Branch polling interval; zero disables polling
    pub poll_interval: Duration,

    /// Limit on a single build stage
    pub build_timeout: Option<Duration>,

    /// Base URL used for run console links
    pub console_url: String,

    pub executor_backend: ExecutorBackend,
}

impl Default for Config {
    fn default() -> Self {
        let work_root = std::env::temp_dir().join("conduit");
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            pipeline_definition: PathBuf::from("pipeline.lua"),
            params: ProvisioningParams::default(),
            repository_url: None,
            artifact_root: None,
            artifact_key: None,
            workspace_base: work_root.join("workspaces"),
            source_cache: work_root.join("sources"),
            poll_interval: Duration::from_secs(60),
            build_timeout: None,
            console_url: "http://localhost:8080".to_string(),
            executor_backend: ExecutorBackend::Podman,
        }
    }
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - ORCHESTRATOR_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - DATABASE_URL (optional)
    /// - PIPELINE_DEFINITION (optional, default: pipeline.lua)
    /// - REPOSITORY_NAME, BRANCH_NAME, EXECUTOR_IMAGE (optional definition params)
    /// - REPOSITORY_URL (required)
    /// - ARTIFACT_ROOT, ARTIFACT_KEY (optional, both or neither)
    /// - WORKSPACE_BASE, SOURCE_CACHE (optional directories)
    /// - POLL_INTERVAL (optional, seconds, default: 60, 0 disables)
    /// - BUILD_TIMEOUT_SECS (optional, no limit when unset)
    /// - CONSOLE_URL (optional, default: http://localhost:8080)
    /// - EXECUTOR_BACKEND (optional, podman or local, default: podman)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let mut params = ProvisioningParams::default();
        for (var, key) in [
            ("REPOSITORY_NAME", "repository_name"),
            ("BRANCH_NAME", "branch_name"),
            ("EXECUTOR_IMAGE", "executor_image"),
        ] {
            if let Some(value) = env_opt(var) {
                params.set(key, value)?;
            }
        }

        let poll_interval = std::env::var("POLL_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        let build_timeout = match env_opt("BUILD_TIMEOUT_SECS") {
            Some(value) => Some(Duration::from_secs(
                value
                    .parse::<u64>()
                    .with_context(|| format!("BUILD_TIMEOUT_SECS '{}' is not a number", value))?,
            )),
            None => None,
        };

        let executor_backend = match env_opt("EXECUTOR_BACKEND") {
            Some(value) => value.parse()?,
            None => defaults.executor_backend,
        };

        Ok(Self {
            bind_addr: env_opt("ORCHESTRATOR_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: env_opt("DATABASE_URL"),
            pipeline_definition: env_opt("PIPELINE_DEFINITION")
                .map(PathBuf::from)
                .unwrap_or(defaults.pipeline_definition),
            params,
            repository_url: env_opt("REPOSITORY_URL"),
            artifact_root: env_opt("ARTIFACT_ROOT").map(PathBuf::from),
            artifact_key: env_opt("ARTIFACT_KEY"),
            workspace_base: env_opt("WORKSPACE_BASE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_base),
            source_cache: env_opt("SOURCE_CACHE")
                .map(PathBuf::from)
                .unwrap_or(defaults.source_cache),
            poll_interval,
            build_timeout,
            console_url: env_opt("CONSOLE_URL").unwrap_or(defaults.console_url),
            executor_backend,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.trim().is_empty() {
            anyhow::bail!("bind address cannot be empty");
        }

        if self.repository_url.is_none() {
            anyhow::bail!("REPOSITORY_URL must be set");
        }

        match (&self.artifact_root, &self.artifact_key) {
            (Some(_), None) => anyhow::bail!("ARTIFACT_KEY is required when ARTIFACT_ROOT is set"),
            (None, Some(_)) => anyhow::bail!("ARTIFACT_KEY is set but ARTIFACT_ROOT is not"),
            _ => {}
        }

        if self.build_timeout.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("BUILD_TIMEOUT_SECS must be greater than 0");
        }

        if !self.console_url.starts_with("http://") && !self.console_url.starts_with("https://") {
            anyhow::bail!("CONSOLE_URL must be an http(s) URL");
        }

        Ok(())
    }

    /// Console base URL without a trailing slash
    pub fn console_base(&self) -> &str {
        self.console_url.trim_end_matches('/')
    }
}

fn env_opt(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            repository_url: Some("/srv/git/agent.git".to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.executor_backend, ExecutorBackend::Podman);
        assert_eq!(config.params.branch_name, "main");
        assert!(config.build_timeout.is_none());
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());
        assert!(Config::default().validate().is_err());

        let mut config = valid();
        config.artifact_root = Some(PathBuf::from("/var/lib/conduit"));
        assert!(config.validate().is_err());
        config.artifact_key = Some("a2V5".to_string());
        assert!(config.validate().is_ok());

        let mut config = valid();
        config.build_timeout = Some(Duration::ZERO);
        assert!(config.validate().is_err());

        let mut config = valid();
        config.console_url = "console.local".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("podman".parse::<ExecutorBackend>().unwrap(), ExecutorBackend::Podman);
        assert_eq!("LOCAL".parse::<ExecutorBackend>().unwrap(), ExecutorBackend::Local);
        assert!("docker".parse::<ExecutorBackend>().is_err());
    }

    #[test]
    fn test_console_base_trims_slash() {
        let mut config = valid();
        config.console_url = "https://ci.example.com/".to_string();
        assert_eq!(config.console_base(), "https://ci.example.com");
    }
}
