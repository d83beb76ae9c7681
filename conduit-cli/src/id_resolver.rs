//! Run ID resolution
//!
//! Lets users type a short, unambiguous prefix of a run ID instead of the
//! full UUID. Prefixes are matched against the most recent runs.

use anyhow::{Context, Result, anyhow};
use conduit_client::OrchestratorClient;
use uuid::Uuid;

/// How many recent runs a prefix is matched against
const RESOLVE_WINDOW: usize = 200;

/// Resolve a run ID or prefix to a full UUID
///
/// # Errors
/// Returns an error if no recent run matches the prefix, if several do, or
/// if the run list cannot be fetched.
pub async fn resolve_run_id(client: &OrchestratorClient, input: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(input) {
        return Ok(uuid);
    }

    let runs = client
        .list_runs(Some(RESOLVE_WINDOW))
        .await
        .context("Failed to fetch runs for ID resolution")?;

    match_prefix(runs.iter().map(|r| r.run_id), input)
}

fn match_prefix(ids: impl Iterator<Item = Uuid>, prefix: &str) -> Result<Uuid> {
    let prefix = prefix.to_lowercase();
    if prefix.is_empty() {
        return Err(anyhow!("Run ID must not be empty"));
    }

    let matches: Vec<Uuid> = ids
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No run found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(|id| id.to_string()).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple runs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> Vec<Uuid> {
        [
            "3f2a0c4e-0000-4000-8000-000000000001",
            "3f2b9d10-0000-4000-8000-000000000002",
            "a7c41e22-0000-4000-8000-000000000003",
        ]
        .iter()
        .map(|s| Uuid::parse_str(s).unwrap())
        .collect()
    }

    #[test]
    fn test_unique_prefix_resolves() {
        let id = match_prefix(ids().into_iter(), "A7C").unwrap();
        assert_eq!(id, ids()[2]);
    }

    #[test]
    fn test_ambiguous_prefix_lists_candidates() {
        let err = match_prefix(ids().into_iter(), "3f2").unwrap_err();
        assert!(err.to_string().contains("Ambiguous prefix"));
        assert!(err.to_string().contains("3f2a0c4e"));
    }

    #[test]
    fn test_unknown_and_empty_prefix() {
        assert!(match_prefix(ids().into_iter(), "ffff").is_err());
        assert!(match_prefix(ids().into_iter(), "").is_err());
    }
}
