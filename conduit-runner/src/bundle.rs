//! Artifact bundles
//!
//! Bundles are plain tar archives. Source bundles come straight from the
//! source provider; output bundles are built from the files an artifact
//! manifest selects in the workspace.

use conduit_core::PipelineError;
use conduit_core::domain::build::{ArtifactManifest, is_glob};
use glob::{MatchOptions, Pattern};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// A workspace file selected for the output bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub source: PathBuf,
    /// Path of the file inside the bundle
    pub name: String,
}

/// Result of resolving a manifest against a workspace
#[derive(Debug, Default)]
pub struct Collected {
    pub files: Vec<BundleFile>,
    /// Manifest entries that selected nothing
    pub unmatched: Vec<String>,
}

/// Unpacks `bundle` into `dest`, returning the number of entries
pub fn unpack(bundle: &[u8], dest: &Path) -> Result<usize, PipelineError> {
    let mut archive = tar::Archive::new(bundle);
    let mut count = 0;

    let entries = archive
        .entries()
        .map_err(|e| PipelineError::Environment(format!("failed to read bundle: {}", e)))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| PipelineError::Environment(format!("failed to read bundle: {}", e)))?;
        // `unpack_in` refuses entries escaping `dest`
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| PipelineError::Environment(format!("failed to unpack bundle: {}", e)))?;
        if unpacked {
            count += 1;
        }
    }

    Ok(count)
}

/// File paths stored in a bundle, in archive order
pub fn list(bundle: &[u8]) -> Result<Vec<String>, PipelineError> {
    let mut archive = tar::Archive::new(bundle);
    let mut names = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| PipelineError::Environment(format!("failed to read bundle: {}", e)))?;
    for entry in entries {
        let entry = entry
            .map_err(|e| PipelineError::Environment(format!("failed to read bundle: {}", e)))?;
        if entry.header().entry_type().is_file() {
            let path = entry
                .path()
                .map_err(|e| PipelineError::Environment(format!("invalid bundle path: {}", e)))?;
            names.push(path.to_string_lossy().to_string());
        }
    }

    Ok(names)
}

/// Packs every regular file under `root` with paths relative to it
pub fn pack_directory(root: &Path) -> Result<Vec<u8>, PipelineError> {
    let mut files = Vec::new();
    walk_files(root, root, &mut files)?;
    pack(&files)
}

/// Packs the given files into a tar bundle
pub fn pack(files: &[BundleFile]) -> Result<Vec<u8>, PipelineError> {
    let mut builder = tar::Builder::new(Vec::new());

    for file in files {
        builder
            .append_path_with_name(&file.source, &file.name)
            .map_err(|e| {
                PipelineError::Environment(format!("failed to add {} to bundle: {}", file.name, e))
            })?;
    }

    builder
        .into_inner()
        .map_err(|e| PipelineError::Environment(format!("failed to finish bundle: {}", e)))
}

/// Resolves an artifact manifest against the workspace
///
/// Entries are explicit paths (a directory selects everything below it) or
/// glob patterns. Paths are relative to `base_directory` when set. With
/// `discard_paths` every file lands in the bundle root; two files with the
/// same name are then an error. A manifest that selects no file at all is
/// an error too.
pub fn collect(workspace: &Path, manifest: &ArtifactManifest) -> Result<Collected, PipelineError> {
    let base = match &manifest.base_directory {
        Some(dir) => workspace.join(dir),
        None => workspace.to_path_buf(),
    };
    if !base.is_dir() {
        return Err(PipelineError::Manifest(format!(
            "base directory '{}' does not exist",
            manifest.base_directory.as_deref().unwrap_or(".")
        )));
    }

    let mut selected: BTreeMap<String, BundleFile> = BTreeMap::new();
    let mut unmatched = Vec::new();

    for entry in &manifest.files {
        let mut matched = Vec::new();

        if is_glob(entry) {
            let pattern = Pattern::new(entry).map_err(|e| {
                PipelineError::Manifest(format!("invalid pattern '{}': {}", entry, e))
            })?;
            let mut candidates = Vec::new();
            walk_files(&base, &base, &mut candidates)?;
            matched.extend(
                candidates
                    .into_iter()
                    .filter(|file| pattern.matches_with(&file.name, MATCH_OPTIONS)),
            );
        } else {
            let path = base.join(entry);
            if path.is_file() {
                matched.push(BundleFile {
                    source: path,
                    name: entry.trim_start_matches("./").to_string(),
                });
            } else if path.is_dir() {
                walk_files(&base, &path, &mut matched)?;
            }
        }

        if matched.is_empty() {
            unmatched.push(entry.clone());
            continue;
        }

        for mut file in matched {
            if manifest.discard_paths {
                let flat = file
                    .name
                    .rsplit('/')
                    .next()
                    .unwrap_or(file.name.as_str())
                    .to_string();
                file.name = flat;
            }

            match selected.get(&file.name) {
                Some(existing) if existing.source != file.source => {
                    return Err(PipelineError::Manifest(format!(
                        "'{}' is selected from both {} and {}",
                        file.name,
                        existing.source.display(),
                        file.source.display()
                    )));
                }
                Some(_) => {}
                None => {
                    selected.insert(file.name.clone(), file);
                }
            }
        }
    }

    if selected.is_empty() {
        return Err(PipelineError::Manifest(format!(
            "no files matched {:?}",
            manifest.files
        )));
    }

    Ok(Collected {
        files: selected.into_values().collect(),
        unmatched,
    })
}

/// Appends every regular file under `dir`, named relative to `base`
fn walk_files(base: &Path, dir: &Path, out: &mut Vec<BundleFile>) -> Result<(), PipelineError> {
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            PipelineError::Environment(format!("failed to walk {}: {}", dir.display(), e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(base) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(BundleFile {
            source: entry.path().to_path_buf(),
            name,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("output/nested")).unwrap();
        fs::write(dir.path().join("output/search_result.json"), "{}").unwrap();
        fs::write(dir.path().join("output/nested/summary.md"), "# ok").unwrap();
        fs::write(dir.path().join("README.md"), "readme").unwrap();
        dir
    }

    fn manifest(files: &[&str]) -> ArtifactManifest {
        ArtifactManifest {
            files: files.iter().map(|f| f.to_string()).collect(),
            discard_paths: false,
            base_directory: None,
        }
    }

    fn names(collected: &Collected) -> Vec<&str> {
        collected.files.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_recursive_glob_keeps_paths() {
        let ws = workspace();
        let collected = collect(ws.path(), &manifest(&["output/**/*"])).unwrap();
        assert_eq!(
            names(&collected),
            vec!["output/nested/summary.md", "output/search_result.json"]
        );
    }

    #[test]
    fn test_discard_paths_flattens() {
        let ws = workspace();
        let mut m = manifest(&["output/**/*", "README.md"]);
        m.discard_paths = true;

        let collected = collect(ws.path(), &m).unwrap();
        assert_eq!(
            names(&collected),
            vec!["README.md", "search_result.json", "summary.md"]
        );
    }

    #[test]
    fn test_single_star_does_not_cross_directories() {
        let ws = workspace();
        let collected = collect(ws.path(), &manifest(&["output/*"])).unwrap();
        assert_eq!(names(&collected), vec!["output/search_result.json"]);
    }

    #[test]
    fn test_directory_entry_selects_contents() {
        let ws = workspace();
        let collected = collect(ws.path(), &manifest(&["output"])).unwrap();
        assert_eq!(collected.files.len(), 2);
    }

    #[test]
    fn test_base_directory() {
        let ws = workspace();
        let mut m = manifest(&["*.json"]);
        m.base_directory = Some("output".to_string());

        let collected = collect(ws.path(), &m).unwrap();
        assert_eq!(names(&collected), vec!["search_result.json"]);
    }

    #[test]
    fn test_nothing_matched_is_an_error() {
        let ws = workspace();
        let err = collect(ws.path(), &manifest(&["dist/*.zip"])).unwrap_err();
        assert!(matches!(err, PipelineError::Manifest(_)));
    }

    #[test]
    fn test_unmatched_entries_are_reported() {
        let ws = workspace();
        let collected = collect(ws.path(), &manifest(&["README.md", "missing.txt"])).unwrap();
        assert_eq!(collected.unmatched, vec!["missing.txt"]);
    }

    #[test]
    fn test_flattening_collision_is_an_error() {
        let ws = workspace();
        fs::write(ws.path().join("output/nested/search_result.json"), "[]").unwrap();
        let mut m = manifest(&["output/**/*.json"]);
        m.discard_paths = true;

        assert!(matches!(
            collect(ws.path(), &m),
            Err(PipelineError::Manifest(_))
        ));
    }

    #[test]
    fn test_pack_and_unpack_directory() {
        let ws = workspace();
        let bundle = pack_directory(ws.path()).unwrap();

        let mut listed = list(&bundle).unwrap();
        listed.sort();
        assert_eq!(
            listed,
            vec![
                "README.md",
                "output/nested/summary.md",
                "output/search_result.json"
            ]
        );

        let dest = tempfile::tempdir().unwrap();
        assert_eq!(unpack(&bundle, dest.path()).unwrap(), 3);
        assert_eq!(
            fs::read_to_string(dest.path().join("output/nested/summary.md")).unwrap(),
            "# ok"
        );
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let dest = tempfile::tempdir().unwrap();
        assert!(unpack(b"definitely not a tar archive, just bytes", dest.path()).is_err());
    }
}
