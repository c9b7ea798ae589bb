//! Import normalization and the remapping table.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::indexer::filesystem::relative_path;
use crate::models::{ImportTarget, Source};

/// Turn an import string as written into an [`ImportTarget`].
///
/// Relative imports (leading `.`) are joined with the importer's directory
/// and normalized lexically; a path that climbs above the project root
/// keeps its leading `..` and can never match a tracked source.
pub fn normalize_import(importer_dir: &str, raw: &str) -> ImportTarget {
    if !raw.starts_with('.') {
        return ImportTarget::Named(raw.to_string());
    }
    let mut parts: Vec<&str> = importer_dir.split('/').filter(|p| !p.is_empty()).collect();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    ImportTarget::Local(parts.join("/"))
}

// ---------------------------------------------------------------------------
// RemappingTable
// ---------------------------------------------------------------------------

/// Symbolic import prefix to filesystem path. Read-only during a build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemappingTable {
    entries: BTreeMap<String, PathBuf>,
}

impl RemappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a mapping; later inserts win.
    pub fn insert(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        let name = name.into().trim_end_matches('/').to_string();
        self.entries.insert(name, path.into());
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = (String, PathBuf)>) {
        for (name, path) in other {
            self.insert(name, path);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.entries.get(name).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }

    /// Longest entry that `import` equals or extends on a `/` boundary.
    fn lookup<'a>(&'a self, import: &'a str) -> Option<(&'a str, &'a Path, &'a str)> {
        self.entries
            .iter()
            .filter_map(|(name, path)| {
                let rest = import.strip_prefix(name.as_str())?;
                if rest.is_empty() || rest.starts_with('/') {
                    Some((name.as_str(), path.as_path(), rest.trim_start_matches('/')))
                } else {
                    None
                }
            })
            .max_by_key(|(name, _, _)| name.len())
    }

    /// Filesystem path a named import resolves to.
    pub fn resolve(&self, import: &str) -> Option<PathBuf> {
        let (_, path, rest) = self.lookup(import)?;
        Some(if rest.is_empty() {
            path.to_path_buf()
        } else {
            path.join(rest)
        })
    }

    /// `name=path` compiler arguments, sorted by name.
    pub fn to_args(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(name, path)| format!("{name}={}", path.display()))
            .collect()
    }

    /// Distinct remapping target directories, for `--allow-paths`. A target
    /// naming a single source file contributes its parent directory.
    pub fn allow_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .entries
            .values()
            .map(|path| match (path.extension(), path.parent()) {
                (Some(ext), Some(parent)) if ext == "sol" => parent.to_path_buf(),
                _ => path.clone(),
            })
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// If `path` lies under a remapping target, the remapping name and the
    /// remainder below the target.
    pub fn vendored_name(&self, path: &Path) -> Option<(String, PathBuf)> {
        self.entries
            .iter()
            .filter_map(|(name, target)| {
                let rest = path.strip_prefix(target).ok()?;
                Some((name.clone(), rest.to_path_buf(), target.components().count()))
            })
            .max_by_key(|(_, _, depth)| *depth)
            .map(|(name, rest, _)| (name, rest))
    }
}

// ---------------------------------------------------------------------------
// Resolution against known sources
// ---------------------------------------------------------------------------

/// Root-relative path of the tracked source an import points at, if any.
/// Named imports count when their remapped path lands inside the project.
pub fn edge_target(import: &ImportTarget, remappings: &RemappingTable, project_root: &Path) -> Option<String> {
    match import {
        ImportTarget::Local(path) => Some(path.clone()),
        ImportTarget::Named(name) => {
            let resolved = remappings.resolve(name)?;
            relative_path(&resolved, project_root).ok()
        }
    }
}

/// Root-relative path of a file the scanner tracks: inside `contracts_dir`
/// and below no hidden directory.
fn tracked_path(resolved: &Path, project_root: &Path, contracts_dir: &str) -> Option<String> {
    let rel = relative_path(resolved, project_root).ok()?;
    let prefix = contracts_dir.trim_start_matches("./").trim_end_matches('/');
    let inside = match prefix {
        "" | "." => true,
        prefix => rel.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/')),
    };
    let hidden = rel.split('/').any(|part| part.starts_with('.'));
    (inside && !hidden).then_some(rel)
}

/// Imports of `source` that cannot be resolved: local paths that are not
/// tracked sources, named imports with no remapping, and named imports
/// remapped into the scanned tree onto a file that is not tracked.
pub fn unresolved_imports(
    source: &Source,
    known_paths: &HashSet<String>,
    remappings: &RemappingTable,
    project_root: &Path,
    contracts_dir: &str,
) -> Vec<String> {
    source
        .imports
        .iter()
        .filter(|import| match import {
            ImportTarget::Local(path) => !known_paths.contains(path),
            ImportTarget::Named(name) => match remappings.resolve(name) {
                None => true,
                Some(resolved) => tracked_path(&resolved, project_root, contracts_dir)
                    .is_some_and(|path| !known_paths.contains(&path)),
            },
        })
        .map(|import| import.as_str().to_string())
        .collect()
}
