//! Directory scanning for tracked source files.

use std::path::{Component, Path};

use walkdir::{DirEntry, WalkDir};

use crate::errors::{SolsticeError, SolsticeResult};
use crate::models::mod_time_nanos;

const SOURCE_EXTENSION: &str = "sol";

/// One regular file found under the contracts root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub mod_time: i64,
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_str().is_some_and(|name| name.starts_with('.'))
}

fn is_source_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(SOURCE_EXTENSION)
}

/// Render `path` relative to `root` with `/` separators.
pub fn relative_path(path: &Path, root: &Path) -> SolsticeResult<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        SolsticeError::Scan(format!("{} is outside {}", path.display(), root.display()))
    })?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                SolsticeError::Scan(format!("non utf-8 path {}", path.display()))
            })?),
            Component::CurDir => {}
            _ => return Err(SolsticeError::Scan(format!("unexpected path {}", path.display()))),
        }
    }
    Ok(parts.join("/"))
}

/// Recursively list every `.sol` file under `<project_root>/<contracts_dir>`,
/// sorted by path.
///
/// Any walk failure aborts the whole scan: diffing against a partial listing
/// would turn unreadable files into deletions.
pub fn scan_sources(project_root: &Path, contracts_dir: &str) -> SolsticeResult<Vec<ScannedFile>> {
    let root = project_root.join(contracts_dir);
    if !root.is_dir() {
        return Err(SolsticeError::Scan(format!(
            "contracts directory {} does not exist",
            root.display()
        )));
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_hidden_dir(e));
    for entry in walker {
        let entry = entry.map_err(|e| SolsticeError::Scan(e.to_string()))?;
        if !entry.file_type().is_file() || !is_source_file(entry.path()) {
            continue;
        }
        let scan_err = |e: &dyn std::fmt::Display| {
            SolsticeError::Scan(format!("{}: {e}", entry.path().display()))
        };
        let metadata = entry.metadata().map_err(|e| scan_err(&e))?;
        let modified = metadata.modified().map_err(|e| scan_err(&e))?;
        files.push(ScannedFile {
            path: relative_path(entry.path(), project_root)?,
            mod_time: mod_time_nanos(modified),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}
