//! Shared typed models used across scanning, storage, and compilation.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::toolchain::solc::SourceAst;

// ---------------------------------------------------------------------------
// Paths and identities
// ---------------------------------------------------------------------------

/// Composite identity of a tracked source file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub dir: String,
    pub filename: String,
}

impl SourceKey {
    /// Split a repository-relative, `/`-separated path into dir + filename.
    /// Files at the repository root have an empty dir.
    pub fn from_path(path: &str) -> Self {
        match path.rsplit_once('/') {
            Some((dir, filename)) => Self {
                dir: dir.to_string(),
                filename: filename.to_string(),
            },
            None => Self {
                dir: String::new(),
                filename: path.to_string(),
            },
        }
    }

    pub fn path(&self) -> String {
        join_path(&self.dir, &self.filename)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

pub(crate) fn join_path(dir: &str, filename: &str) -> String {
    if dir.is_empty() {
        filename.to_string()
    } else {
        format!("{dir}/{filename}")
    }
}

/// Modification time as nanoseconds since the unix epoch.
pub fn mod_time_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

const LOCAL_MARKER: &str = "./";

/// One import target of a source, after normalization.
///
/// Serialized as a plain string: local imports carry a leading `./` in front
/// of their repository-relative path, named imports are written verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ImportTarget {
    /// Repository-relative path of another source in the project.
    Local(String),
    /// Symbolic name resolved through the remapping table.
    Named(String),
}

impl ImportTarget {
    pub fn as_str(&self) -> &str {
        match self {
            ImportTarget::Local(p) | ImportTarget::Named(p) => p,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ImportTarget::Local(_))
    }
}

impl From<String> for ImportTarget {
    fn from(value: String) -> Self {
        match value.strip_prefix(LOCAL_MARKER) {
            Some(rest) => ImportTarget::Local(rest.to_string()),
            None => ImportTarget::Named(value),
        }
    }
}

impl From<ImportTarget> for String {
    fn from(value: ImportTarget) -> Self {
        match value {
            ImportTarget::Local(p) => format!("{LOCAL_MARKER}{p}"),
            ImportTarget::Named(n) => n,
        }
    }
}

impl fmt::Display for ImportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// One tracked `.sol` file and its parsed metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Source {
    pub dir: String,
    pub filename: String,
    pub mod_time: i64,
    pub tainted: bool,
    /// Version pragma split into constraint tokens; empty when the file
    /// declares no pragma.
    #[serde(default)]
    pub version: Vec<String>,
    #[serde(default)]
    pub imports: Vec<ImportTarget>,
    #[serde(default, rename = "AST", skip_serializing_if = "Option::is_none")]
    pub ast: Option<SourceAst>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Source {
    pub fn key(&self) -> SourceKey {
        SourceKey {
            dir: self.dir.clone(),
            filename: self.filename.clone(),
        }
    }

    pub fn path(&self) -> String {
        join_path(&self.dir, &self.filename)
    }

    pub fn local_imports(&self) -> impl Iterator<Item = &str> {
        self.imports.iter().filter_map(|i| match i {
            ImportTarget::Local(p) => Some(p.as_str()),
            ImportTarget::Named(_) => None,
        })
    }

    pub fn named_imports(&self) -> impl Iterator<Item = &str> {
        self.imports.iter().filter_map(|i| match i {
            ImportTarget::Named(n) => Some(n.as_str()),
            ImportTarget::Local(_) => None,
        })
    }

    /// The pragma as written, tokens joined by single spaces.
    pub fn pragma(&self) -> Option<String> {
        if self.version.is_empty() {
            None
        } else {
            Some(self.version.join(" "))
        }
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// One named compiled unit produced from a source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Contract {
    pub dir: String,
    pub filename: String,
    pub name: String,
    /// ABI as JSON text.
    pub abi: String,
    pub bin: String,
    pub bin_runtime: String,
    pub src_map: String,
    pub src_map_runtime: String,
}

impl Contract {
    pub fn source_key(&self) -> SourceKey {
        SourceKey {
            dir: self.dir.clone(),
            filename: self.filename.clone(),
        }
    }

    pub fn source_path(&self) -> String {
        join_path(&self.dir, &self.filename)
    }
}

// ---------------------------------------------------------------------------
// FileDiff
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffKind {
    Add,
    Modify,
    Delete,
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiffKind::Add => "add",
            DiffKind::Modify => "mod",
            DiffKind::Delete => "del",
        })
    }
}

/// Comparison result between on-disk state and stored state for one path.
#[derive(Clone, Debug, PartialEq)]
pub struct FileDiff {
    pub path: String,
    pub kind: DiffKind,
    /// New modification time; `None` for deletions.
    pub mod_time: Option<i64>,
    /// Freshly parsed record; `None` for deletions.
    pub source: Option<Source>,
}
