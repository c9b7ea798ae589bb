//! Error types for the Solstice core library.

/// Top-level error enum for the Solstice core library.
///
/// Variants fall into two groups. Global failures (scan, store, graph,
/// config, raw I/O and JSON) abort a build invocation. The remaining
/// variants are local to one component and are collected into the build
/// report while independent components continue.
#[derive(Debug, thiserror::Error)]
pub enum SolsticeError {
    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Missing version pragma in {0}")]
    MissingPragma(String),

    #[error("Unresolved import {import:?} in {path}")]
    UnresolvedImport { path: String, import: String },

    #[error("Compiler version {version} does not satisfy {constraint}")]
    VersionMismatch { version: String, constraint: String },

    #[error("Invalid version constraint: {0}")]
    InvalidConstraint(String),

    #[error("Failed to download solidity {version}: {reason}")]
    Download { version: String, reason: String },

    #[error("Compile error: {stderr}")]
    Compile { stderr: String },

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SolsticeError {
    /// Whether this error compromises global state and must abort the build.
    pub fn is_fatal(&self) -> bool {
        match self {
            SolsticeError::Scan(_)
            | SolsticeError::Store(_)
            | SolsticeError::Graph(_)
            | SolsticeError::Config(_)
            | SolsticeError::Regex(_)
            | SolsticeError::Io(_)
            | SolsticeError::Json(_) => true,
            SolsticeError::MissingPragma(_)
            | SolsticeError::UnresolvedImport { .. }
            | SolsticeError::VersionMismatch { .. }
            | SolsticeError::InvalidConstraint(_)
            | SolsticeError::Download { .. }
            | SolsticeError::Compile { .. }
            | SolsticeError::Artifact(_) => false,
        }
    }
}

pub type SolsticeResult<T> = Result<T, SolsticeError>;
