//! Metadata snapshot file: the full Source + Contract set as JSON.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{SolsticeError, SolsticeResult};
use crate::models::{Contract, Source};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub contracts: Vec<Contract>,
}

/// Read a snapshot. A missing file is `None`; so is an unreadable one,
/// which only costs a full rebuild.
pub fn read_snapshot(path: &Path) -> SolsticeResult<Option<Snapshot>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&content) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt metadata snapshot");
            Ok(None)
        }
    }
}

/// Write a snapshot atomically: a temp file in the target directory is
/// renamed over `path`.
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> SolsticeResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut file, snapshot)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;
    file.persist(path)
        .map_err(|e| SolsticeError::Io(e.error))?;
    debug!(
        path = %path.display(),
        sources = snapshot.sources.len(),
        contracts = snapshot.contracts.len(),
        "metadata snapshot written"
    );
    Ok(())
}
