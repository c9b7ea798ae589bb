//! On-disk versus stored comparison.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use crate::errors::{SolsticeError, SolsticeResult};
use crate::indexer::filesystem::ScannedFile;
use crate::indexer::parser::SourceParser;
use crate::models::{DiffKind, FileDiff, Source};

/// Classify every scanned path against the stored sources.
///
/// Change detection looks at the modification time only: content edits that
/// keep the timestamp are not seen, a touched file is reparsed. Added and
/// modified files are read and parsed in parallel. The result lists adds and
/// modifications in path order, followed by deletions in path order.
pub fn diff_sources(
    files: &[ScannedFile],
    known: &[Source],
    project_root: &Path,
    parser: &SourceParser,
) -> SolsticeResult<Vec<FileDiff>> {
    let stored: HashMap<String, i64> = known.iter().map(|s| (s.path(), s.mod_time)).collect();
    let on_disk: HashSet<&str> = files.iter().map(|f| f.path.as_str()).collect();

    let changed: Vec<(&ScannedFile, DiffKind)> = files
        .iter()
        .filter_map(|file| match stored.get(&file.path) {
            None => Some((file, DiffKind::Add)),
            Some(mod_time) if *mod_time != file.mod_time => Some((file, DiffKind::Modify)),
            Some(_) => None,
        })
        .collect();

    let mut diffs = changed
        .par_iter()
        .map(|(file, kind)| {
            let bytes = std::fs::read(project_root.join(&file.path))
                .map_err(|e| SolsticeError::Scan(format!("read {}: {e}", file.path)))?;
            let content = String::from_utf8_lossy(&bytes);
            let source = parser.parse_source(&file.path, file.mod_time, &content);
            Ok(FileDiff {
                path: file.path.clone(),
                kind: *kind,
                mod_time: Some(file.mod_time),
                source: Some(source),
            })
        })
        .collect::<SolsticeResult<Vec<_>>>()?;
    diffs.sort_by(|a, b| a.path.cmp(&b.path));

    let mut deleted: Vec<String> = known
        .iter()
        .map(Source::path)
        .filter(|path| !on_disk.contains(path.as_str()))
        .collect();
    deleted.sort();
    diffs.extend(deleted.into_iter().map(|path| FileDiff {
        path,
        kind: DiffKind::Delete,
        mod_time: None,
        source: None,
    }));

    debug!(changed = diffs.len(), scanned = files.len(), "diff computed");
    Ok(diffs)
}
