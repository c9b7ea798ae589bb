//! Per-contract artifact files under the build output directory.
//!
//! Layout: `<out>/<source dir>/<source file>/<ContractName>.json`. Sources
//! living under a remapping target use the remapping name in place of the
//! target directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::errors::{SolsticeError, SolsticeResult};
use crate::indexer::imports::RemappingTable;
use crate::models::{Contract, SourceKey};

const STAGING_PREFIX: &str = ".staging-";

fn artifact_err(path: &Path, e: impl std::fmt::Display) -> SolsticeError {
    SolsticeError::Artifact(format!("{}: {e}", path.display()))
}

fn slot(staging: &Path, side: &str, index: usize) -> PathBuf {
    staging.join(side).join(index.to_string())
}

fn move_path(from: &Path, to: &Path) -> SolsticeResult<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| artifact_err(parent, e))?;
    }
    std::fs::rename(from, to).map_err(|e| artifact_err(to, e))
}

/// Remove a directory tree or file; a missing path is not an error.
fn remove_path(path: &Path) -> SolsticeResult<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        // nothing reachable at this path
        Err(_) => return Ok(()),
    };
    result.map_err(|e| artifact_err(path, e))
}

pub struct ArtifactLayout {
    out_root: PathBuf,
    project_root: PathBuf,
    remappings: RemappingTable,
}

impl ArtifactLayout {
    pub fn new(
        out_root: impl Into<PathBuf>,
        project_root: impl Into<PathBuf>,
        remappings: RemappingTable,
    ) -> Self {
        Self {
            out_root: out_root.into(),
            project_root: project_root.into(),
            remappings,
        }
    }

    pub fn out_root(&self) -> &Path {
        &self.out_root
    }

    /// Directory holding the artifacts of one source.
    pub fn dir_for(&self, key: &SourceKey) -> PathBuf {
        let absolute = self.project_root.join(&key.dir);
        let relative = match self.remappings.vendored_name(&absolute) {
            Some((name, rest)) => PathBuf::from(name).join(rest),
            None => PathBuf::from(&key.dir),
        };
        self.out_root.join(relative).join(&key.filename)
    }

    pub fn path_for(&self, contract: &Contract) -> PathBuf {
        self.dir_for(&contract.source_key())
            .join(format!("{}.json", contract.name))
    }

    /// Replace the artifacts of every member, then run `commit`.
    ///
    /// New files are written to a staging directory under the output root
    /// and swapped in only once every member is staged. When a swap or
    /// `commit` fails, each member's previous artifacts are put back, so a
    /// component's files change together with its store records or not at
    /// all. Returns the number of files written and the commit result.
    pub fn replace_component<T>(
        &self,
        members: &[SourceKey],
        contracts: &[Contract],
        commit: impl FnOnce() -> SolsticeResult<T>,
    ) -> SolsticeResult<(usize, T)> {
        let (staging, written) = self.stage(members, contracts)?;
        let mut swapped = Vec::with_capacity(members.len());
        for (index, member) in members.iter().enumerate() {
            if let Err(e) = self.swap_in(staging.path(), index, member) {
                self.restore(staging.path(), members, &swapped);
                return Err(e);
            }
            swapped.push(index);
        }
        match commit() {
            Ok(value) => {
                debug!(written, out = %self.out_root.display(), "artifacts written");
                Ok((written, value))
            }
            Err(e) => {
                self.restore(staging.path(), members, &swapped);
                Err(e)
            }
        }
    }

    /// Write every member's files under `<staging>/new/<member index>`.
    fn stage(&self, members: &[SourceKey], contracts: &[Contract]) -> SolsticeResult<(TempDir, usize)> {
        std::fs::create_dir_all(&self.out_root).map_err(|e| artifact_err(&self.out_root, e))?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.out_root)
            .map_err(|e| artifact_err(&self.out_root, e))?;

        let mut by_source: BTreeMap<SourceKey, Vec<&Contract>> = BTreeMap::new();
        for contract in contracts {
            by_source.entry(contract.source_key()).or_default().push(contract);
        }
        let mut written = 0;
        for (index, member) in members.iter().enumerate() {
            let Some(owned) = by_source.get(member) else {
                continue;
            };
            let dir = slot(staging.path(), "new", index);
            std::fs::create_dir_all(&dir).map_err(|e| artifact_err(&dir, e))?;
            for contract in owned {
                let path = dir.join(format!("{}.json", contract.name));
                let data = serde_json::to_vec_pretty(contract).map_err(|e| artifact_err(&path, e))?;
                std::fs::write(&path, data).map_err(|e| artifact_err(&path, e))?;
                written += 1;
            }
        }
        Ok((staging, written))
    }

    /// Move the member's current directory to `<staging>/old/<index>` and
    /// its staged one into place. A failed second step undoes the first.
    fn swap_in(&self, staging: &Path, index: usize, member: &SourceKey) -> SolsticeResult<()> {
        let target = self.dir_for(member);
        let fresh = slot(staging, "new", index);
        let backup = slot(staging, "old", index);

        let had_previous = std::fs::symlink_metadata(&target).is_ok();
        if had_previous {
            move_path(&target, &backup)?;
        }
        if fresh.exists() {
            if let Err(e) = move_path(&fresh, &target) {
                if had_previous {
                    let _ = move_path(&backup, &target);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Best effort: put back the previous directories of swapped members.
    fn restore(&self, staging: &Path, members: &[SourceKey], swapped: &[usize]) {
        for &index in swapped.iter().rev() {
            let target = self.dir_for(&members[index]);
            let backup = slot(staging, "old", index);
            let result = remove_path(&target).and_then(|()| {
                if backup.exists() {
                    move_path(&backup, &target)
                } else {
                    Ok(())
                }
            });
            if let Err(e) = result {
                warn!(path = %target.display(), error = %e, "failed to restore previous artifacts");
            }
        }
    }

    pub fn remove_source(&self, key: &SourceKey) -> SolsticeResult<()> {
        remove_path(&self.dir_for(key))
    }

    pub fn clear(&self) -> SolsticeResult<()> {
        match std::fs::remove_dir_all(&self.out_root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(artifact_err(&self.out_root, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(path: &str, name: &str) -> Contract {
        let key = SourceKey::from_path(path);
        Contract {
            dir: key.dir,
            filename: key.filename,
            name: name.into(),
            abi: "[]".into(),
            bin: "60".into(),
            bin_runtime: "61".into(),
            src_map: String::new(),
            src_map_runtime: String::new(),
        }
    }

    #[test]
    fn layout_nests_by_dir_and_file() {
        let layout = ArtifactLayout::new("/out", "/work", RemappingTable::new());
        assert_eq!(
            layout.path_for(&contract("contracts/tokens/erc20.sol", "Token")),
            PathBuf::from("/out/contracts/tokens/erc20.sol/Token.json")
        );
    }

    #[test]
    fn vendored_prefix_is_replaced_by_remapping_name() {
        let mut remappings = RemappingTable::new();
        remappings.insert("@oz", "/work/lib/openzeppelin");
        let layout = ArtifactLayout::new("/out", "/work", remappings);
        assert_eq!(
            layout.dir_for(&SourceKey::from_path("lib/openzeppelin/token/erc20.sol")),
            PathBuf::from("/out/@oz/token/erc20.sol")
        );
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn committed() -> SolsticeResult<()> {
        Ok(())
    }

    #[test]
    fn replace_component_replaces_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path().join("out"), dir.path(), RemappingTable::new());
        let a = SourceKey::from_path("contracts/a.sol");
        let b = SourceKey::from_path("contracts/b.sol");

        let (written, ()) = layout
            .replace_component(
                &[a.clone(), b.clone()],
                &[contract("contracts/a.sol", "Old"), contract("contracts/b.sol", "B")],
                committed,
            )
            .unwrap();
        assert_eq!(written, 2);

        layout
            .replace_component(&[a.clone(), b.clone()], &[contract("contracts/a.sol", "New")], committed)
            .unwrap();
        assert!(!layout.path_for(&contract("contracts/a.sol", "Old")).exists());
        assert!(!layout.dir_for(&b).exists());

        let path = layout.path_for(&contract("contracts/a.sol", "New"));
        let stored: Contract = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(stored.name, "New");
        assert_eq!(names_in(layout.out_root()), vec!["contracts"]);

        layout.clear().unwrap();
        assert!(!layout.out_root().exists());
    }

    #[test]
    fn obstructed_member_leaves_every_previous_artifact_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path().join("out"), dir.path(), RemappingTable::new());
        let a = SourceKey::from_path("contracts/a.sol");
        let b = SourceKey::from_path("contracts/sub/b.sol");
        let members = [a.clone(), b.clone()];

        layout
            .replace_component(
                &members,
                &[contract("contracts/a.sol", "A"), contract("contracts/sub/b.sol", "B")],
                committed,
            )
            .unwrap();

        // b's artifact directory can no longer be created
        let sub = layout.out_root().join("contracts/sub");
        std::fs::remove_dir_all(&sub).unwrap();
        std::fs::write(&sub, "in the way").unwrap();

        let mut commit_ran = false;
        let err = layout
            .replace_component(
                &members,
                &[contract("contracts/a.sol", "A2"), contract("contracts/sub/b.sol", "B")],
                || {
                    commit_ran = true;
                    Ok(())
                },
            )
            .unwrap_err();
        assert!(matches!(err, SolsticeError::Artifact(_)), "{err:?}");
        assert!(!commit_ran);
        assert_eq!(names_in(&layout.dir_for(&a)), vec!["A.json"]);
        assert_eq!(names_in(layout.out_root()), vec!["contracts"]);
    }

    #[test]
    fn failed_commit_restores_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path().join("out"), dir.path(), RemappingTable::new());
        let a = SourceKey::from_path("contracts/a.sol");
        let b = SourceKey::from_path("contracts/b.sol");
        let members = [a.clone(), b.clone()];

        layout
            .replace_component(&members, &[contract("contracts/a.sol", "A")], committed)
            .unwrap();

        let err = layout
            .replace_component(
                &members,
                &[contract("contracts/a.sol", "A2"), contract("contracts/b.sol", "B")],
                || -> SolsticeResult<()> { Err(SolsticeError::Artifact("commit refused".into())) },
            )
            .unwrap_err();
        assert!(matches!(err, SolsticeError::Artifact(ref m) if m == "commit refused"));
        assert_eq!(names_in(&layout.dir_for(&a)), vec!["A.json"]);
        assert!(!layout.dir_for(&b).exists());
        assert_eq!(names_in(layout.out_root()), vec!["contracts"]);
    }
}
