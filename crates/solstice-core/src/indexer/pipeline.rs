//! Incremental build orchestration.
//!
//! One `compile` call runs scan, graph, select, resolve, acquire, invoke,
//! commit and snapshot in that order. Failures local to a component are
//! collected in the [`BuildReport`]; scan, store and graph failures abort.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::artifacts::ArtifactLayout;
use crate::config::ProjectConfig;
use crate::errors::{SolsticeError, SolsticeResult};
use crate::indexer::depgraph::{inheritance_dot, Component, DependencyGraph};
use crate::indexer::diff::diff_sources;
use crate::indexer::filesystem::scan_sources;
use crate::indexer::imports::{edge_target, unresolved_imports, RemappingTable};
use crate::indexer::parser::SourceParser;
use crate::models::{Contract, DiffKind, FileDiff, Source, SourceKey};
use crate::stdlib;
use crate::store::database::{ComponentCommit, Store};
use crate::store::snapshot::{read_snapshot, write_snapshot};
use crate::toolchain::download::ToolchainManager;
use crate::toolchain::solc::{CompileInput, Compiler, SolcCompiler, SourceAst};
use crate::toolchain::version::{resolve_component, Version};

pub const METADATA_FILE: &str = "metadata.json";
const LIB_DIR: &str = "lib";
const ARTIFACTS_DIR: &str = "contracts";

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
}

impl From<&FileDiff> for DiffEntry {
    fn from(diff: &FileDiff) -> Self {
        Self {
            path: diff.path.clone(),
            kind: diff.kind,
        }
    }
}

/// A component that compiled and committed.
#[derive(Clone, Debug)]
pub struct CompiledUnit {
    pub unit_id: String,
    pub members: Vec<String>,
    pub contracts: Vec<Contract>,
    pub taints_cleared: usize,
}

/// A component that failed; other components were still attempted.
#[derive(Debug)]
pub struct ComponentError {
    pub unit_id: String,
    /// Member paths of the failed component.
    pub component: Vec<String>,
    pub error: SolsticeError,
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.component.join(", "), self.error)
    }
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub diffs: Vec<DiffEntry>,
    pub compiled: Vec<CompiledUnit>,
    pub errors: Vec<ComponentError>,
    /// Components with no tainted member.
    pub up_to_date: usize,
    pub snapshot_written: bool,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Nothing was tainted, the compiler never ran.
    pub fn is_noop(&self) -> bool {
        self.compiled.is_empty() && self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

pub struct Project {
    config: ProjectConfig,
    root: PathBuf,
    data_dir: PathBuf,
    target: Version,
    parser: SourceParser,
    store: Store,
    remappings: RemappingTable,
    artifacts: ArtifactLayout,
    toolchain: Arc<ToolchainManager>,
    compiler: Box<dyn Compiler>,
}

impl Project {
    /// Open a project with the process compiler and HTTP downloads.
    pub fn open(config: ProjectConfig) -> SolsticeResult<Self> {
        let root = canonical_root(&config)?;
        let toolchain = Arc::new(ToolchainManager::new(
            config.cache_dir(),
            config.release_url.clone(),
        ));
        Self::with_parts(config, toolchain, Box::new(SolcCompiler::new(root)))
    }

    /// Open a project with an explicit toolchain manager (which may be
    /// shared between projects) and compiler.
    pub fn with_parts(
        mut config: ProjectConfig,
        toolchain: Arc<ToolchainManager>,
        compiler: Box<dyn Compiler>,
    ) -> SolsticeResult<Self> {
        config.validate()?;
        let root = canonical_root(&config)?;
        config.root = root.clone();
        let target = config.target_version()?;

        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        let mut remappings = stdlib::install(&data_dir.join(LIB_DIR))?;
        remappings.extend(config.resolved_remappings());

        let store = Store::open_in_memory()?;
        let metadata = data_dir.join(METADATA_FILE);
        if let Some(snapshot) = read_snapshot(&metadata)? {
            store.load_snapshot(&snapshot)?;
            info!(
                sources = snapshot.sources.len(),
                contracts = snapshot.contracts.len(),
                "metadata snapshot loaded"
            );
        }

        let artifacts = ArtifactLayout::new(data_dir.join(ARTIFACTS_DIR), &root, remappings.clone());
        debug!(root = %root.display(), %target, remappings = remappings.len(), "project opened");
        Ok(Self {
            config,
            root,
            data_dir,
            target,
            parser: SourceParser::new()?,
            store,
            remappings,
            artifacts,
            toolchain,
            compiler,
        })
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn remappings(&self) -> &RemappingTable {
        &self.remappings
    }

    pub fn toolchain(&self) -> &Arc<ToolchainManager> {
        &self.toolchain
    }

    pub fn target_version(&self) -> Version {
        self.target
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(METADATA_FILE)
    }

    pub fn artifacts(&self) -> &ArtifactLayout {
        &self.artifacts
    }

    /// Import graph over the sources currently in the store.
    pub fn graph(&self) -> SolsticeResult<DependencyGraph> {
        let sources = self.store.list_sources()?;
        DependencyGraph::from_sources(&sources, &self.remappings, &self.root)
    }

    pub fn inheritance_dot(&self) -> SolsticeResult<String> {
        Ok(inheritance_dot(&self.store.list_sources()?))
    }

    /// Run one incremental build.
    pub fn compile(&self) -> SolsticeResult<BuildReport> {
        let started = Instant::now();
        let mut report = BuildReport::default();

        // scan
        let files = scan_sources(&self.root, &self.config.contracts)?;
        let known = self.store.list_sources()?;
        let diffs = diff_sources(&files, &known, &self.root, &self.parser)?;
        self.store
            .apply_diffs_with(&diffs, |import| edge_target(import, &self.remappings, &self.root))?;
        for diff in diffs.iter().filter(|d| d.kind == DiffKind::Delete) {
            if let Err(e) = self.artifacts.remove_source(&SourceKey::from_path(&diff.path)) {
                warn!(path = %diff.path, error = %e, "failed to remove stale artifacts");
            }
        }
        report.diffs = diffs.iter().map(DiffEntry::from).collect();
        info!(files = files.len(), changed = diffs.len(), "scan complete");

        // graph
        let sources = self.store.list_sources()?;
        let graph = DependencyGraph::from_sources(&sources, &self.remappings, &self.root)?;
        let components = graph.components();
        let by_path: HashMap<String, &Source> = sources.iter().map(|s| (s.path(), s)).collect();
        debug!(
            vertices = graph.vertex_count(),
            edges = graph.edge_count(),
            components = components.len(),
            "dependency graph built"
        );

        // select
        let selected: Vec<&Component> = components
            .iter()
            .filter(|c| c.members.iter().any(|m| by_path.get(m).is_some_and(|s| s.tainted)))
            .collect();
        report.up_to_date = components.len() - selected.len();
        if selected.is_empty() {
            info!(components = components.len(), "nothing to compile");
        }

        let known_paths: HashSet<String> = by_path.keys().cloned().collect();
        let mut solc: Option<Result<PathBuf, String>> = None;
        for component in selected {
            let members: Vec<&Source> = component
                .members
                .iter()
                .filter_map(|m| by_path.get(m).copied())
                .collect();
            match self.build_component(component, &members, &known_paths, &mut solc) {
                Ok(unit) => {
                    info!(
                        unit = %unit.unit_id,
                        members = unit.members.len(),
                        contracts = unit.contracts.len(),
                        "component compiled"
                    );
                    report.compiled.push(unit);
                }
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    warn!(unit = %component.unit_id, %error, "component failed");
                    report.errors.push(ComponentError {
                        unit_id: component.unit_id.clone(),
                        component: component.members.clone(),
                        error,
                    });
                }
            }
        }

        // snapshot
        if !report.compiled.is_empty() || !diffs.is_empty() {
            write_snapshot(&self.metadata_path(), &self.store.snapshot()?)?;
            report.snapshot_written = true;
        }

        info!(
            compiled = report.compiled.len(),
            failed = report.errors.len(),
            up_to_date = report.up_to_date,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "build finished"
        );
        Ok(report)
    }

    fn build_component(
        &self,
        component: &Component,
        members: &[&Source],
        known_paths: &HashSet<String>,
        solc: &mut Option<Result<PathBuf, String>>,
    ) -> SolsticeResult<CompiledUnit> {
        for source in members {
            if let Some(import) = unresolved_imports(
                source,
                known_paths,
                &self.remappings,
                &self.root,
                &self.config.contracts,
            )
            .into_iter()
            .next()
            {
                return Err(SolsticeError::UnresolvedImport {
                    path: source.path(),
                    import,
                });
            }
        }

        // resolve
        let constraint = resolve_component(members, &self.target)?;
        debug!(unit = %component.unit_id, %constraint, "version constraint satisfied");

        // acquire, once per build
        let acquired = solc.get_or_insert_with(|| {
            self.toolchain.ensure(&self.target).map_err(|e| match e {
                SolsticeError::Download { reason, .. } => reason,
                other => other.to_string(),
            })
        });
        let binary = match acquired {
            Ok(path) => path.clone(),
            Err(reason) => {
                return Err(SolsticeError::Download {
                    version: self.target.to_string(),
                    reason: reason.clone(),
                })
            }
        };

        // invoke
        let input = CompileInput {
            version: self.target,
            files: component.members.clone(),
            remappings: self.remappings.to_args(),
            allow_paths: self.remappings.allow_paths(),
        };
        let output = self.compiler.compile(&binary, &input)?;
        let member_paths: HashSet<&str> = component.members.iter().map(String::as_str).collect();
        let contracts: Vec<Contract> = output
            .contracts()?
            .into_iter()
            .filter(|c| member_paths.contains(c.source_path().as_str()))
            .collect();
        let asts: BTreeMap<String, SourceAst> = output
            .source_asts()
            .into_iter()
            .filter(|(path, _)| member_paths.contains(path.as_str()))
            .collect();

        // commit
        let keys: Vec<SourceKey> = members.iter().map(|s| s.key()).collect();
        let snapshot: Vec<Source> = members.iter().map(|s| (*s).clone()).collect();
        let (_, taints_cleared) = self.artifacts.replace_component(&keys, &contracts, || {
            self.store.commit_component(&ComponentCommit {
                unit_id: &component.unit_id,
                members: &snapshot,
                contracts: &contracts,
                asts: &asts,
            })
        })?;

        Ok(CompiledUnit {
            unit_id: component.unit_id.clone(),
            members: component.members.clone(),
            contracts,
            taints_cleared,
        })
    }

    /// Remove artifacts and the snapshot and forget every record, so the
    /// next build starts from scratch.
    pub fn clean(&self) -> SolsticeResult<()> {
        self.artifacts.clear()?;
        match std::fs::remove_file(self.metadata_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.store.clear()?;
        info!(data_dir = %self.data_dir.display(), "project cleaned");
        Ok(())
    }
}

fn canonical_root(config: &ProjectConfig) -> SolsticeResult<PathBuf> {
    std::fs::canonicalize(&config.root).map_err(|e| {
        SolsticeError::Config(format!("project root {}: {e}", config.root.display()))
    })
}
