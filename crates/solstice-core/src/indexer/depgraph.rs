//! Import graph over tracked sources and component detection.
//!
//! Vertices live in an arena indexed by `usize`; adjacency is kept in both
//! directions so traversals can walk towards importers or imports.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::{SolsticeError, SolsticeResult};
use crate::indexer::imports::{edge_target, RemappingTable};
use crate::models::Source;

const UNIT_ID_LEN: usize = 16;

/// A maximal set of sources connected by imports in either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Component {
    /// Member paths, sorted.
    pub members: Vec<String>,
    pub unit_id: String,
}

impl Component {
    pub fn new(mut members: Vec<String>) -> Self {
        members.sort();
        members.dedup();
        let unit_id = unit_id(&members);
        Self { members, unit_id }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.members.binary_search_by(|m| m.as_str().cmp(path)).is_ok()
    }
}

/// Build-unit id: leading hex digits of the SHA-256 over sorted member paths.
pub fn unit_id(sorted_members: &[String]) -> String {
    let mut hasher = Sha256::new();
    for member in sorted_members {
        hasher.update(member.as_bytes());
        hasher.update(b"\n");
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..UNIT_ID_LEN].to_string()
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    vertices: Vec<String>,
    index: HashMap<String, usize>,
    outbound: Vec<BTreeSet<usize>>,
    inbound: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph over `sources` with one edge per import that resolves to
    /// another tracked source. Unresolvable imports are skipped here; they
    /// are reported per component by the caller.
    pub fn from_sources(
        sources: &[Source],
        remappings: &RemappingTable,
        project_root: &Path,
    ) -> SolsticeResult<Self> {
        let mut graph = Self::new();
        for source in sources {
            graph.add_vertex(&source.path());
        }
        for source in sources {
            let from = source.path();
            for import in &source.imports {
                let Some(target) = edge_target(import, remappings, project_root) else {
                    continue;
                };
                if graph.contains(&target) {
                    graph.add_edge(&from, &target)?;
                }
            }
        }
        Ok(graph)
    }

    pub fn add_vertex(&mut self, path: &str) -> usize {
        if let Some(&id) = self.index.get(path) {
            return id;
        }
        let id = self.vertices.len();
        self.vertices.push(path.to_string());
        self.index.insert(path.to_string(), id);
        self.outbound.push(BTreeSet::new());
        self.inbound.push(BTreeSet::new());
        id
    }

    /// Record that `from` imports `to`. Both must already be vertices.
    pub fn add_edge(&mut self, from: &str, to: &str) -> SolsticeResult<()> {
        let src = self.id(from)?;
        let dst = self.id(to)?;
        if src != dst {
            self.outbound[src].insert(dst);
            self.inbound[dst].insert(src);
        }
        Ok(())
    }

    fn id(&self, path: &str) -> SolsticeResult<usize> {
        self.index
            .get(path)
            .copied()
            .ok_or_else(|| SolsticeError::Graph(format!("unknown vertex {path}")))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.outbound.iter().map(BTreeSet::len).sum()
    }

    /// Vertex paths in arena order.
    pub fn vertices(&self) -> impl Iterator<Item = &str> {
        self.vertices.iter().map(String::as_str)
    }

    /// Weakly connected components, sorted by first member.
    ///
    /// Traversal starts from every vertex without importers, then from any
    /// vertex still unvisited so pure cycles are covered too. Every vertex
    /// ends up in exactly one component.
    pub fn components(&self) -> Vec<Component> {
        let n = self.vertices.len();
        let mut visited = vec![false; n];
        let mut components = Vec::new();
        let roots = (0..n).filter(|&v| self.inbound[v].is_empty());

        for start in roots.chain(0..n) {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            let mut queue = VecDeque::from([start]);
            let mut members = Vec::new();
            while let Some(v) = queue.pop_front() {
                members.push(self.vertices[v].clone());
                for &next in self.outbound[v].iter().chain(self.inbound[v].iter()) {
                    if !visited[next] {
                        visited[next] = true;
                        queue.push_back(next);
                    }
                }
            }
            components.push(Component::new(members));
        }
        components.sort_by(|a, b| a.members.cmp(&b.members));
        components
    }

    fn reachable(&self, path: &str, adjacency: &[BTreeSet<usize>]) -> SolsticeResult<Vec<String>> {
        let start = self.id(path)?;
        let mut seen = vec![false; self.vertices.len()];
        seen[start] = true;
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(v) = queue.pop_front() {
            for &next in &adjacency[v] {
                if !seen[next] {
                    seen[next] = true;
                    out.push(self.vertices[next].clone());
                    queue.push_back(next);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Everything `path` imports, transitively.
    pub fn dependencies_of(&self, path: &str) -> SolsticeResult<Vec<String>> {
        self.reachable(path, &self.outbound)
    }

    /// Everything that imports `path`, transitively.
    pub fn dependents_of(&self, path: &str) -> SolsticeResult<Vec<String>> {
        self.reachable(path, &self.inbound)
    }
}

/// Contract inheritance from stored AST summaries as Graphviz DOT.
///
/// Nodes are keyed `path:Name` so equally named contracts in different
/// files stay apart. A base name resolves to the declaring file itself, then
/// to a locally imported file, then to the only declaration in the project;
/// anything else is drawn as a bare-name node.
pub fn inheritance_dot(sources: &[Source]) -> String {
    let paths: Vec<String> = sources.iter().map(Source::path).collect();
    let mut declared: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (source, path) in sources.iter().zip(&paths) {
        let Some(ast) = &source.ast else { continue };
        for contract in &ast.contracts {
            declared.entry(contract.name.as_str()).or_default().push(path);
        }
    }

    let mut nodes: BTreeMap<String, (&str, &str)> = BTreeMap::new();
    let mut edges: BTreeSet<(String, String)> = BTreeSet::new();
    for (source, path) in sources.iter().zip(&paths) {
        let Some(ast) = &source.ast else { continue };
        let imported: Vec<&str> = source.local_imports().collect();
        for contract in &ast.contracts {
            let id = node_id(path, &contract.name);
            nodes.insert(id.clone(), (contract.name.as_str(), path.as_str()));
            for base in &contract.bases {
                let candidates = declared.get(base.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                let owner = candidates
                    .iter()
                    .find(|p| **p == path.as_str())
                    .or_else(|| candidates.iter().find(|p| imported.contains(*p)))
                    .or(if candidates.len() == 1 { candidates.first() } else { None });
                let target = match owner {
                    Some(owner) => node_id(owner, base),
                    None => base.clone(),
                };
                edges.insert((id.clone(), target));
            }
        }
    }

    let mut dot = String::from("digraph inheritance {\n");
    for (id, (name, path)) in &nodes {
        let _ = writeln!(dot, "  {id:?} [label={name:?}, tooltip={path:?}];");
    }
    for (from, to) in &edges {
        let _ = writeln!(dot, "  {from:?} -> {to:?};");
    }
    dot.push_str("}\n");
    dot
}

fn node_id(path: &str, name: &str) -> String {
    format!("{path}:{name}")
}
