//! External compiler invocation and `--combined-json` output decoding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::{SolsticeError, SolsticeResult};
use crate::models::{Contract, SourceKey};
use crate::toolchain::version::Version;

const COMBINED_JSON_FIELDS: &str = "abi,bin,bin-runtime,srcmap,srcmap-runtime,ast";

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything needed to compile one component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileInput {
    pub version: Version,
    /// Root-relative member paths, sorted.
    pub files: Vec<String>,
    /// `name=path` remapping arguments, sorted by name.
    pub remappings: Vec<String>,
    pub allow_paths: Vec<PathBuf>,
}

/// Seam between the orchestrator and the compiler process.
pub trait Compiler: Send + Sync {
    fn compile(&self, solc: &Path, input: &CompileInput) -> SolsticeResult<CompilerOutput>;
}

/// Runs a `solc` binary as a child process from the project root.
pub struct SolcCompiler {
    working_dir: PathBuf,
}

impl SolcCompiler {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn args(input: &CompileInput) -> Vec<String> {
        let mut args = vec!["--combined-json".to_string(), COMBINED_JSON_FIELDS.to_string()];
        if !input.allow_paths.is_empty() {
            let joined: Vec<String> = input
                .allow_paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            args.push("--allow-paths".to_string());
            args.push(joined.join(","));
        }
        args.extend(input.remappings.iter().cloned());
        args.extend(input.files.iter().cloned());
        args
    }
}

impl Compiler for SolcCompiler {
    fn compile(&self, solc: &Path, input: &CompileInput) -> SolsticeResult<CompilerOutput> {
        let args = Self::args(input);
        debug!(solc = %solc.display(), files = input.files.len(), "invoking compiler");
        let output = Command::new(solc)
            .current_dir(&self.working_dir)
            .args(&args)
            .output()
            .map_err(|e| SolsticeError::Compile {
                stderr: format!("failed to run {}: {e}", solc.display()),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SolsticeError::Compile {
                stderr: if stderr.is_empty() {
                    format!("compiler exited with {}", output.status)
                } else {
                    stderr
                },
            });
        }
        CompilerOutput::parse(&output.stdout)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CompilerOutput {
    #[serde(default, alias = "Contracts")]
    pub contracts: IndexMap<String, CompiledContract>,
    #[serde(default, alias = "Sources")]
    pub sources: IndexMap<String, CompiledSource>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CompiledContract {
    /// A JSON string on older compilers, an array on newer ones.
    #[serde(default)]
    pub abi: Value,
    #[serde(default)]
    pub bin: String,
    #[serde(default, rename = "bin-runtime")]
    pub bin_runtime: String,
    #[serde(default, rename = "srcmap")]
    pub src_map: String,
    #[serde(default, rename = "srcmap-runtime")]
    pub src_map_runtime: String,
}

impl CompiledContract {
    pub fn abi_json(&self) -> String {
        match &self.abi {
            Value::String(text) => text.clone(),
            Value::Null => "[]".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CompiledSource {
    #[serde(default, rename = "AST", alias = "ast")]
    pub ast: Option<Value>,
}

/// Split `"<path>:<Name>"`. Paths may contain `:` so the last one wins.
pub fn split_contract_key(key: &str) -> Option<(&str, &str)> {
    key.rsplit_once(':')
        .filter(|(path, name)| !path.is_empty() && !name.is_empty())
}

impl CompilerOutput {
    pub fn parse(stdout: &[u8]) -> SolsticeResult<Self> {
        serde_json::from_slice(stdout).map_err(|e| SolsticeError::Compile {
            stderr: format!("malformed compiler output: {e}"),
        })
    }

    /// Every emitted contract as a store record.
    pub fn contracts(&self) -> SolsticeResult<Vec<Contract>> {
        let mut out = Vec::with_capacity(self.contracts.len());
        for (key, compiled) in &self.contracts {
            let (path, name) = split_contract_key(key).ok_or_else(|| SolsticeError::Compile {
                stderr: format!("malformed contract key {key:?}"),
            })?;
            let source = SourceKey::from_path(path);
            out.push(Contract {
                dir: source.dir,
                filename: source.filename,
                name: name.to_string(),
                abi: compiled.abi_json(),
                bin: compiled.bin.clone(),
                bin_runtime: compiled.bin_runtime.clone(),
                src_map: compiled.src_map.clone(),
                src_map_runtime: compiled.src_map_runtime.clone(),
            });
        }
        Ok(out)
    }

    /// Typed AST summaries keyed by source path. Sources whose AST is
    /// missing or not understood are left out.
    pub fn source_asts(&self) -> BTreeMap<String, SourceAst> {
        self.sources
            .iter()
            .filter_map(|(path, source)| {
                let ast = SourceAst::from_json(source.ast.as_ref()?)?;
                Some((path.clone(), ast))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// AST summary
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractKind {
    #[default]
    Contract,
    Abstract,
    Interface,
    Library,
}

impl ContractKind {
    fn from_attrs(kind: Option<&str>, is_abstract: bool) -> Self {
        match kind {
            Some("interface") => ContractKind::Interface,
            Some("library") => ContractKind::Library,
            _ if is_abstract => ContractKind::Abstract,
            _ => ContractKind::Contract,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContractDefinition {
    pub name: String,
    pub kind: ContractKind,
    /// Names of inherited contracts, in declaration order.
    #[serde(default)]
    pub bases: Vec<String>,
}

/// The subset of a source's syntax tree the build keeps: its contract
/// definitions and their inheritance specifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SourceAst {
    #[serde(default)]
    pub contracts: Vec<ContractDefinition>,
}

impl SourceAst {
    /// Decode either the compact (`nodeType`) or the legacy
    /// (`name`/`attributes`/`children`) AST format.
    pub fn from_json(value: &Value) -> Option<Self> {
        if value.get("nodeType").is_some() {
            let node: CompactNode = serde_json::from_value(value.clone()).ok()?;
            Some(node.summary())
        } else if value.get("name").is_some() {
            let node: LegacyNode = serde_json::from_value(value.clone()).ok()?;
            Some(node.summary())
        } else {
            None
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "nodeType")]
enum CompactNode {
    SourceUnit {
        #[serde(default)]
        nodes: Vec<CompactNode>,
    },
    ContractDefinition {
        name: String,
        #[serde(default, rename = "contractKind")]
        contract_kind: Option<String>,
        #[serde(default, rename = "abstract")]
        is_abstract: bool,
        #[serde(default, rename = "baseContracts")]
        base_contracts: Vec<CompactInheritance>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct CompactInheritance {
    #[serde(rename = "baseName")]
    base_name: CompactTypeName,
}

#[derive(Deserialize)]
struct CompactTypeName {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "namePath")]
    name_path: Option<String>,
}

impl CompactNode {
    fn summary(self) -> SourceAst {
        let mut contracts = Vec::new();
        self.collect(&mut contracts);
        SourceAst { contracts }
    }

    fn collect(self, out: &mut Vec<ContractDefinition>) {
        match self {
            CompactNode::SourceUnit { nodes } => {
                for node in nodes {
                    node.collect(out);
                }
            }
            CompactNode::ContractDefinition {
                name,
                contract_kind,
                is_abstract,
                base_contracts,
            } => out.push(ContractDefinition {
                name,
                kind: ContractKind::from_attrs(contract_kind.as_deref(), is_abstract),
                bases: base_contracts
                    .into_iter()
                    .filter_map(|b| b.base_name.name.or(b.base_name.name_path))
                    .collect(),
            }),
            CompactNode::Other => {}
        }
    }
}

#[derive(Deserialize)]
struct LegacyNode {
    name: String,
    #[serde(default)]
    attributes: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    children: Vec<LegacyNode>,
}

impl LegacyNode {
    fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.as_ref()?.get(key)?.as_str()
    }

    fn summary(&self) -> SourceAst {
        let mut contracts = Vec::new();
        self.collect(&mut contracts);
        SourceAst { contracts }
    }

    fn collect(&self, out: &mut Vec<ContractDefinition>) {
        if self.name != "ContractDefinition" {
            for child in &self.children {
                child.collect(out);
            }
            return;
        }
        let Some(name) = self.attr_str("name") else {
            return;
        };
        let is_abstract = self
            .attributes
            .as_ref()
            .and_then(|a| a.get("abstract"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let bases = self
            .children
            .iter()
            .filter(|c| c.name == "InheritanceSpecifier")
            .filter_map(|spec| spec.children.first()?.attr_str("name"))
            .map(String::from)
            .collect();
        out.push(ContractDefinition {
            name: name.to_string(),
            kind: ContractKind::from_attrs(self.attr_str("contractKind"), is_abstract),
            bases,
        });
    }
}
