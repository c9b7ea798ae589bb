//! Project configuration.
//!
//! A project is described by a `solstice.toml` (or `.json`) file. Missing
//! fields take defaults; a handful of `SOLSTICE_*` environment variables
//! override the file at load time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{SolsticeError, SolsticeResult};
use crate::toolchain::version::Version;

pub const DEFAULT_CONTRACTS_DIR: &str = "contracts";
pub const DEFAULT_SOLIDITY_VERSION: &str = "0.8.4";
pub const DEFAULT_DATA_DIR: &str = ".solstice";
pub const DEFAULT_RELEASE_URL: &str =
    "https://github.com/ethereum/solidity/releases/download/v{version}/solc-static-linux";

const ENV_SOLC_VERSION: &str = "SOLSTICE_SOLC_VERSION";
const ENV_CACHE_DIR: &str = "SOLSTICE_CACHE_DIR";
const ENV_RELEASE_URL: &str = "SOLSTICE_RELEASE_URL";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Project root. Relative paths elsewhere in the config resolve against it.
    pub root: PathBuf,
    /// Contracts directory, relative to `root`.
    pub contracts: String,
    /// Target compiler version.
    pub solidity: String,
    /// Build output + metadata directory; `<root>/.solstice` when unset.
    pub data_dir: Option<PathBuf>,
    /// Compiler cache; `~/.solstice/solc` when unset.
    pub cache_dir: Option<PathBuf>,
    /// Release asset URL template, `{version}` is substituted.
    pub release_url: String,
    /// User remappings: symbolic import prefix to filesystem path.
    pub remappings: BTreeMap<String, PathBuf>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            contracts: DEFAULT_CONTRACTS_DIR.to_string(),
            solidity: DEFAULT_SOLIDITY_VERSION.to_string(),
            data_dir: None,
            cache_dir: None,
            release_url: DEFAULT_RELEASE_URL.to_string(),
            remappings: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    /// Default configuration rooted at `root`.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load a config file (`.toml` or `.json`), apply environment overrides
    /// and validate. When the file does not name a root, its parent
    /// directory is used.
    pub fn load(path: &Path) -> SolsticeResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SolsticeError::Config(format!("read {}: {e}", path.display())))?;
        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            _ => {
                return Err(SolsticeError::Config(format!(
                    "suffix of {} is neither toml nor json",
                    path.display()
                )))
            }
        };
        if config.root == Path::new(".") {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                config.root = parent.to_path_buf();
            }
        }
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> SolsticeResult<Self> {
        toml::from_str(content).map_err(|e| SolsticeError::Config(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> SolsticeResult<Self> {
        serde_json::from_str(content).map_err(|e| SolsticeError::Config(e.to_string()))
    }

    /// Apply `SOLSTICE_*` overrides using the given variable lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(version) = non_empty(ENV_SOLC_VERSION) {
            self.solidity = version;
        }
        if let Some(dir) = non_empty(ENV_CACHE_DIR) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = non_empty(ENV_RELEASE_URL) {
            self.release_url = url;
        }
    }

    /// Overlay `other` on top of `self`: every field of `other` that differs
    /// from the default wins, remapping tables are unioned.
    pub fn merge(&mut self, other: &ProjectConfig) {
        let defaults = ProjectConfig::default();
        if other.root != defaults.root {
            self.root = other.root.clone();
        }
        if other.contracts != defaults.contracts {
            self.contracts = other.contracts.clone();
        }
        if other.solidity != defaults.solidity {
            self.solidity = other.solidity.clone();
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir.clone();
        }
        if other.cache_dir.is_some() {
            self.cache_dir = other.cache_dir.clone();
        }
        if other.release_url != defaults.release_url {
            self.release_url = other.release_url.clone();
        }
        for (name, path) in &other.remappings {
            self.remappings.insert(name.clone(), path.clone());
        }
    }

    pub fn validate(&self) -> SolsticeResult<()> {
        self.target_version()?;
        if self.contracts.trim().is_empty() {
            return Err(SolsticeError::Config("contracts directory is empty".into()));
        }
        if !self.release_url.contains("{version}") {
            return Err(SolsticeError::Config(format!(
                "release url {:?} has no {{version}} placeholder",
                self.release_url
            )));
        }
        for name in self.remappings.keys() {
            if name.is_empty() || name.contains('=') {
                return Err(SolsticeError::Config(format!("invalid remapping name {name:?}")));
            }
        }
        Ok(())
    }

    pub fn target_version(&self) -> SolsticeResult<Version> {
        Version::parse(&self.solidity).map_err(|_| {
            SolsticeError::Config(format!("invalid solidity version {:?}", self.solidity))
        })
    }

    pub fn contracts_root(&self) -> PathBuf {
        self.root.join(&self.contracts)
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.root.join(dir),
            None => self.root.join(DEFAULT_DATA_DIR),
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return expand_tilde(dir);
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(DEFAULT_DATA_DIR).join("solc"),
            None => self.data_dir().join("solc"),
        }
    }

    /// User remappings with relative targets resolved against the root.
    pub fn resolved_remappings(&self) -> BTreeMap<String, PathBuf> {
        self.remappings
            .iter()
            .map(|(name, path)| {
                let path = expand_tilde(path);
                let path = if path.is_absolute() {
                    path
                } else {
                    self.root.join(path)
                };
                (name.clone(), path)
            })
            .collect()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    if raw == "~" || raw.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if raw.len() > 2 {
                expanded.push(&raw[2..]);
            }
            return expanded;
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ProjectConfig::default();
        assert_eq!(config.contracts, "contracts");
        assert_eq!(config.solidity, "0.8.4");
        config.validate().unwrap();
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = ProjectConfig::from_toml_str(
            r#"
contracts = "src"
solidity = "0.8.5"

[remappings]
"@openzeppelin/contracts" = "lib/openzeppelin"
"#,
        )
        .unwrap();
        assert_eq!(config.contracts, "src");
        assert_eq!(config.solidity, "0.8.5");
        assert_eq!(
            config.remappings.get("@openzeppelin/contracts"),
            Some(&PathBuf::from("lib/openzeppelin"))
        );
    }

    #[test]
    fn json_config_parses() {
        let config =
            ProjectConfig::from_json_str(r#"{"contracts": "sol", "solidity": "0.7.6"}"#).unwrap();
        assert_eq!(config.contracts, "sol");
        assert_eq!(config.solidity, "0.7.6");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ProjectConfig::from_toml_str("colour = \"blue\"").unwrap_err();
        assert!(matches!(err, SolsticeError::Config(_)));
    }

    #[test]
    fn load_rejects_unknown_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solstice.hcl");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            ProjectConfig::load(&path),
            Err(SolsticeError::Config(_))
        ));
    }

    #[test]
    fn load_uses_file_parent_as_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solstice.toml");
        std::fs::write(&path, "solidity = \"0.8.5\"\n").unwrap();
        let config = ProjectConfig::load(&path).unwrap();
        assert_eq!(config.root, dir.path());
        assert_eq!(config.contracts_root(), dir.path().join("contracts"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = ProjectConfig::default();
        config.apply_env_overrides(|key| match key {
            "SOLSTICE_SOLC_VERSION" => Some("0.8.19".into()),
            "SOLSTICE_CACHE_DIR" => Some("/tmp/solc-cache".into()),
            "SOLSTICE_RELEASE_URL" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(config.solidity, "0.8.19");
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/solc-cache"));
        assert_eq!(config.release_url, DEFAULT_RELEASE_URL);
    }

    #[test]
    fn merge_prefers_overlay_and_unions_remappings() {
        let mut base = ProjectConfig::default();
        base.remappings.insert("a".into(), PathBuf::from("/a"));
        let mut overlay = ProjectConfig::default();
        overlay.solidity = "0.8.5".into();
        overlay.remappings.insert("b".into(), PathBuf::from("/b"));
        base.merge(&overlay);
        assert_eq!(base.solidity, "0.8.5");
        assert_eq!(base.contracts, "contracts");
        assert_eq!(base.remappings.len(), 2);
    }

    #[test]
    fn invalid_version_fails_validation() {
        let mut config = ProjectConfig::default();
        config.solidity = "latest".into();
        assert!(matches!(config.validate(), Err(SolsticeError::Config(_))));
    }

    #[test]
    fn relative_remappings_resolve_against_root() {
        let mut config = ProjectConfig::for_root("/work/project");
        config
            .remappings
            .insert("lib".into(), PathBuf::from("vendor/lib"));
        let resolved = config.resolved_remappings();
        assert_eq!(resolved["lib"], PathBuf::from("/work/project/vendor/lib"));
    }

    #[test]
    fn data_dir_defaults_under_root() {
        let config = ProjectConfig::for_root("/work/project");
        assert_eq!(config.data_dir(), PathBuf::from("/work/project/.solstice"));
    }
}
