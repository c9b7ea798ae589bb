//! Import and version-pragma extraction from raw Solidity text.

use std::borrow::Cow;

use regex::{Captures, Regex};
use tracing::warn;

use crate::errors::{SolsticeError, SolsticeResult};
use crate::indexer::imports::normalize_import;
use crate::models::{Source, SourceKey};

// String literals are matched first so comment markers inside them survive.
const COMMENT_PATTERN: &str = r#"(?s)("(?:[^"\\\n]|\\.)*"|'(?:[^'\\\n]|\\.)*')|//[^\n]*|/\*.*?\*/"#;
const IMPORT_PATTERN: &str = r#"\bimport\s+(?:[^;"']*?\bfrom\s+)?["']([^"']+)["']"#;
const PRAGMA_PATTERN: &str = r"\bpragma\s+solidity\s+([^;]+);";

/// Pattern-based parser, compiled once per project.
pub struct SourceParser {
    comment_re: Regex,
    import_re: Regex,
    pragma_re: Regex,
}

impl SourceParser {
    pub fn new() -> SolsticeResult<Self> {
        Ok(Self {
            comment_re: Regex::new(COMMENT_PATTERN)?,
            import_re: Regex::new(IMPORT_PATTERN)?,
            pragma_re: Regex::new(PRAGMA_PATTERN)?,
        })
    }

    /// Blank out `//` and `/* */` comments, leaving string literals alone.
    pub fn strip_comments<'a>(&self, content: &'a str) -> Cow<'a, str> {
        self.comment_re.replace_all(content, |caps: &Captures| match caps.get(1) {
            Some(literal) => literal.as_str().to_string(),
            None => " ".to_string(),
        })
    }

    /// Import strings in source order, exactly as written.
    pub fn parse_imports(&self, content: &str) -> Vec<String> {
        let code = self.strip_comments(content);
        self.import_re
            .captures_iter(&code)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Pragma constraint tokens, or `None` without a `pragma solidity`.
    /// Several pragmas are concatenated, which intersects them.
    pub fn parse_pragma(&self, content: &str) -> Option<Vec<String>> {
        let code = self.strip_comments(content);
        let tokens: Vec<String> = self
            .pragma_re
            .captures_iter(&code)
            .filter_map(|caps| caps.get(1))
            .flat_map(|m| m.as_str().split_whitespace().map(String::from).collect::<Vec<_>>())
            .collect();
        if tokens.is_empty() {
            None
        } else {
            Some(tokens)
        }
    }

    pub fn require_pragma(&self, path: &str, content: &str) -> SolsticeResult<Vec<String>> {
        self.parse_pragma(content)
            .ok_or_else(|| SolsticeError::MissingPragma(path.to_string()))
    }

    /// Build a tainted [`Source`] for `path` from its content.
    ///
    /// A missing pragma is not fatal here: the record is kept with an empty
    /// version so that the failure surfaces on its component only.
    pub fn parse_source(&self, path: &str, mod_time: i64, content: &str) -> Source {
        let key = SourceKey::from_path(path);
        let version = match self.require_pragma(path, content) {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(%path, error = %err, "source has no version pragma");
                Vec::new()
            }
        };
        let imports = self
            .parse_imports(content)
            .iter()
            .map(|raw| normalize_import(&key.dir, raw))
            .collect();
        Source {
            dir: key.dir,
            filename: key.filename,
            mod_time,
            tainted: true,
            version,
            imports,
            ast: None,
            unit: None,
        }
    }
}
