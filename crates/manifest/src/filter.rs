//! Include/exclude filtering of root-relative paths.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Include everything when no include patterns are configured.
pub const DEFAULT_INCLUDE: &str = "**/*";

/// Shell-glob semantics: `*` and `?` never cross a `/`, `**` does.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Serializable glob configuration, `{"include": [...], "exclude": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}
impl Default for GlobConfig {
    fn default() -> Self {
        Self {
            include: vec![DEFAULT_INCLUDE.to_string()],
            exclude: Vec::new(),
        }
    }
}

impl GlobConfig {
    /// Parse a glob configuration given either as inline JSON or as the path
    /// of a file containing JSON. Missing keys keep their defaults; empty
    /// input yields the default configuration.
    ///
    /// ```
    /// use jattach_manifest::GlobConfig;
    /// let config = GlobConfig::from_input(r#"{"exclude": ["*.tmp"]}"#).unwrap();
    /// assert_eq!(config.include, vec!["**/*"]);
    /// assert_eq!(config.exclude, vec!["*.tmp"]);
    /// assert!(GlobConfig::from_input("not json").is_err());
    /// ```
    pub fn from_input(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let candidate = Path::new(trimmed);
        let text = match candidate.is_file() {
            true => std::fs::read_to_string(candidate).map_err(|source| ErrorKind::File {
                path: candidate.to_path_buf(),
                source,
            })?,
            false => trimmed.to_string(),
        };
        serde_json::from_str(&text).or_raise(|| ErrorKind::GlobInput(trimmed.to_string()))
    }

    /// Compile the patterns.
    pub fn compile(&self) -> Result<GlobFilter> {
        GlobFilter::new(&self.include, &self.exclude)
    }
}

/// Compiled include/exclude filter. Exclusion takes precedence; an empty
/// include list includes everything.
#[derive(Debug, Clone, Default)]
pub struct GlobFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl GlobFilter {
    pub fn new(include: &[impl AsRef<str>], exclude: &[impl AsRef<str>]) -> Result<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Accept everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Whether a root-relative, `/`-separated path is selected.
    pub fn matches(&self, path: &str) -> bool {
        if self.exclude.iter().any(|p| p.matches_with(path, MATCH_OPTIONS)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches_with(path, MATCH_OPTIONS))
    }
}

fn compile(patterns: &[impl AsRef<str>]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|pattern| {
            let pattern = pattern.as_ref();
            Pattern::new(pattern).or_raise(|| ErrorKind::InvalidGlob(pattern.to_string()))
        })
        .collect()
}
