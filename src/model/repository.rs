//! Target repository configuration and path affinity.
//!
//! Repositories are immutable configuration loaded once per task. Each one
//! carries glob patterns used to classify file paths; the most specific
//! (longest) matching pattern wins when several repositories claim a path.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryKind {
    Backend,
    Frontend,
    Mobile,
    Shared,
}

impl RepositoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Mobile => "mobile",
            Self::Shared => "shared",
        }
    }

    /// Default execution rank when no explicit order is configured:
    /// backend before frontend before mobile before shared.
    pub fn default_rank(&self) -> u32 {
        match self {
            Self::Backend => 1,
            Self::Frontend => 2,
            Self::Mobile => 3,
            Self::Shared => 4,
        }
    }
}

impl FromStr for RepositoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backend" => Ok(Self::Backend),
            "frontend" => Ok(Self::Frontend),
            "mobile" => Ok(Self::Mobile),
            "shared" => Ok(Self::Shared),
            _ => Err(format!("Invalid repository kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub kind: RepositoryKind,
    /// Explicit execution order. Falls back to the kind's default rank.
    #[serde(default)]
    pub execution_order: Option<u32>,
    /// Glob patterns for path classification, e.g. `backend/**` or `api/**/*.go`.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Repository {
    pub fn new(name: &str, kind: RepositoryKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            execution_order: None,
            patterns: Vec::new(),
        }
    }

    pub fn with_execution_order(mut self, order: u32) -> Self {
        self.execution_order = Some(order);
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn effective_order(&self) -> u32 {
        self.execution_order.unwrap_or_else(|| self.kind.default_rank())
    }

    /// Length of the most specific pattern matching `path`, if any.
    ///
    /// Pattern length is the specificity measure: `backend/api/**` beats
    /// `backend/**`. Invalid patterns are skipped rather than failing the
    /// whole classification.
    pub fn match_specificity(&self, path: &str) -> Option<usize> {
        self.patterns
            .iter()
            .filter_map(|p| {
                let pattern = glob::Pattern::new(p).ok()?;
                pattern.matches(path).then(|| p.len())
            })
            .max()
    }
}

/// Classify a path against a repository topology. Returns the repository
/// with the most specific matching pattern.
pub fn classify_path<'a>(repositories: &'a [Repository], path: &str) -> Option<&'a Repository> {
    repositories
        .iter()
        .filter_map(|repo| repo.match_specificity(path).map(|len| (len, repo)))
        .max_by(|a, b| {
            // Tie-break on execution order so classification is deterministic.
            a.0.cmp(&b.0)
                .then_with(|| b.1.effective_order().cmp(&a.1.effective_order()))
        })
        .map(|(_, repo)| repo)
}
