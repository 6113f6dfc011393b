//! Epics and stories — the planned, file-scoped units of change.
//!
//! Epics arrive from the planning agent as proposals, pass through the
//! resolver (validation, repository splitting, conflict checks), and are
//! then executed one branch per epic. A multi-repository epic is never
//! executed directly; the resolver splits it into single-repository
//! sub-epics.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epic {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files_to_read: Vec<String>,
    #[serde(default)]
    pub files_to_modify: Vec<String>,
    #[serde(default)]
    pub files_to_create: Vec<String>,
    /// Explicitly declared target repositories. When present the resolver
    /// trusts it instead of classifying file paths.
    #[serde(default)]
    pub affected_repositories: Vec<String>,
    /// Ids of epics that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub execution_order: u32,
    /// Shared-contract metadata inherited from the master planning artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<serde_json::Value>,
}

impl Epic {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            files_to_read: Vec::new(),
            files_to_modify: Vec::new(),
            files_to_create: Vec::new(),
            affected_repositories: Vec::new(),
            dependencies: Vec::new(),
            execution_order: 0,
            contract: None,
        }
    }

    pub fn with_files_to_read(mut self, files: Vec<String>) -> Self {
        self.files_to_read = files;
        self
    }

    pub fn with_files_to_modify(mut self, files: Vec<String>) -> Self {
        self.files_to_modify = files;
        self
    }

    pub fn with_files_to_create(mut self, files: Vec<String>) -> Self {
        self.files_to_create = files;
        self
    }

    pub fn with_repositories(mut self, repos: Vec<String>) -> Self {
        self.affected_repositories = repos;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_execution_order(mut self, order: u32) -> Self {
        self.execution_order = order;
        self
    }

    /// Every path the epic references, read set included.
    pub fn all_files(&self) -> impl Iterator<Item = &str> {
        self.files_to_read
            .iter()
            .chain(&self.files_to_modify)
            .chain(&self.files_to_create)
            .map(String::as_str)
    }

    pub fn file_count(&self) -> usize {
        self.files_to_read.len() + self.files_to_modify.len() + self.files_to_create.len()
    }

    /// Paths the epic writes: `files_to_modify ∪ files_to_create`.
    /// Read-only access never conflicts, so the read set is excluded.
    pub fn write_set(&self) -> BTreeSet<&str> {
        self.files_to_modify
            .iter()
            .chain(&self.files_to_create)
            .map(String::as_str)
            .collect()
    }

    pub fn depends_on(&self, other_id: &str) -> bool {
        self.dependencies.iter().any(|d| d == other_id)
    }
}

/// A smaller unit of work nested under an epic.
///
/// Stories are carried through the event log and register their own
/// branches, but the resolver operates at epic granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub epic_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
}

impl Story {
    pub fn new(id: &str, epic_id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            epic_id: epic_id.to_string(),
            title: title.to_string(),
            description: String::new(),
            files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_set_excludes_reads() {
        let epic = Epic::new("e1", "Refactor auth")
            .with_files_to_read(vec!["src/config.rs".into()])
            .with_files_to_modify(vec!["src/auth.rs".into()])
            .with_files_to_create(vec!["src/session.rs".into()]);

        let writes = epic.write_set();
        assert_eq!(writes.len(), 2);
        assert!(writes.contains("src/auth.rs"));
        assert!(writes.contains("src/session.rs"));
        assert!(!writes.contains("src/config.rs"));
    }

    #[test]
    fn test_file_count_covers_all_sets() {
        let epic = Epic::new("e1", "t")
            .with_files_to_read(vec!["a".into(), "b".into()])
            .with_files_to_modify(vec!["c".into()])
            .with_files_to_create(vec!["d".into()]);
        assert_eq!(epic.file_count(), 4);
        assert_eq!(epic.all_files().count(), 4);
    }

    #[test]
    fn test_epic_json_field_names_are_camel_case() {
        let epic = Epic::new("e1", "t").with_files_to_modify(vec!["src/user.ts".into()]);
        let json = serde_json::to_string(&epic).unwrap();
        assert!(json.contains("\"filesToModify\""));
        assert!(json.contains("\"affectedRepositories\""));
    }

    #[test]
    fn test_epic_deserializes_with_missing_optionals() {
        let json = r#"{"id": "e1", "title": "Add endpoint"}"#;
        let epic: Epic = serde_json::from_str(json).unwrap();
        assert_eq!(epic.file_count(), 0);
        assert!(epic.dependencies.is_empty());
        assert_eq!(epic.execution_order, 0);
        assert!(epic.contract.is_none());
    }

    #[test]
    fn test_depends_on() {
        let epic = Epic::new("e2", "t").with_dependencies(vec!["e1".into()]);
        assert!(epic.depends_on("e1"));
        assert!(!epic.depends_on("e3"));
    }
}
