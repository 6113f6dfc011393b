//! File-overlap conflict detection and soft domain-overlap warnings.
//!
//! Two epics assigned to the same repository must never write the same
//! file: that is a guaranteed downstream merge conflict. The registry
//! tracks accepted epics per repository and rejects any newcomer whose
//! write set intersects an existing one. Read sets never conflict.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::epic::Epic;

/// A write-set collision between two epics in the same repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConflict {
    pub repository: String,
    pub first_epic: String,
    pub second_epic: String,
    pub paths: Vec<String>,
}

impl fmt::Display for FileConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epics '{}' and '{}' both write {} in repository '{}'",
            self.first_epic,
            self.second_epic,
            self.paths.join(", "),
            self.repository
        )
    }
}

/// Epics in one repository whose titles overlap enough to suggest they are
/// really the same piece of work. Raised before file-level checks so the
/// corrective feedback leans toward merging or sequencing rather than
/// re-splitting blindly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainOverlapWarning {
    pub repository: String,
    pub first_epic: String,
    pub second_epic: String,
    pub shared_keywords: Vec<String>,
}

impl fmt::Display for DomainOverlapWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epics '{}' and '{}' in '{}' look likely to collide (shared: {})",
            self.first_epic,
            self.second_epic,
            self.repository,
            self.shared_keywords.join(", ")
        )
    }
}

/// Registry of accepted epics keyed by repository.
#[derive(Debug, Default)]
pub struct OverlapRegistry {
    accepted: HashMap<String, Vec<(String, BTreeSet<String>)>>,
}

impl OverlapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `epic` into `repository` unless its write set intersects an
    /// already-accepted epic's. On conflict the epic is NOT registered.
    pub fn try_accept(&mut self, repository: &str, epic: &Epic) -> Result<(), FileConflict> {
        let writes: BTreeSet<String> = epic.write_set().iter().map(|s| s.to_string()).collect();

        if let Some(existing) = self.accepted.get(repository) {
            for (other_id, other_writes) in existing {
                let overlap: Vec<String> =
                    writes.intersection(other_writes).cloned().collect();
                if !overlap.is_empty() {
                    return Err(FileConflict {
                        repository: repository.to_string(),
                        first_epic: other_id.clone(),
                        second_epic: epic.id.clone(),
                        paths: overlap,
                    });
                }
            }
        }

        self.accepted
            .entry(repository.to_string())
            .or_default()
            .push((epic.id.clone(), writes));
        Ok(())
    }

    pub fn accepted_count(&self, repository: &str) -> usize {
        self.accepted.get(repository).map_or(0, Vec::len)
    }
}

/// Words too generic to signal shared domain.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "into", "add", "adds", "new", "update", "support",
    "implement", "create", "fix", "epic",
];

/// Lowercased, stopword-filtered keywords of a title.
pub fn significant_keywords(title: &str) -> BTreeSet<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Fraction of the smaller keyword set shared between two titles.
pub fn keyword_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / smaller as f64
}

/// Flag same-repository epic pairs whose titles share ≥50% of their
/// significant keywords.
pub fn detect_domain_overlaps(assigned: &[(String, &Epic)]) -> Vec<DomainOverlapWarning> {
    let mut warnings = Vec::new();
    let keywords: Vec<BTreeSet<String>> = assigned
        .iter()
        .map(|(_, epic)| significant_keywords(&epic.title))
        .collect();

    for i in 0..assigned.len() {
        for j in (i + 1)..assigned.len() {
            if assigned[i].0 != assigned[j].0 {
                continue;
            }
            if keyword_overlap(&keywords[i], &keywords[j]) >= 0.5 {
                warnings.push(DomainOverlapWarning {
                    repository: assigned[i].0.clone(),
                    first_epic: assigned[i].1.id.clone(),
                    second_epic: assigned[j].1.id.clone(),
                    shared_keywords: keywords[i]
                        .intersection(&keywords[j])
                        .cloned()
                        .collect(),
                });
            }
        }
    }
    warnings
}
