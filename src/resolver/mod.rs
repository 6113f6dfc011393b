//! Epic dependency and conflict resolution.
//!
//! Takes the planning agent's proposed epics plus the repository topology
//! and produces a validated, repository-partitioned, dependency-ordered
//! list — or a typed rejection the planning phase feeds back into a bounded
//! retry loop.
//!
//! Stages, in order:
//! 1. batch validation (zero files, placeholder paths)
//! 2. repository affinity (declared list trusted, else pattern classification)
//! 3. splitting of multi-repository epics into per-repository sub-epics
//! 4. soft domain-overlap warnings (runs before file-level checks)
//! 5. write-set conflict detection per repository
//! 6. final ascending sort by execution order

pub mod conflict;
pub mod validation;

use std::collections::BTreeMap;

use thiserror::Error;

pub use conflict::{DomainOverlapWarning, FileConflict, OverlapRegistry};
pub use validation::{ValidationFailure, ValidationReason};

use crate::model::epic::Epic;
use crate::model::repository::{classify_path, Repository};

/// Typed rejection from the resolver. Both variants carry every problem
/// found, so one feedback round can address them all.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("epic validation failed: {}", format_list(.failures))]
    Validation { failures: Vec<ValidationFailure> },

    #[error("file conflicts between parallel epics: {}", format_list(.conflicts))]
    Conflict {
        conflicts: Vec<FileConflict>,
        /// Domain-overlap warnings observed in the same pass; included so
        /// corrective feedback can suggest merging over re-splitting.
        warnings: Vec<DomainOverlapWarning>,
    },
}

impl ResolveError {
    /// Whether this rejection must block orchestration once retries are
    /// exhausted. Conflicts always block; validation blocks only when a
    /// zero-file failure remains.
    pub fn is_blocking(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Validation { failures } => failures.iter().any(|f| f.reason.is_blocking()),
        }
    }

    /// Feedback lines for the planning agent's next attempt.
    pub fn feedback(&self) -> Vec<String> {
        match self {
            Self::Validation { failures } => failures.iter().map(ToString::to_string).collect(),
            Self::Conflict { conflicts, warnings } => conflicts
                .iter()
                .map(ToString::to_string)
                .chain(warnings.iter().map(|w| {
                    format!("{w}; prefer merging these epics or sequencing them with a dependency")
                }))
                .collect(),
        }
    }
}

fn format_list<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Successful resolution output.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Accepted epics, each assigned to exactly one repository, sorted by
    /// ascending execution order.
    pub epics: Vec<Epic>,
    pub warnings: Vec<DomainOverlapWarning>,
}

pub struct EpicResolver<'a> {
    repositories: &'a [Repository],
}

impl<'a> EpicResolver<'a> {
    pub fn new(repositories: &'a [Repository]) -> Self {
        Self { repositories }
    }

    /// Validate, partition, split, conflict-check, and order the proposal.
    pub fn resolve(&self, proposed: Vec<Epic>) -> Result<Resolution, ResolveError> {
        // 1. Batch validation.
        let failures = validation::validate_epics(&proposed);
        if !failures.is_empty() {
            return Err(ResolveError::Validation { failures });
        }

        // 2. Repository affinity.
        let mut routed: Vec<(Epic, Vec<String>)> = Vec::new();
        let mut routing_failures: Vec<ValidationFailure> = Vec::new();
        for epic in proposed {
            match self.repositories_for(&epic) {
                Ok(repos) => routed.push((epic, repos)),
                Err(mut failures) => routing_failures.append(&mut failures),
            }
        }
        if !routing_failures.is_empty() {
            return Err(ResolveError::Validation {
                failures: routing_failures,
            });
        }

        // 3. Split multi-repository epics.
        let mut assigned: Vec<(String, Epic)> = Vec::new();
        for (epic, repos) in routed {
            if repos.len() <= 1 {
                let repo = repos.into_iter().next().unwrap_or_default();
                let mut epic = epic;
                epic.affected_repositories = vec![repo.clone()];
                assigned.push((repo, epic));
            } else {
                for (repo, sub) in self.split_epic(epic, &repos) {
                    assigned.push((repo, sub));
                }
            }
        }

        // 4. Soft domain-overlap warnings, before any file-level check.
        let pairs: Vec<(String, &Epic)> = assigned
            .iter()
            .map(|(repo, epic)| (repo.clone(), epic))
            .collect();
        let warnings = conflict::detect_domain_overlaps(&pairs);

        // 5. Write-set conflict detection.
        let mut registry = OverlapRegistry::new();
        let mut conflicts = Vec::new();
        for (repo, epic) in &assigned {
            if let Err(conflict) = registry.try_accept(repo, epic) {
                conflicts.push(conflict);
            }
        }
        if !conflicts.is_empty() {
            return Err(ResolveError::Conflict { conflicts, warnings });
        }

        // 6. Final ordering.
        let mut epics: Vec<Epic> = assigned.into_iter().map(|(_, e)| e).collect();
        epics.sort_by_key(|e| e.execution_order);

        Ok(Resolution { epics, warnings })
    }

    /// Repositories an epic touches: the declared list when present,
    /// otherwise derived by classifying every file path.
    fn repositories_for(&self, epic: &Epic) -> Result<Vec<String>, Vec<ValidationFailure>> {
        if !epic.affected_repositories.is_empty() {
            return Ok(self.order_repo_names(epic.affected_repositories.clone()));
        }

        let mut repos: Vec<String> = Vec::new();
        let mut failures = Vec::new();
        for path in epic.all_files() {
            match classify_path(self.repositories, path) {
                Some(repo) => {
                    if !repos.iter().any(|r| r == &repo.name) {
                        repos.push(repo.name.clone());
                    }
                }
                None => failures.push(ValidationFailure {
                    epic_id: epic.id.clone(),
                    reason: ValidationReason::UnroutablePath {
                        path: path.to_string(),
                    },
                }),
            }
        }
        if !failures.is_empty() {
            return Err(failures);
        }
        Ok(self.order_repo_names(repos))
    }

    /// Sort repository names by execution order; unknown names keep their
    /// relative position at the end.
    fn order_repo_names(&self, mut names: Vec<String>) -> Vec<String> {
        names.sort_by_key(|name| {
            self.repositories
                .iter()
                .find(|r| r.name == *name)
                .map(|r| r.effective_order())
                .unwrap_or(u32::MAX)
        });
        names
    }

    /// Deterministically split a multi-repository epic: one sub-epic per
    /// repository, restricted to that repository's files, with dependency
    /// edges on every earlier-ordered sibling. Sub-epics that end up with
    /// no files are dropped.
    fn split_epic(&self, epic: Epic, repos: &[String]) -> Vec<(String, Epic)> {
        let mut files_by_repo: BTreeMap<String, (Vec<String>, Vec<String>, Vec<String>)> =
            BTreeMap::new();

        let route = |path: &str| -> String {
            // Prefer classification into one of the epic's repositories;
            // fall back to the first (earliest-executing) of them.
            classify_path(self.repositories, path)
                .map(|r| r.name.clone())
                .filter(|name| repos.contains(name))
                .unwrap_or_else(|| repos[0].clone())
        };

        for path in &epic.files_to_read {
            files_by_repo.entry(route(path)).or_default().0.push(path.clone());
        }
        for path in &epic.files_to_modify {
            files_by_repo.entry(route(path)).or_default().1.push(path.clone());
        }
        for path in &epic.files_to_create {
            files_by_repo.entry(route(path)).or_default().2.push(path.clone());
        }

        let mut subs: Vec<(String, Epic)> = Vec::new();
        let mut earlier_sibling_ids: Vec<String> = Vec::new();

        for repo in repos {
            let Some((reads, modifies, creates)) = files_by_repo.get(repo).cloned() else {
                continue;
            };
            if reads.is_empty() && modifies.is_empty() && creates.is_empty() {
                continue;
            }

            let sub_id = format!("{}-{}", epic.id, repo);
            let mut dependencies = epic.dependencies.clone();
            dependencies.extend(earlier_sibling_ids.iter().cloned());

            let sub = Epic {
                id: sub_id.clone(),
                title: format!("{} [{}]", epic.title, repo),
                description: epic.description.clone(),
                files_to_read: reads,
                files_to_modify: modifies,
                files_to_create: creates,
                affected_repositories: vec![repo.clone()],
                dependencies,
                execution_order: epic.execution_order,
                contract: epic.contract.clone(),
            };

            earlier_sibling_ids.push(sub_id);
            subs.push((repo.clone(), sub));
        }

        subs
    }
}
