//! Batch validation of proposed epics.
//!
//! Failures are collected and returned together, never one at a time, so a
//! single corrective feedback round can address every problem at once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::epic::Epic;

/// Substrings that mark a path as a placeholder the planner never filled in.
const PLACEHOLDER_MARKERS: &[&str] = &["path/to/", "todo", "example", "...", "\u{2026}"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ValidationReason {
    /// The epic names no files at all. Fatal if it survives all retries:
    /// unfileable work must never reach execution.
    NoFiles,
    /// A path that is obviously a template, not a real location.
    PlaceholderPath { path: String },
    /// A path no configured repository's patterns claim.
    UnroutablePath { path: String },
}

impl ValidationReason {
    /// Zero-file failures block orchestration when retries run out;
    /// placeholder/routing failures degrade to non-fatal.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::NoFiles)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub epic_id: String,
    #[serde(flatten)]
    pub reason: ValidationReason,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            ValidationReason::NoFiles => {
                write!(f, "epic '{}' lists no files to read, modify, or create", self.epic_id)
            }
            ValidationReason::PlaceholderPath { path } => {
                write!(f, "epic '{}' contains placeholder path '{}'", self.epic_id, path)
            }
            ValidationReason::UnroutablePath { path } => write!(
                f,
                "epic '{}' references '{}', which no repository's patterns match",
                self.epic_id, path
            ),
        }
    }
}

pub fn is_placeholder_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}

/// Validate a batch of proposed epics. Returns every failure found.
pub fn validate_epics(epics: &[Epic]) -> Vec<ValidationFailure> {
    let mut failures = Vec::new();
    for epic in epics {
        if epic.file_count() == 0 {
            failures.push(ValidationFailure {
                epic_id: epic.id.clone(),
                reason: ValidationReason::NoFiles,
            });
            continue;
        }
        for path in epic.all_files() {
            if is_placeholder_path(path) {
                failures.push(ValidationFailure {
                    epic_id: epic.id.clone(),
                    reason: ValidationReason::PlaceholderPath {
                        path: path.to_string(),
                    },
                });
            }
        }
    }
    failures
}
