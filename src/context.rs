//! The execution context threaded through the pipeline.
//!
//! One context exists per in-flight run of a task. It is owned exclusively
//! by that run (callers enforce this with the task lock), so nothing in
//! here needs internal locking. Durable state lives in the checkpoint and
//! event stores; the context itself is rebuilt on every start.
//!
//! The shared data is a typed registry — a fixed set of well-known slots —
//! rather than a string-keyed bag, so a phase asking for epics gets
//! `Vec<Epic>` and not a JSON value to re-parse.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::model::epic::{Epic, Story};
use crate::model::repository::Repository;
use crate::model::task::Task;
use crate::pipeline::phase::PhaseResult;

/// What kind of work item owns a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Epic,
    Story,
}

impl BranchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Epic => "epic",
            Self::Story => "story",
        }
    }
}

impl FromStr for BranchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "epic" => Ok(Self::Epic),
            "story" => Ok(Self::Story),
            _ => Err(format!("Invalid branch kind: {}", s)),
        }
    }
}

/// One registered branch: who owns it, where it lives, when it appeared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub kind: BranchKind,
    pub owner_id: String,
    pub repository: String,
    pub created_at: DateTime<Utc>,
}

/// An artifact attached to the task (error report, design doc, screenshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub path: String,
}

/// Which agent kinds staff this task, decided during planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TeamComposition {
    pub agents: Vec<String>,
}

/// Environment configuration recorded for the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EnvironmentConfig {
    pub variables: BTreeMap<String, String>,
}

/// Typed inter-phase blackboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SharedData {
    pub analysis: Option<String>,
    pub epics: Vec<Epic>,
    pub stories: Vec<Story>,
    pub attachments: Vec<Attachment>,
    /// Corrective feedback accumulated by planning retry loops.
    pub planning_feedback: Vec<String>,
    pub team: Option<TeamComposition>,
    pub environment: Option<EnvironmentConfig>,
    pub review_summary: Option<String>,
}

/// A phase result paired with the phase that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: String,
    pub result: PhaseResult,
}

/// Per-run mutable state threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task: Task,
    pub repositories: Vec<Repository>,
    pub data: SharedData,
    branches: BTreeMap<String, BranchRecord>,
    phase_records: Vec<PhaseRecord>,
}

impl ExecutionContext {
    pub fn new(task: Task, repositories: Vec<Repository>) -> Self {
        Self {
            task,
            repositories,
            data: SharedData::default(),
            branches: BTreeMap::new(),
            phase_records: Vec::new(),
        }
    }

    /// Register a branch. Re-registration of the same name is a no-op so
    /// recovery can replay registrations idempotently.
    pub fn register_branch(
        &mut self,
        branch: &str,
        kind: BranchKind,
        owner_id: &str,
        repository: &str,
    ) {
        self.branches
            .entry(branch.to_string())
            .or_insert_with(|| BranchRecord {
                kind,
                owner_id: owner_id.to_string(),
                repository: repository.to_string(),
                created_at: Utc::now(),
            });
    }

    pub fn branches(&self) -> &BTreeMap<String, BranchRecord> {
        &self.branches
    }

    pub fn branch(&self, name: &str) -> Option<&BranchRecord> {
        self.branches.get(name)
    }

    pub fn record_phase(&mut self, phase: &str, result: PhaseResult) {
        self.phase_records.push(PhaseRecord {
            phase: phase.to_string(),
            result,
        });
    }

    pub fn phase_records(&self) -> &[PhaseRecord] {
        &self.phase_records
    }

    /// Snapshot the recoverable parts of the context.
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            branches: self.branches.clone(),
            phase_records: self.phase_records.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Restore branch registry and phase results from a snapshot.
    pub fn restore_from_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.branches = checkpoint.branches;
        self.phase_records = checkpoint.phase_records;
    }
}
