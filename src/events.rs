//! Append-only event store and event-sourced state reconstruction.
//!
//! Events are the authoritative history of a task. They are never mutated
//! or deleted — checkpoints can be cleared, events cannot. Replay of a
//! task's event sequence is sufficient to rebuild its epics, stories, team
//! composition, environment configuration, and branch registrations.
//!
//! Append ordering per task is guaranteed by the single database handle:
//! all appends funnel through one connection, so sequence numbers are
//! monotone within a task. Different tasks share no mutable state.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{BranchKind, BranchRecord, EnvironmentConfig, TeamComposition};
use crate::db::DbHandle;
use crate::model::epic::{Epic, Story};
use crate::util::{epic_branch_name, story_branch_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    AnalysisRecorded,
    EpicsPlanned,
    StoriesPlanned,
    TeamComposed,
    EnvironmentConfigured,
    BranchRegistered,
    ApprovalRequired,
    ApprovalGranted,
    ContinuationAdded,
    CheckpointCleared,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::PhaseStarted => "phase_started",
            Self::PhaseCompleted => "phase_completed",
            Self::PhaseFailed => "phase_failed",
            Self::AnalysisRecorded => "analysis_recorded",
            Self::EpicsPlanned => "epics_planned",
            Self::StoriesPlanned => "stories_planned",
            Self::TeamComposed => "team_composed",
            Self::EnvironmentConfigured => "environment_configured",
            Self::BranchRegistered => "branch_registered",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalGranted => "approval_granted",
            Self::ContinuationAdded => "continuation_added",
            Self::CheckpointCleared => "checkpoint_cleared",
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_created" => Ok(Self::TaskCreated),
            "phase_started" => Ok(Self::PhaseStarted),
            "phase_completed" => Ok(Self::PhaseCompleted),
            "phase_failed" => Ok(Self::PhaseFailed),
            "analysis_recorded" => Ok(Self::AnalysisRecorded),
            "epics_planned" => Ok(Self::EpicsPlanned),
            "stories_planned" => Ok(Self::StoriesPlanned),
            "team_composed" => Ok(Self::TeamComposed),
            "environment_configured" => Ok(Self::EnvironmentConfigured),
            "branch_registered" => Ok(Self::BranchRegistered),
            "approval_required" => Ok(Self::ApprovalRequired),
            "approval_granted" => Ok(Self::ApprovalGranted),
            "continuation_added" => Ok(Self::ContinuationAdded),
            "checkpoint_cleared" => Ok(Self::CheckpointCleared),
            _ => Err(format!("Invalid event kind: {}", s)),
        }
    }
}

/// An immutable event as read back from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub task_id: String,
    pub kind: EventKind,
    pub agent: String,
    pub payload: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// State rebuilt purely from event payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveredState {
    pub epics: Vec<Epic>,
    pub stories: Vec<Story>,
    pub team: Option<TeamComposition>,
    pub environment: Option<EnvironmentConfig>,
    pub branches: BTreeMap<String, BranchRecord>,
    pub approval_granted: bool,
}

impl RecoveredState {
    pub fn is_empty(&self) -> bool {
        self.epics.is_empty()
            && self.stories.is_empty()
            && self.team.is_none()
            && self.environment.is_none()
            && self.branches.is_empty()
    }
}

#[derive(Clone)]
pub struct EventStore {
    db: DbHandle,
}

impl EventStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        task_id: &str,
        kind: EventKind,
        agent: &str,
        payload: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Result<EventRecord> {
        let record = EventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            kind,
            agent: agent.to_string(),
            payload,
            metadata,
            created_at: Utc::now(),
        };

        let row = record.clone();
        self.db
            .call(move |db| {
                let metadata = row
                    .metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                db.append_event(
                    &row.id,
                    &row.task_id,
                    row.kind.as_str(),
                    &row.agent,
                    &serde_json::to_string(&row.payload)?,
                    metadata.as_deref(),
                    &row.created_at.to_rfc3339(),
                )
            })
            .await
            .context("Failed to append event")?;

        Ok(record)
    }

    /// All events for a task in causal (append) order.
    pub async fn replay(&self, task_id: &str) -> Result<Vec<EventRecord>> {
        let task_id_owned = task_id.to_string();
        let rows = self
            .db
            .call(move |db| db.events_for_task(&task_id_owned))
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let kind = row
                .kind
                .parse::<EventKind>()
                .map_err(|e| anyhow::anyhow!(e))?;
            events.push(EventRecord {
                id: row.event_id,
                task_id: task_id.to_string(),
                kind,
                agent: row.agent,
                payload: serde_json::from_str(&row.payload)
                    .context("Failed to parse event payload")?,
                metadata: row
                    .metadata
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()
                    .context("Failed to parse event metadata")?,
                created_at: chrono::DateTime::parse_from_rfc3339(&row.created_at)?
                    .with_timezone(&Utc),
            });
        }
        Ok(events)
    }

    /// Rebuild the materialized orchestration state for a task.
    ///
    /// Planning re-runs replace the epic/story sets (latest event wins).
    /// Branches are re-derived from the surviving epics and stories, so
    /// every registered branch has a known owner by construction; raw
    /// `BranchRegistered` events are honored only when their owner is still
    /// part of the recovered state.
    pub async fn reconstruct(&self, task_id: &str) -> Result<RecoveredState> {
        let events = self.replay(task_id).await?;
        let mut state = RecoveredState::default();
        let mut registered: Vec<(String, BranchRecord)> = Vec::new();

        for event in &events {
            match event.kind {
                EventKind::EpicsPlanned => {
                    if let Some(epics) = event.payload.get("epics") {
                        state.epics = serde_json::from_value(epics.clone())
                            .context("Failed to decode epics from event payload")?;
                    }
                }
                EventKind::StoriesPlanned => {
                    if let Some(stories) = event.payload.get("stories") {
                        state.stories = serde_json::from_value(stories.clone())
                            .context("Failed to decode stories from event payload")?;
                    }
                }
                EventKind::TeamComposed => {
                    state.team = Some(
                        serde_json::from_value(event.payload.clone())
                            .context("Failed to decode team composition")?,
                    );
                }
                EventKind::EnvironmentConfigured => {
                    state.environment = Some(
                        serde_json::from_value(event.payload.clone())
                            .context("Failed to decode environment config")?,
                    );
                }
                EventKind::BranchRegistered => {
                    if let (Some(branch), Ok(record)) = (
                        event.payload.get("branch").and_then(|v| v.as_str()),
                        serde_json::from_value::<BranchRecord>(
                            event.payload.get("record").cloned().unwrap_or_default(),
                        ),
                    ) {
                        registered.push((branch.to_string(), record));
                    }
                }
                EventKind::ApprovalGranted => state.approval_granted = true,
                // Re-requesting approval re-arms the gate.
                EventKind::ApprovalRequired => state.approval_granted = false,
                _ => {}
            }
        }

        // Re-register every branch referenced by the recovered work items.
        for epic in &state.epics {
            let branch = epic_branch_name(&epic.id, &epic.title);
            let repository = epic
                .affected_repositories
                .first()
                .cloned()
                .unwrap_or_default();
            state.branches.insert(
                branch,
                BranchRecord {
                    kind: BranchKind::Epic,
                    owner_id: epic.id.clone(),
                    repository,
                    created_at: Utc::now(),
                },
            );
        }
        for story in &state.stories {
            let branch = story_branch_name(&story.id, &story.title);
            state.branches.insert(
                branch,
                BranchRecord {
                    kind: BranchKind::Story,
                    owner_id: story.id.clone(),
                    repository: String::new(),
                    created_at: Utc::now(),
                },
            );
        }

        // Explicit registrations are kept only when the owner is known,
        // so restoration never yields a branch with an unknown owning item.
        for (branch, record) in registered {
            let owner_known = match record.kind {
                BranchKind::Epic => state.epics.iter().any(|e| e.id == record.owner_id),
                BranchKind::Story => state.stories.iter().any(|s| s.id == record.owner_id),
            };
            if owner_known {
                state.branches.entry(branch).or_insert(record);
            }
        }

        Ok(state)
    }
}
