//! Crash recovery: rebuild a task's execution context on (re)start.
//!
//! Three sources, tried strictly in order of trust:
//! 1. Event replay — immutable and causally ordered, authoritative.
//! 2. Checkpoint snapshot — the last post-phase save.
//! 3. Legacy flat branch rows — branch registrations only, no epic/story
//!    context.
//!
//! If none yield data the orchestrator starts from the first
//! non-skippable phase.

use anyhow::Result;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::events::{EventStore, RecoveredState};

/// Which source produced the recovered state.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Event-sourced reconstruction was applied.
    Events(RecoveredState),
    /// A checkpoint snapshot was restored.
    Checkpoint(Checkpoint),
    /// Only legacy branch registrations were found.
    LegacyBranches(usize),
    /// Nothing to recover; start fresh.
    NoCheckpoint,
}

impl RecoveryOutcome {
    pub fn source_name(&self) -> &'static str {
        match self {
            Self::Events(_) => "events",
            Self::Checkpoint(_) => "checkpoint",
            Self::LegacyBranches(_) => "legacy_branches",
            Self::NoCheckpoint => "none",
        }
    }
}

pub struct RecoveryManager {
    events: EventStore,
    checkpoints: CheckpointStore,
    db: DbHandle,
}

impl RecoveryManager {
    pub fn new(events: EventStore, checkpoints: CheckpointStore, db: DbHandle) -> Self {
        Self {
            events,
            checkpoints,
            db,
        }
    }

    /// Restore `ctx` from the most trustworthy available source.
    pub async fn recover(&self, ctx: &mut ExecutionContext) -> Result<RecoveryOutcome> {
        let task_id = ctx.task.id.clone();

        // 1. Event-sourced reconstruction.
        let state = self.events.reconstruct(&task_id).await?;
        if !state.is_empty() {
            ctx.data.epics = state.epics.clone();
            ctx.data.stories = state.stories.clone();
            ctx.data.team = state.team.clone();
            ctx.data.environment = state.environment.clone();
            for (branch, record) in &state.branches {
                ctx.register_branch(branch, record.kind, &record.owner_id, &record.repository);
            }
            // Phase results still come from the checkpoint when present;
            // events do not carry them.
            if let Some(checkpoint) = self.checkpoints.load(&task_id).await? {
                for record in checkpoint.phase_records {
                    ctx.record_phase(&record.phase.clone(), record.result);
                }
            }
            tracing::info!(task_id, source = "events", "recovered orchestration state");
            return Ok(RecoveryOutcome::Events(state));
        }

        // 2. Checkpoint snapshot.
        if let Some(checkpoint) = self.checkpoints.load(&task_id).await? {
            if !checkpoint.is_empty() {
                ctx.restore_from_checkpoint(checkpoint.clone());
                tracing::info!(task_id, source = "checkpoint", "recovered orchestration state");
                return Ok(RecoveryOutcome::Checkpoint(checkpoint));
            }
        }

        // 3. Legacy flat branch list.
        let task_id_owned = task_id.clone();
        let rows = self
            .db
            .call(move |db| db.branches_for_task(&task_id_owned))
            .await?;
        if !rows.is_empty() {
            let count = rows.len();
            for row in rows {
                let kind = row
                    .kind
                    .parse()
                    .unwrap_or(crate::context::BranchKind::Epic);
                ctx.register_branch(&row.branch, kind, &row.owner_id, &row.repository);
            }
            tracing::warn!(
                task_id,
                count,
                "recovered from legacy branch list; no epic/story context available"
            );
            return Ok(RecoveryOutcome::LegacyBranches(count));
        }

        tracing::info!(task_id, "no checkpoint found");
        Ok(RecoveryOutcome::NoCheckpoint)
    }
}
