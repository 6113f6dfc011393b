//! Checkpoint snapshots: point-in-time recovery state per task.
//!
//! A checkpoint is written after every phase and read at most once, at
//! orchestration start. It is the second-priority recovery source — event
//! replay is authoritative when events exist. Clearing a checkpoint on a
//! terminal outcome removes only the snapshot; the event log is permanent.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{BranchRecord, PhaseRecord};
use crate::db::DbHandle;

/// Serializable snapshot of the recoverable context state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub branches: BTreeMap<String, BranchRecord>,
    pub phase_records: Vec<PhaseRecord>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty() && self.phase_records.is_empty()
    }
}

/// Persists checkpoints as opaque JSON blobs keyed by task id.
#[derive(Clone)]
pub struct CheckpointStore {
    db: DbHandle,
}

impl CheckpointStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn save(&self, task_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let task_id = task_id.to_string();
        let snapshot =
            serde_json::to_string(checkpoint).context("Failed to serialize checkpoint")?;
        let saved_at = checkpoint.saved_at.to_rfc3339();
        self.db
            .call(move |db| db.save_checkpoint(&task_id, &snapshot, &saved_at))
            .await
    }

    pub async fn load(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let task_id = task_id.to_string();
        let snapshot = self.db.call(move |db| db.load_checkpoint(&task_id)).await?;
        match snapshot {
            Some(json) => {
                let checkpoint =
                    serde_json::from_str(&json).context("Failed to parse stored checkpoint")?;
                Ok(Some(checkpoint))
            }
            None => Ok(None),
        }
    }

    /// Drop the snapshot for a task. Never touches events.
    pub async fn clear(&self, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.db.call(move |db| db.clear_checkpoint(&task_id)).await
    }
}
