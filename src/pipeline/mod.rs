//! The sequential phase pipeline.
//!
//! Phases run strictly in order over one shared context. After every phase
//! the context is checkpointed; a failed checkpoint write is logged and
//! swallowed, because the next phase will checkpoint again and event replay
//! remains the authoritative fallback.

pub mod phase;
pub mod phases;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointStore;
use crate::context::ExecutionContext;
use crate::notify::Notifier;
use phase::{Phase, PhaseResult};

/// Aggregate outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub success: bool,
    pub completed_phases: usize,
    pub total_phases: usize,
    pub phase_results: Vec<PhaseResult>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the run halted at an approval gate rather than finishing.
    #[serde(default)]
    pub paused_for_approval: bool,
}

pub struct Pipeline {
    phases: Vec<Box<dyn Phase>>,
    /// Halt on the first failed phase. Default true.
    pub stop_on_failure: bool,
    /// Keep going when a phase only reports warnings. Default true.
    pub continue_on_warning: bool,
    checkpoints: Option<CheckpointStore>,
    notifier: Arc<dyn Notifier>,
}

impl Pipeline {
    pub fn new(phases: Vec<Box<dyn Phase>>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            phases,
            stop_on_failure: true,
            continue_on_warning: true,
            checkpoints: None,
            notifier,
        }
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Run all phases in order over `ctx`.
    ///
    /// An approval request halts the pipeline immediately and reports
    /// success — a pause is a terminal state awaiting an external event,
    /// not a failure. There is no pipeline-level retry: what "retry" means
    /// differs per phase, so it lives inside each phase.
    pub async fn execute(&self, ctx: &mut ExecutionContext) -> PipelineReport {
        let started = Instant::now();
        let total = self.phases.len();
        let mut results: Vec<PhaseResult> = Vec::with_capacity(total);
        let mut warnings_total = 0usize;

        for (index, phase) in self.phases.iter().enumerate() {
            let name = phase.name();

            if phase.should_skip(ctx) {
                if let Some(output) = ctx.task.phase_state(name).output().cloned() {
                    phase.restore(ctx, &output);
                    let result = PhaseResult::ok(output);
                    ctx.record_phase(name, result.clone());
                    results.push(result);
                }
                tracing::info!(phase = name, "phase already completed, skipping");
                continue;
            }

            self.notifier.phase_started(&ctx.task.id, name);
            let result = phase.execute(ctx).await;
            ctx.record_phase(name, result.clone());
            results.push(result.clone());

            self.checkpoint(ctx).await;

            if result.needs_approval {
                self.notifier.phase_completed(&ctx.task.id, name, result.duration_ms);
                tracing::info!(phase = name, "pipeline paused for approval");
                return PipelineReport {
                    success: true,
                    completed_phases: index + 1,
                    total_phases: total,
                    phase_results: results,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                    paused_for_approval: true,
                };
            }

            if !result.success {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("phase '{name}' failed"));
                self.notifier.phase_failed(&ctx.task.id, name, &error);
                // Fatal failures ignore the stop_on_failure setting:
                // proceeding would corrupt the multi-repository work split.
                if self.stop_on_failure || result.fatal {
                    return PipelineReport {
                        success: false,
                        completed_phases: index,
                        total_phases: total,
                        phase_results: results,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some(error),
                        paused_for_approval: false,
                    };
                }
                continue;
            }

            warnings_total += result.warnings.len();
            if !result.warnings.is_empty() && !self.continue_on_warning {
                let error = format!("phase '{name}' finished with warnings");
                return PipelineReport {
                    success: false,
                    completed_phases: index + 1,
                    total_phases: total,
                    phase_results: results,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(error),
                    paused_for_approval: false,
                };
            }

            self.notifier.phase_completed(&ctx.task.id, name, result.duration_ms);
        }

        if warnings_total > 0 {
            tracing::warn!(count = warnings_total, "pipeline finished with warnings");
        }

        PipelineReport {
            success: results.iter().all(|r| r.success),
            completed_phases: results.iter().filter(|r| r.success).count(),
            total_phases: total,
            phase_results: results,
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
            paused_for_approval: false,
        }
    }

    /// Persist a checkpoint; failures are logged and swallowed so they
    /// never unwind the pipeline.
    async fn checkpoint(&self, ctx: &ExecutionContext) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        if let Err(err) = store.save(&ctx.task.id, &ctx.to_checkpoint()).await {
            tracing::warn!(task_id = %ctx.task.id, error = %err, "checkpoint write failed; continuing");
        }
    }
}
