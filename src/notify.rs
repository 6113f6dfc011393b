//! Notification/telemetry sink.
//!
//! Components receive a `Notifier` by injection instead of writing to
//! ambient globals; the default implementation forwards everything to
//! `tracing`. An external approval UI consumes `approval_required` and
//! later feeds an approval-granted event back through the event store.

use serde::{Deserialize, Serialize};

/// Signal emitted when a phase pauses the pipeline for human sign-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub phase: usize,
    pub phase_name: String,
    pub agent_name: String,
    pub approval_type: String,
    pub agent_output: String,
}

pub trait Notifier: Send + Sync {
    fn phase_started(&self, task_id: &str, phase: &str);
    fn phase_progress(&self, task_id: &str, phase: &str, message: &str);
    fn phase_completed(&self, task_id: &str, phase: &str, duration_ms: u64);
    fn phase_failed(&self, task_id: &str, phase: &str, error: &str);
    /// Full-text output dump for operators and UI clients.
    fn output_dump(&self, task_id: &str, phase: &str, output: &str);
    fn approval_required(&self, task_id: &str, request: &ApprovalRequest);
}

/// Default sink: structured tracing events.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn phase_started(&self, task_id: &str, phase: &str) {
        tracing::info!(task_id, phase, "phase started");
    }

    fn phase_progress(&self, task_id: &str, phase: &str, message: &str) {
        tracing::info!(task_id, phase, message, "phase progress");
    }

    fn phase_completed(&self, task_id: &str, phase: &str, duration_ms: u64) {
        tracing::info!(task_id, phase, duration_ms, "phase completed");
    }

    fn phase_failed(&self, task_id: &str, phase: &str, error: &str) {
        tracing::error!(task_id, phase, error, "phase failed");
    }

    fn output_dump(&self, task_id: &str, phase: &str, output: &str) {
        tracing::debug!(task_id, phase, output_len = output.len(), "phase output");
    }

    fn approval_required(&self, task_id: &str, request: &ApprovalRequest) {
        tracing::warn!(
            task_id,
            phase = %request.phase_name,
            agent = %request.agent_name,
            approval_type = %request.approval_type,
            "approval required"
        );
    }
}

/// Silent sink for tests.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn phase_started(&self, _: &str, _: &str) {}
    fn phase_progress(&self, _: &str, _: &str, _: &str) {}
    fn phase_completed(&self, _: &str, _: &str, _: u64) {}
    fn phase_failed(&self, _: &str, _: &str, _: &str) {}
    fn output_dump(&self, _: &str, _: &str, _: &str) {}
    fn approval_required(&self, _: &str, _: &ApprovalRequest) {}
}
