//! The fixed phase sequence: analysis → planning → development → review.
//!
//! Each concrete phase owns its per-phase status section on the task,
//! persists transitions, and appends events as it goes. Recoverable
//! failures (malformed agent output, epic conflicts) are handled inside
//! the phase with bounded retry loops and only escalate as a failed
//! `PhaseResult` once a bound is exceeded.

pub mod analysis;
pub mod development;
pub mod planning;
pub mod review;

pub use analysis::AnalysisPhase;
pub use development::DevelopmentPhase;
pub use planning::PlanningPhase;
pub use review::ReviewPhase;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::agent::{AgentInvoker, AgentRequest, AgentResponse};
use crate::context::ExecutionContext;
use crate::db::DbHandle;
use crate::errors::{classify_error, ConductorError};
use crate::events::{EventKind, EventStore};
use crate::model::task::{PhaseState, Usage};
use crate::notify::Notifier;
use crate::pipeline::phase::PhaseMetrics;
use crate::retry::{execute_with_retry, CircuitBreaker, RetryPolicy};
use crate::vcs::VersionControl;

/// Everything a concrete phase needs, injected once at pipeline build time.
#[derive(Clone)]
pub struct PhaseServices {
    pub agent: Arc<dyn AgentInvoker>,
    pub vcs: Arc<dyn VersionControl>,
    pub db: DbHandle,
    pub events: EventStore,
    pub notifier: Arc<dyn Notifier>,
    pub retry: RetryPolicy,
    pub breaker: Arc<CircuitBreaker>,
    pub workspace: PathBuf,
    pub require_approval: bool,
}

impl PhaseServices {
    /// Invoke an agent behind the circuit breaker and retry policy.
    ///
    /// Each failure is classified independently; billing-classified
    /// failures are excluded from the breaker tally.
    pub async fn invoke_agent(&self, request: &AgentRequest) -> Result<AgentResponse> {
        if !self.breaker.can_execute() {
            return Err(ConductorError::CircuitOpen {
                retry_after_ms: self.breaker.retry_after_ms(),
            }
            .into());
        }

        let result = execute_with_retry(&self.retry, || self.agent.invoke(request)).await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) => self.breaker.record_failure(classify_error(err).kind),
        }
        result
    }

    /// Transition a phase to in_progress and persist the task.
    pub async fn begin_phase(&self, ctx: &mut ExecutionContext, phase: &str) {
        ctx.task.set_phase_state(
            phase,
            PhaseState::InProgress {
                started_at: Utc::now(),
            },
        );
        self.persist_task(ctx).await;
        self.append_event(
            ctx,
            EventKind::PhaseStarted,
            "",
            serde_json::json!({ "phase": phase }),
        )
        .await;
    }

    /// Transition a phase to completed with its output and spend.
    pub async fn complete_phase(
        &self,
        ctx: &mut ExecutionContext,
        phase: &str,
        output: serde_json::Value,
        session_id: Option<String>,
        usage: Usage,
        cost_usd: f64,
    ) -> PhaseMetrics {
        let started_at = match ctx.task.phase_state(phase) {
            PhaseState::InProgress { started_at } => *started_at,
            _ => Utc::now(),
        };
        ctx.task.set_phase_state(
            phase,
            PhaseState::Completed {
                started_at,
                completed_at: Utc::now(),
                output: output.clone(),
                session_id,
                usage,
                cost_usd,
            },
        );
        ctx.task.record_spend(usage, cost_usd);
        self.persist_task(ctx).await;
        self.append_event(
            ctx,
            EventKind::PhaseCompleted,
            "",
            serde_json::json!({ "phase": phase }),
        )
        .await;
        PhaseMetrics {
            cost_usd,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }
    }

    /// Transition a phase to failed; the reason is persisted on the task
    /// and echoed to the sink before the pipeline halts.
    pub async fn fail_phase(&self, ctx: &mut ExecutionContext, phase: &str, error: &str) {
        let started_at = match ctx.task.phase_state(phase) {
            PhaseState::InProgress { started_at } => *started_at,
            _ => Utc::now(),
        };
        ctx.task.set_phase_state(
            phase,
            PhaseState::Failed {
                started_at,
                failed_at: Utc::now(),
                error: error.to_string(),
            },
        );
        self.persist_task(ctx).await;
        self.append_event(
            ctx,
            EventKind::PhaseFailed,
            "",
            serde_json::json!({ "phase": phase, "error": error }),
        )
        .await;
    }

    /// Best-effort task persistence: a write failure is logged, never
    /// allowed to mask the phase outcome.
    pub async fn persist_task(&self, ctx: &ExecutionContext) {
        let task = ctx.task.clone();
        if let Err(err) = self.db.call(move |db| db.update_task(&task)).await {
            tracing::warn!(task_id = %ctx.task.id, error = %err, "failed to persist task state");
        }
    }

    /// Best-effort event append.
    pub async fn append_event(
        &self,
        ctx: &ExecutionContext,
        kind: EventKind,
        agent: &str,
        payload: serde_json::Value,
    ) {
        if let Err(err) = self
            .events
            .append(&ctx.task.id, kind, agent, payload, None)
            .await
        {
            tracing::warn!(task_id = %ctx.task.id, error = %err, "failed to append event");
        }
    }
}
