//! The phase contract: skip rules, execution, and results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;

/// Cost and token usage reported by a phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PhaseMetrics {
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Outcome of one phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// A pause request, not a failure: the pipeline halts and waits for an
    /// external approval event.
    #[serde(default)]
    pub needs_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PhaseMetrics>,
    #[serde(default)]
    pub duration_ms: u64,
    /// A failure that must halt the pipeline even when `stop_on_failure`
    /// is off — e.g. parallel epics still writing the same file after the
    /// conflict-retry bound.
    #[serde(default)]
    pub fatal: bool,
}

impl PhaseResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            warnings: Vec::new(),
            needs_approval: false,
            metrics: None,
            duration_ms: 0,
            fatal: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            warnings: Vec::new(),
            needs_approval: false,
            metrics: None,
            duration_ms: 0,
            fatal: false,
        }
    }

    /// Mark this failure as non-negotiable: the pipeline halts regardless
    /// of its `stop_on_failure` setting.
    pub fn with_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_approval_request(mut self) -> Self {
        self.needs_approval = true;
        self
    }

    pub fn with_metrics(mut self, metrics: PhaseMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Why (or whether) a phase runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipDecision {
    /// Execute the phase.
    Run,
    /// Phase already completed in a previous run; skip it and repopulate
    /// shared data from the stored output.
    SkipCompleted,
}

/// The three skip-precedence rules, evaluated in order:
/// 1. unprocessed continuations force a re-run — new requirements must be
///    folded in no matter what the stored status says;
/// 2. an already-completed phase (crash recovery) is skipped;
/// 3. otherwise run.
pub fn skip_decision(ctx: &ExecutionContext, phase_name: &str) -> SkipDecision {
    if ctx.task.has_unprocessed_continuations() {
        return SkipDecision::Run;
    }
    if ctx.task.phase_state(phase_name).is_completed() {
        return SkipDecision::SkipCompleted;
    }
    SkipDecision::Run
}

/// One named step of the fixed orchestration sequence.
#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the phase should be skipped for this run.
    fn should_skip(&self, ctx: &ExecutionContext) -> bool {
        skip_decision(ctx, self.name()) == SkipDecision::SkipCompleted
    }

    /// Repopulate shared data from a stored output when the phase is
    /// skipped on recovery.
    fn restore(&self, _ctx: &mut ExecutionContext, _output: &serde_json::Value) {}

    async fn execute(&self, ctx: &mut ExecutionContext) -> PhaseResult;
}
