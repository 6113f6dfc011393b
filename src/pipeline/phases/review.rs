//! Review phase: a reviewer agent inspects the delivered work and, when
//! configured, pauses the pipeline for human approval.
//!
//! The approval handshake is event-sourced: pausing appends an
//! `approval_required` event carrying the reviewer's output; the external
//! UI appends `approval_granted`. On the resumed run this phase finds the
//! grant in the log and completes without re-invoking the reviewer.

use std::time::Instant;

use async_trait::async_trait;

use crate::agent::{AgentKind, AgentRequest};
use crate::context::ExecutionContext;
use crate::events::EventKind;
use crate::notify::ApprovalRequest;
use crate::pipeline::phase::{Phase, PhaseResult};

use super::PhaseServices;

pub struct ReviewPhase {
    services: PhaseServices,
    /// Position of this phase in the pipeline, reported in approval signals.
    phase_index: usize,
}

impl ReviewPhase {
    pub const NAME: &'static str = "review";

    pub fn new(services: PhaseServices, phase_index: usize) -> Self {
        Self {
            services,
            phase_index,
        }
    }

    fn build_prompt(ctx: &ExecutionContext) -> String {
        let mut prompt = format!(
            "Review the delivered changes for this task.\n\nTitle: {}\n\nDescription:\n{}\n\nEpics delivered:\n",
            ctx.task.title, ctx.task.description
        );
        for epic in &ctx.data.epics {
            prompt.push_str(&format!(
                "- {} ({}): modifies {}, creates {}\n",
                epic.id,
                epic.title,
                epic.files_to_modify.join(", "),
                epic.files_to_create.join(", "),
            ));
        }
        prompt.push_str("\nSummarize findings and call out anything blocking.\n");
        prompt
    }

    /// The reviewer output from a prior pause, if an approval has been
    /// granted since it was requested.
    async fn granted_review(&self, task_id: &str) -> Option<String> {
        let events = self.services.events.replay(task_id).await.ok()?;
        let last_request = events
            .iter()
            .rposition(|e| e.kind == EventKind::ApprovalRequired)?;
        let granted = events[last_request..]
            .iter()
            .any(|e| e.kind == EventKind::ApprovalGranted);
        if !granted {
            return None;
        }
        events[last_request]
            .payload
            .get("agent_output")
            .and_then(|v| v.as_str())
            .map(String::from)
    }
}

#[async_trait]
impl Phase for ReviewPhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn restore(&self, ctx: &mut ExecutionContext, output: &serde_json::Value) {
        ctx.data.review_summary = output
            .get("review")
            .and_then(|v| v.as_str())
            .map(String::from);
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> PhaseResult {
        let started = Instant::now();

        // Resumed after an approval: reuse the reviewed output.
        if let Some(review) = self.granted_review(&ctx.task.id).await {
            self.services.begin_phase(ctx, Self::NAME).await;
            ctx.data.review_summary = Some(review.clone());
            let output = serde_json::json!({ "review": review, "approved": true });
            let metrics = self
                .services
                .complete_phase(ctx, Self::NAME, output.clone(), None, Default::default(), 0.0)
                .await;
            return PhaseResult::ok(output)
                .with_metrics(metrics)
                .with_duration_ms(started.elapsed().as_millis() as u64);
        }

        self.services.begin_phase(ctx, Self::NAME).await;

        let request = AgentRequest::new(
            AgentKind::Reviewer,
            &Self::build_prompt(ctx),
            &self.services.workspace,
            &ctx.task.id,
        );
        let response = match self.services.invoke_agent(&request).await {
            Ok(response) => response,
            Err(err) => {
                let message = format!("review agent failed: {err:#}");
                self.services.fail_phase(ctx, Self::NAME, &message).await;
                return PhaseResult::failed(message)
                    .with_duration_ms(started.elapsed().as_millis() as u64);
            }
        };

        ctx.data.review_summary = Some(response.output.clone());
        self.services
            .notifier
            .output_dump(&ctx.task.id, Self::NAME, &response.output);

        if self.services.require_approval {
            let approval = ApprovalRequest {
                phase: self.phase_index,
                phase_name: Self::NAME.to_string(),
                agent_name: AgentKind::Reviewer.as_str().to_string(),
                approval_type: "code_review".to_string(),
                agent_output: response.output.clone(),
            };
            self.services
                .append_event(
                    ctx,
                    EventKind::ApprovalRequired,
                    AgentKind::Reviewer.as_str(),
                    serde_json::to_value(&approval).unwrap_or_default(),
                )
                .await;
            self.services
                .notifier
                .approval_required(&ctx.task.id, &approval);
            ctx.task.record_spend(response.usage, response.cost_usd);
            self.services.persist_task(ctx).await;

            // The phase stays in_progress: a pause is not a completion.
            return PhaseResult::ok(serde_json::json!({ "review": response.output }))
                .with_approval_request()
                .with_duration_ms(started.elapsed().as_millis() as u64);
        }

        let output = serde_json::json!({ "review": response.output, "approved": false });
        let metrics = self
            .services
            .complete_phase(
                ctx,
                Self::NAME,
                output.clone(),
                response.session_id,
                response.usage,
                response.cost_usd,
            )
            .await;

        PhaseResult::ok(output)
            .with_metrics(metrics)
            .with_duration_ms(started.elapsed().as_millis() as u64)
    }
}
