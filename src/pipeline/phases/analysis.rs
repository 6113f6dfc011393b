//! Analysis phase: an analyst agent studies the task and records findings.

use std::time::Instant;

use async_trait::async_trait;

use crate::agent::{AgentKind, AgentRequest};
use crate::context::ExecutionContext;
use crate::events::EventKind;
use crate::pipeline::phase::{Phase, PhaseResult};

use super::PhaseServices;

pub struct AnalysisPhase {
    services: PhaseServices,
}

impl AnalysisPhase {
    pub const NAME: &'static str = "analysis";

    pub fn new(services: PhaseServices) -> Self {
        Self { services }
    }

    fn build_prompt(ctx: &ExecutionContext) -> String {
        let mut prompt = format!(
            "Analyze the following delivery task and summarize the affected \
             areas, risks, and suggested approach.\n\nTitle: {}\n\nDescription:\n{}\n",
            ctx.task.title, ctx.task.description
        );
        let unprocessed: Vec<&str> = ctx
            .task
            .continuations
            .iter()
            .filter(|c| !c.processed)
            .map(|c| c.requirements.as_str())
            .collect();
        if !unprocessed.is_empty() {
            prompt.push_str("\nAdditional requirements added after the original submission:\n");
            for req in unprocessed {
                prompt.push_str(&format!("- {req}\n"));
            }
        }
        if !ctx.repositories.is_empty() {
            prompt.push_str("\nTarget repositories:\n");
            for repo in &ctx.repositories {
                prompt.push_str(&format!("- {} ({})\n", repo.name, repo.kind.as_str()));
            }
        }
        prompt
    }
}

#[async_trait]
impl Phase for AnalysisPhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn restore(&self, ctx: &mut ExecutionContext, output: &serde_json::Value) {
        ctx.data.analysis = output
            .get("analysis")
            .and_then(|v| v.as_str())
            .map(String::from);
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> PhaseResult {
        let started = Instant::now();
        self.services.begin_phase(ctx, Self::NAME).await;

        let request = AgentRequest::new(
            AgentKind::Analyst,
            &Self::build_prompt(ctx),
            &self.services.workspace,
            &ctx.task.id,
        );

        let response = match self.services.invoke_agent(&request).await {
            Ok(response) => response,
            Err(err) => {
                let message = format!("analysis agent failed: {err:#}");
                self.services.fail_phase(ctx, Self::NAME, &message).await;
                return PhaseResult::failed(message)
                    .with_duration_ms(started.elapsed().as_millis() as u64);
            }
        };

        ctx.data.analysis = Some(response.output.clone());
        self.services
            .notifier
            .output_dump(&ctx.task.id, Self::NAME, &response.output);
        self.services
            .append_event(
                ctx,
                EventKind::AnalysisRecorded,
                AgentKind::Analyst.as_str(),
                serde_json::json!({ "analysis": response.output }),
            )
            .await;

        let output = serde_json::json!({ "analysis": response.output });
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::{PhaseState, Priority, Task};
    use crate::pipeline::phases::testing::{services_with_agent, ScriptedAgent};
    use std::sync::Arc;

    fn context(services: &super::super::PhaseServices) -> ExecutionContext {
        let task = Task::new("Add search", "Full-text search", Priority::Medium, vec![]);
        services.db.lock_sync().unwrap().insert_task(&task).unwrap();
        ExecutionContext::new(task, Vec::new())
    }

    #[tokio::test]
    async fn test_analysis_stores_findings_and_completes() {
        let agent = Arc::new(ScriptedAgent::with_outputs(vec!["search touches the indexer"]));
        let services = services_with_agent(agent.clone());
        let mut ctx = context(&services);

        let phase = AnalysisPhase::new(services);
        let result = phase.execute(&mut ctx).await;

        assert!(result.success);
        assert_eq!(ctx.data.analysis.as_deref(), Some("search touches the indexer"));
        assert!(ctx.task.phase_state(AnalysisPhase::NAME).is_completed());
        assert!(agent.prompts.lock().unwrap()[0].contains("Add search"));
        assert_eq!(result.metrics.unwrap().input_tokens, 10);
    }

    #[tokio::test]
    async fn test_analysis_failure_marks_phase_failed() {
        let agent = Arc::new(ScriptedAgent::new(vec![Err(anyhow::anyhow!(
            "validation failed: bad prompt"
        ))]));
        let services = services_with_agent(agent);
        let mut ctx = context(&services);

        let phase = AnalysisPhase::new(services);
        let result = phase.execute(&mut ctx).await;

        assert!(!result.success);
        assert!(matches!(
            ctx.task.phase_state(AnalysisPhase::NAME),
            PhaseState::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_restore_repopulates_analysis() {
        let services = services_with_agent(Arc::new(ScriptedAgent::with_outputs(vec![])));
        let mut ctx = context(&services);
        let phase = AnalysisPhase::new(services);

        phase.restore(&mut ctx, &serde_json::json!({"analysis": "prior findings"}));
        assert_eq!(ctx.data.analysis.as_deref(), Some("prior findings"));
    }

    #[tokio::test]
    async fn test_prompt_includes_continuations() {
        let agent = Arc::new(ScriptedAgent::with_outputs(vec!["ok"]));
        let services = services_with_agent(agent.clone());
        let mut ctx = context(&services);
        ctx.task.add_continuation("must also support fuzzy matching");

        let phase = AnalysisPhase::new(services);
        phase.execute(&mut ctx).await;

        let prompts = agent.prompts.lock().unwrap();
        assert!(prompts[0].contains("fuzzy matching"));
    }
}
