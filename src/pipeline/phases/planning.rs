//! Planning phase: a planner agent proposes epics; the resolver validates,
//! splits, and conflict-checks them inside bounded retry-with-feedback
//! loops.
//!
//! Two retry counters, deliberately separate: validation failures and
//! write-set conflicts have different remediation and different
//! fatal-vs-recoverable behavior, so collapsing them into one counter
//! would silently change which exhaustion blocks orchestration.

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::agent::{AgentKind, AgentRequest};
use crate::context::{BranchKind, EnvironmentConfig, ExecutionContext, TeamComposition};
use crate::events::EventKind;
use crate::model::epic::{Epic, Story};
use crate::model::task::Usage;
use crate::pipeline::phase::{Phase, PhaseResult};
use crate::resolver::{EpicResolver, Resolution, ResolveError};
use crate::util::{epic_branch_name, extract_json_array, extract_json_object};

use super::PhaseServices;

const MAX_VALIDATION_ATTEMPTS: u32 = 3;
const MAX_CONFLICT_ATTEMPTS: u32 = 3;

/// What the planner agent is expected to return.
#[derive(Debug, Clone, Deserialize, Default)]
struct PlanProposal {
    #[serde(default)]
    epics: Vec<Epic>,
    #[serde(default)]
    stories: Vec<Story>,
    #[serde(default)]
    team: Option<TeamComposition>,
    #[serde(default)]
    environment: Option<EnvironmentConfig>,
}

pub struct PlanningPhase {
    services: PhaseServices,
}

impl PlanningPhase {
    pub const NAME: &'static str = "planning";

    pub fn new(services: PhaseServices) -> Self {
        Self { services }
    }

    fn build_prompt(ctx: &ExecutionContext, feedback: &[String]) -> String {
        let mut prompt = format!(
            "Plan the implementation of this task as a list of epics.\n\n\
             Title: {}\n\nDescription:\n{}\n",
            ctx.task.title, ctx.task.description
        );
        if let Some(analysis) = &ctx.data.analysis {
            prompt.push_str(&format!("\nAnalysis findings:\n{analysis}\n"));
        }
        if !ctx.repositories.is_empty() {
            prompt.push_str("\nRepositories and their path patterns:\n");
            for repo in &ctx.repositories {
                prompt.push_str(&format!(
                    "- {} ({}): {}\n",
                    repo.name,
                    repo.kind.as_str(),
                    repo.patterns.join(", ")
                ));
            }
        }
        prompt.push_str(
            "\nRespond with a JSON object: {\"epics\": [{\"id\", \"title\", \
             \"description\", \"filesToRead\", \"filesToModify\", \
             \"filesToCreate\", \"dependencies\", \"executionOrder\"}]}. \
             Every file path must be a concrete repository-relative path. \
             Two epics must never modify or create the same file unless one \
             depends on the other.\n",
        );
        if !feedback.is_empty() {
            prompt.push_str("\nYour previous plan was rejected. Fix ALL of these problems:\n");
            for item in feedback {
                prompt.push_str(&format!("- {item}\n"));
            }
        }
        prompt
    }

    fn parse_proposal(output: &str) -> Result<PlanProposal> {
        if let Some(object) = extract_json_object(output) {
            let proposal: PlanProposal =
                serde_json::from_str(&object).context("Planner returned malformed JSON object")?;
            if !proposal.epics.is_empty() {
                return Ok(proposal);
            }
        }
        if let Some(array) = extract_json_array(output) {
            let epics: Vec<Epic> =
                serde_json::from_str(&array).context("Planner returned malformed JSON array")?;
            if !epics.is_empty() {
                return Ok(PlanProposal {
                    epics,
                    ..Default::default()
                });
            }
        }
        anyhow::bail!("Planner output contained no epics")
    }

    /// Publish the accepted plan: shared data, events, branch registry.
    async fn record_plan(
        &self,
        ctx: &mut ExecutionContext,
        resolution: &Resolution,
        proposal: &PlanProposal,
    ) {
        ctx.data.epics = resolution.epics.clone();
        ctx.data.stories = proposal.stories.clone();
        ctx.data.team = proposal.team.clone();
        ctx.data.environment = proposal.environment.clone();

        self.services
            .append_event(
                ctx,
                EventKind::EpicsPlanned,
                AgentKind::Planner.as_str(),
                serde_json::json!({ "epics": resolution.epics }),
            )
            .await;
        if !proposal.stories.is_empty() {
            self.services
                .append_event(
                    ctx,
                    EventKind::StoriesPlanned,
                    AgentKind::Planner.as_str(),
                    serde_json::json!({ "stories": proposal.stories }),
                )
                .await;
        }
        if let Some(team) = &proposal.team {
            self.services
                .append_event(
                    ctx,
                    EventKind::TeamComposed,
                    AgentKind::Planner.as_str(),
                    serde_json::to_value(team).unwrap_or_default(),
                )
                .await;
        }
        if let Some(environment) = &proposal.environment {
            self.services
                .append_event(
                    ctx,
                    EventKind::EnvironmentConfigured,
                    AgentKind::Planner.as_str(),
                    serde_json::to_value(environment).unwrap_or_default(),
                )
                .await;
        }

        for epic in &resolution.epics {
            let branch = epic_branch_name(&epic.id, &epic.title);
            let repository = epic
                .affected_repositories
                .first()
                .cloned()
                .unwrap_or_default();
            ctx.register_branch(&branch, BranchKind::Epic, &epic.id, &repository);

            let record = ctx.branch(&branch).cloned();
            self.services
                .append_event(
                    ctx,
                    EventKind::BranchRegistered,
                    "",
                    serde_json::json!({ "branch": branch, "record": record }),
                )
                .await;

            let task_id = ctx.task.id.clone();
            let epic_id = epic.id.clone();
            let repo = repository.clone();
            let branch_owned = branch.clone();
            if let Err(err) = self
                .services
                .db
                .call(move |db| {
                    db.upsert_branch(
                        &task_id,
                        &branch_owned,
                        "epic",
                        &epic_id,
                        &repo,
                        &chrono::Utc::now().to_rfc3339(),
                    )
                })
                .await
            {
                tracing::warn!(error = %err, "failed to record branch registration");
            }
        }
    }
}

#[async_trait]
impl Phase for PlanningPhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn restore(&self, ctx: &mut ExecutionContext, output: &serde_json::Value) {
        if let Some(epics) = output.get("epics") {
            if let Ok(epics) = serde_json::from_value(epics.clone()) {
                ctx.data.epics = epics;
            }
        }
        if let Some(stories) = output.get("stories") {
            if let Ok(stories) = serde_json::from_value(stories.clone()) {
                ctx.data.stories = stories;
            }
        }
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> PhaseResult {
        let started = Instant::now();
        self.services.begin_phase(ctx, Self::NAME).await;

        // Distinct bounded retries by design (see module docs).
        let mut validation_attempts: u32 = 0;
        let mut conflict_attempts: u32 = 0;
        let mut feedback: Vec<String> = ctx.data.planning_feedback.clone();

        let mut usage = Usage::default();
        let mut cost_usd = 0.0;
        let mut session_id = None;

        let (resolution, proposal) = loop {
            let request = AgentRequest::new(
                AgentKind::Planner,
                &Self::build_prompt(ctx, &feedback),
                &self.services.workspace,
                &ctx.task.id,
            );
            let response = match self.services.invoke_agent(&request).await {
                Ok(response) => response,
                Err(err) => {
                    let message = format!("planning agent failed: {err:#}");
                    self.services.fail_phase(ctx, Self::NAME, &message).await;
                    return PhaseResult::failed(message)
                        .with_duration_ms(started.elapsed().as_millis() as u64);
                }
            };
            usage.add(response.usage);
            cost_usd += response.cost_usd;
            session_id = response.session_id.clone();

            let proposal = match Self::parse_proposal(&response.output) {
                Ok(proposal) => proposal,
                Err(err) => {
                    validation_attempts += 1;
                    if validation_attempts >= MAX_VALIDATION_ATTEMPTS {
                        let message = format!(
                            "planner produced no usable epics after {MAX_VALIDATION_ATTEMPTS} attempts: {err:#}"
                        );
                        self.services.fail_phase(ctx, Self::NAME, &message).await;
                        return PhaseResult::failed(message)
                            .with_fatal()
                            .with_duration_ms(started.elapsed().as_millis() as u64);
                    }
                    feedback.push(format!("{err:#}; respond with the JSON shape requested"));
                    continue;
                }
            };

            let resolver = EpicResolver::new(&ctx.repositories);
            match resolver.resolve(proposal.epics.clone()) {
                Ok(resolution) => break (resolution, proposal),
                Err(err @ ResolveError::Validation { .. }) => {
                    validation_attempts += 1;
                    if validation_attempts >= MAX_VALIDATION_ATTEMPTS {
                        let message = format!("epic validation unresolved after {MAX_VALIDATION_ATTEMPTS} attempts: {err}");
                        self.services.fail_phase(ctx, Self::NAME, &message).await;
                        // Zero-file failures block orchestration outright;
                        // placeholder-only exhaustion is surfaced and left
                        // to the caller's stop_on_failure policy.
                        let result = PhaseResult::failed(message)
                            .with_duration_ms(started.elapsed().as_millis() as u64);
                        return if err.is_blocking() {
                            result.with_fatal()
                        } else {
                            result
                        };
                    }
                    feedback.extend(err.feedback());
                }
                Err(err @ ResolveError::Conflict { .. }) => {
                    conflict_attempts += 1;
                    if conflict_attempts >= MAX_CONFLICT_ATTEMPTS {
                        // Parallel epics writing the same file are never
                        // allowed to proceed.
                        let message = format!("file conflicts unresolved after {MAX_CONFLICT_ATTEMPTS} attempts: {err}");
                        self.services.fail_phase(ctx, Self::NAME, &message).await;
                        return PhaseResult::failed(message)
                            .with_fatal()
                            .with_duration_ms(started.elapsed().as_millis() as u64);
                    }
                    feedback.extend(err.feedback());
                }
            }
        };

        ctx.data.planning_feedback = feedback;
        self.record_plan(ctx, &resolution, &proposal).await;

        let warnings: Vec<String> = resolution.warnings.iter().map(ToString::to_string).collect();
        let output = serde_json::json!({
            "epics": resolution.epics,
            "stories": proposal.stories,
        });
        let metrics = self
            .services
            .complete_phase(ctx, Self::NAME, output.clone(), session_id, usage, cost_usd)
            .await;

        PhaseResult::ok(output)
            .with_warnings(warnings)
            .with_metrics(metrics)
            .with_duration_ms(started.elapsed().as_millis() as u64)
    }
}
