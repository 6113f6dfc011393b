//! Development phase: one developer agent per epic, executed wave by wave.
//!
//! Waves are groups of epics whose dependencies are all satisfied by
//! earlier waves. Within a wave every epic runs concurrently on its own
//! branch; outcomes are collected with an all-settled join so one failed
//! epic never silently aborts its siblings. Each failure is classified
//! independently before the phase decides success.

use std::collections::HashSet;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;

use crate::agent::{AgentKind, AgentRequest};
use crate::context::ExecutionContext;
use crate::errors::classify_error;
use crate::model::epic::Epic;
use crate::model::task::Usage;
use crate::pipeline::phase::{Phase, PhaseResult};
use crate::util::epic_branch_name;

use super::PhaseServices;

pub struct DevelopmentPhase {
    services: PhaseServices,
}

/// Outcome of one epic's developer run.
struct EpicOutcome {
    epic_id: String,
    branch: String,
    result: anyhow::Result<(Usage, f64, Option<String>)>,
}

impl DevelopmentPhase {
    pub const NAME: &'static str = "development";

    pub fn new(services: PhaseServices) -> Self {
        Self { services }
    }

    /// Group epics into dependency-ordered waves. Dependencies on ids
    /// outside the set are treated as already satisfied (they completed in
    /// an earlier run). A cycle leaves epics unplaceable and is an error.
    fn compute_waves(epics: &[Epic]) -> Result<Vec<Vec<Epic>>, String> {
        let known: HashSet<&str> = epics.iter().map(|e| e.id.as_str()).collect();
        let mut done: HashSet<String> = HashSet::new();
        let mut remaining: Vec<&Epic> = epics.iter().collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&Epic>, Vec<&Epic>) = remaining.iter().partition(|e| {
                e.dependencies
                    .iter()
                    .all(|d| done.contains(d) || !known.contains(d.as_str()))
            });
            if ready.is_empty() {
                let stuck: Vec<&str> = blocked.iter().map(|e| e.id.as_str()).collect();
                return Err(format!(
                    "dependency cycle among epics: {}",
                    stuck.join(", ")
                ));
            }
            for epic in &ready {
                done.insert(epic.id.clone());
            }
            waves.push(ready.into_iter().cloned().collect());
            remaining = blocked;
        }
        Ok(waves)
    }

    fn build_prompt(ctx: &ExecutionContext, epic: &Epic) -> String {
        let mut prompt = format!(
            "Implement this unit of work on the current branch.\n\n\
             Epic: {}\n{}\n\nFiles to read first:\n{}\nFiles to modify:\n{}\nFiles to create:\n{}\n",
            epic.title,
            epic.description,
            format_paths(&epic.files_to_read),
            format_paths(&epic.files_to_modify),
            format_paths(&epic.files_to_create),
        );
        if let Some(contract) = &epic.contract {
            prompt.push_str(&format!("\nShared contract:\n{contract}\n"));
        }
        if let Some(analysis) = &ctx.data.analysis {
            prompt.push_str(&format!("\nTask analysis:\n{analysis}\n"));
        }
        prompt.push_str("\nStay strictly within the listed files.\n");
        prompt
    }

    /// Run one epic: branch, invoke the developer agent, commit.
    async fn run_epic(
        services: PhaseServices,
        workspace: std::path::PathBuf,
        task_id: String,
        prompt: String,
        epic: Epic,
    ) -> EpicOutcome {
        let branch = epic_branch_name(&epic.id, &epic.title);
        let repo_dir = match epic.affected_repositories.first() {
            Some(name) => workspace.join(name),
            None => workspace.clone(),
        };

        let result = async {
            services.vcs.create_branch(&repo_dir, &branch).await?;

            let mut request = AgentRequest::new(AgentKind::Developer, &prompt, &repo_dir, &task_id);
            request.display_name = format!("developer:{}", epic.id);
            let response = services.invoke_agent(&request).await?;

            services
                .vcs
                .commit_all(&repo_dir, &format!("{}: {}", epic.id, epic.title))
                .await?;

            Ok((response.usage, response.cost_usd, response.session_id))
        }
        .await;

        EpicOutcome {
            epic_id: epic.id,
            branch,
            result,
        }
    }
}

fn format_paths(paths: &[String]) -> String {
    if paths.is_empty() {
        return "- (none)\n".to_string();
    }
    paths.iter().map(|p| format!("- {p}\n")).collect()
}

#[async_trait]
impl Phase for DevelopmentPhase {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> PhaseResult {
        let started = Instant::now();
        self.services.begin_phase(ctx, Self::NAME).await;

        let epics = ctx.data.epics.clone();
        if epics.is_empty() {
            let message = "no epics available; planning produced nothing to execute";
            self.services.fail_phase(ctx, Self::NAME, message).await;
            return PhaseResult::failed(message)
                .with_duration_ms(started.elapsed().as_millis() as u64);
        }

        let waves = match Self::compute_waves(&epics) {
            Ok(waves) => waves,
            Err(message) => {
                self.services.fail_phase(ctx, Self::NAME, &message).await;
                return PhaseResult::failed(message)
                    .with_duration_ms(started.elapsed().as_millis() as u64);
            }
        };

        let mut usage = Usage::default();
        let mut cost_usd = 0.0;
        let mut completed: Vec<String> = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        for (wave_index, wave) in waves.iter().enumerate() {
            self.services.notifier.phase_progress(
                &ctx.task.id,
                Self::NAME,
                &format!("wave {} with {} epic(s)", wave_index, wave.len()),
            );

            let handles: Vec<_> = wave
                .iter()
                .map(|epic| {
                    tokio::spawn(Self::run_epic(
                        self.services.clone(),
                        self.services.workspace.clone(),
                        ctx.task.id.clone(),
                        Self::build_prompt(ctx, epic),
                        epic.clone(),
                    ))
                })
                .collect();

            // All-settled: every sibling finishes before the wave is judged.
            for joined in join_all(handles).await {
                match joined {
                    Ok(outcome) => match outcome.result {
                        Ok((epic_usage, epic_cost, _session)) => {
                            usage.add(epic_usage);
                            cost_usd += epic_cost;
                            completed.push(outcome.epic_id);
                        }
                        Err(err) => {
                            let classified = classify_error(&err);
                            failures.push(format!(
                                "epic {} on {} failed ({}): {err:#}",
                                outcome.epic_id,
                                outcome.branch,
                                classified.kind.as_str()
                            ));
                        }
                    },
                    Err(join_err) => {
                        failures.push(format!("epic worker panicked: {join_err}"));
                    }
                }
            }

            // A failed wave stops here; later waves depend on it.
            if !failures.is_empty() {
                break;
            }
        }

        let output = serde_json::json!({
            "completed_epics": completed,
            "failures": failures,
        });

        if !failures.is_empty() {
            let message = failures.join("; ");
            self.services.fail_phase(ctx, Self::NAME, &message).await;
            return PhaseResult::failed(message)
                .with_duration_ms(started.elapsed().as_millis() as u64);
        }

        let metrics = self
            .services
            .complete_phase(ctx, Self::NAME, output.clone(), None, usage, cost_usd)
            .await;

        PhaseResult::ok(output)
            .with_metrics(metrics)
            .with_duration_ms(started.elapsed().as_millis() as u64)
    }
}
