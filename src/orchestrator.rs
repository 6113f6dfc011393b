//! Top-level orchestration: wires storage, capabilities, recovery, and the
//! phase pipeline together for one task run.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::{AgentInvoker, CliAgentInvoker};
use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::db::{Db, DbHandle};
use crate::events::{EventKind, EventStore};
use crate::lock::TaskLock;
use crate::model::task::{Priority, Task, TaskStatus};
use crate::notify::Notifier;
use crate::pipeline::phases::{
    AnalysisPhase, DevelopmentPhase, PhaseServices, PlanningPhase, ReviewPhase,
};
use crate::pipeline::{Pipeline, PipelineReport};
use crate::recovery::RecoveryManager;
use crate::retry::CircuitBreaker;
use crate::vcs::{GitCli, VersionControl};

pub struct Orchestrator {
    config: Config,
    db: DbHandle,
    events: EventStore,
    checkpoints: CheckpointStore,
    agent: Arc<dyn AgentInvoker>,
    vcs: Arc<dyn VersionControl>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    /// Build an orchestrator with the default capability adapters.
    pub fn new(config: Config, notifier: Arc<dyn Notifier>) -> Result<Self> {
        config.ensure_directories()?;
        let db = DbHandle::new(Db::open(&config.db_path)?);
        let agent: Arc<dyn AgentInvoker> = Arc::new(CliAgentInvoker::new(
            &config.agent_cmd,
            config.agent_timeout,
        ));
        let vcs: Arc<dyn VersionControl> = Arc::new(GitCli::new(&config.project_dir));
        Ok(Self::with_capabilities(config, db, agent, vcs, notifier))
    }

    /// Build with explicit capability implementations (tests, embedding).
    pub fn with_capabilities(
        config: Config,
        db: DbHandle,
        agent: Arc<dyn AgentInvoker>,
        vcs: Arc<dyn VersionControl>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            events: EventStore::new(db.clone()),
            checkpoints: CheckpointStore::new(db.clone()),
            config,
            db,
            agent,
            vcs,
            notifier,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    /// Create and persist a new task.
    pub async fn submit(
        &self,
        title: &str,
        description: &str,
        priority: Priority,
        repositories: Vec<String>,
    ) -> Result<Task> {
        let task = Task::new(title, description, priority, repositories);
        let stored = task.clone();
        self.db.call(move |db| db.insert_task(&stored)).await?;
        self.events
            .append(
                &task.id,
                EventKind::TaskCreated,
                "",
                serde_json::json!({ "title": task.title, "priority": task.priority }),
                None,
            )
            .await?;
        Ok(task)
    }

    /// Append requirements to a task, forcing phases to re-run.
    pub async fn continue_task(&self, task_id: &str, requirements: &str) -> Result<Task> {
        let mut task = self.load_task(task_id).await?;
        task.add_continuation(requirements);
        if task.status.is_terminal() {
            task.status = TaskStatus::Queued;
        }
        let stored = task.clone();
        self.db.call(move |db| db.update_task(&stored)).await?;
        self.events
            .append(
                task_id,
                EventKind::ContinuationAdded,
                "",
                serde_json::json!({ "requirements": requirements }),
                None,
            )
            .await?;
        Ok(task)
    }

    /// Record an external approval so a paused run can resume.
    pub async fn approve(&self, task_id: &str) -> Result<()> {
        let mut task = self.load_task(task_id).await?;
        self.events
            .append(task_id, EventKind::ApprovalGranted, "", serde_json::json!({}), None)
            .await?;
        if task.status == TaskStatus::Paused {
            task.status = TaskStatus::Queued;
            let stored = task.clone();
            self.db.call(move |db| db.update_task(&stored)).await?;
        }
        Ok(())
    }

    /// Run (or resume) the pipeline for a task.
    pub async fn run(&self, task_id: &str) -> Result<PipelineReport> {
        // Single-writer discipline: one pipeline run per task id.
        let _lock = TaskLock::acquire(&self.config.lock_dir, task_id)?;

        let mut task = self.load_task(task_id).await?;

        // Cancellation is an external status change, checked before
        // re-entering the pipeline. There is no mid-phase preemption.
        if task.status == TaskStatus::Cancelled {
            anyhow::bail!("task {task_id} is cancelled");
        }
        if task.status == TaskStatus::Completed && !task.has_unprocessed_continuations() {
            anyhow::bail!("task {task_id} is already completed; add a continuation to re-run");
        }

        task.status = TaskStatus::Running;
        let stored = task.clone();
        self.db.call(move |db| db.update_task(&stored)).await?;

        let repositories = self.config.repositories_for(&task.repositories);
        let mut ctx = ExecutionContext::new(task, repositories);

        let recovery = RecoveryManager::new(
            self.events.clone(),
            self.checkpoints.clone(),
            self.db.clone(),
        );
        let outcome = recovery.recover(&mut ctx).await?;
        tracing::info!(task_id, source = outcome.source_name(), "recovery complete");

        let pipeline = self.build_pipeline();
        let report = pipeline.execute(&mut ctx).await;

        self.finish(&mut ctx, &report).await;
        Ok(report)
    }

    fn build_pipeline(&self) -> Pipeline {
        let services = PhaseServices {
            agent: self.agent.clone(),
            vcs: self.vcs.clone(),
            db: self.db.clone(),
            events: self.events.clone(),
            notifier: self.notifier.clone(),
            retry: self.config.retry.clone(),
            breaker: Arc::new(CircuitBreaker::default()),
            workspace: self.config.project_dir.clone(),
            require_approval: self.config.require_approval,
        };
        Pipeline::new(
            vec![
                Box::new(AnalysisPhase::new(services.clone())),
                Box::new(PlanningPhase::new(services.clone())),
                Box::new(DevelopmentPhase::new(services.clone())),
                Box::new(ReviewPhase::new(services.clone(), 3)),
            ],
            self.notifier.clone(),
        )
        .with_checkpoints(self.checkpoints.clone())
    }

    /// Persist the terminal (or paused) status and clear the checkpoint on
    /// terminal outcomes. Events are permanent history and stay put.
    async fn finish(&self, ctx: &mut ExecutionContext, report: &PipelineReport) {
        ctx.task.status = if report.paused_for_approval {
            TaskStatus::Paused
        } else if report.success {
            // Continuations are only considered folded in once the whole
            // pipeline ran to success with them; marking them earlier would
            // let downstream phases skip the re-run they exist to force.
            ctx.task.mark_continuations_processed();
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let stored = ctx.task.clone();
        if let Err(err) = self.db.call(move |db| db.update_task(&stored)).await {
            tracing::error!(task_id = %ctx.task.id, error = %err, "failed to persist final task status");
        }

        if ctx.task.status.is_terminal() {
            if let Err(err) = self.checkpoints.clear(&ctx.task.id).await {
                tracing::warn!(task_id = %ctx.task.id, error = %err, "failed to clear checkpoint");
            }
            if let Err(err) = self
                .events
                .append(
                    &ctx.task.id,
                    EventKind::CheckpointCleared,
                    "",
                    serde_json::json!({ "status": ctx.task.status }),
                    None,
                )
                .await
            {
                tracing::warn!(task_id = %ctx.task.id, error = %err, "failed to journal checkpoint clear");
            }
        }
    }

    async fn load_task(&self, task_id: &str) -> Result<Task> {
        let id = task_id.to_string();
        self.db
            .call(move |db| db.get_task(&id))
            .await?
            .with_context(|| format!("task {task_id} not found"))
    }
}
